//! Client side of the per-container command channel.
//!
//! The container supervisor listens on `<base>/<name>/command.sock`.
//! Requests are a single JSON line; the console grant response is one
//! message whose payload is JSON and whose ancillary data carries the
//! granted pty master as SCM_RIGHTS. The control socket stays open for
//! the whole attach - its closure is the supervisor's cue to free the
//! slot.

use std::io::{IoSlice, IoSliceMut, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use nix::cmsg_space;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};
use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;
use crate::log::{log_debug, log_warn};
use crate::paths;

pub const PROTOCOL_VERSION: u32 = 1;

/// Operations a client can ask of the supervisor.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Allocate the console or a tty; the reply carries the master fd.
    Console,
    /// Fire-and-forget: the attached client's window geometry changed.
    Winch,
}

/// One request line on the command socket.
#[derive(Serialize, Deserialize, Debug)]
pub struct Request {
    pub version: u32,
    pub op: Op,
    /// Wire tty selector: 0 console, positive a specific slot, negative
    /// any free slot. Absent for operations that take no slot.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ttynum: Option<i32>,
}

/// Reply payload of a console request.
#[derive(Serialize, Deserialize, Debug)]
pub struct Reply {
    /// The granted slot, 1-based; 0 for the console.
    pub ttynum: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// A granted console or tty.
///
/// Owns the passed-in master descriptor and the control socket. Dropping
/// the grant closes the socket, which the supervisor treats as detach.
#[derive(Debug)]
pub struct ConsoleGrant {
    pub ttynum: usize,
    pub master: OwnedFd,
    control: UnixStream,
}

impl ConsoleGrant {
    /// The control socket descriptor (the identity the supervisor tracks
    /// slot ownership under).
    pub fn control_fd(&self) -> RawFd {
        self.control.as_raw_fd()
    }
}

/// Command-channel client for one container.
pub struct CommandClient {
    container: String,
    base_dir: PathBuf,
}

impl CommandClient {
    pub fn new(container: &str, base_dir: &Path) -> Self {
        Self {
            container: container.to_string(),
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn connect(&self) -> Result<UnixStream, ConsoleError> {
        let path = paths::command_socket(&self.base_dir, &self.container);
        UnixStream::connect(&path).map_err(|e| {
            ConsoleError::CommandChannel(format!("connect {}: {}", path.display(), e))
        })
    }

    /// Request the console (`ttynum == 0`), a specific tty, or any free
    /// tty (`ttynum < 0`) from the container's supervisor.
    pub fn console_request(&self, ttynum: i32) -> Result<ConsoleGrant, ConsoleError> {
        let mut stream = self.connect()?;
        request_console_on(&mut stream, ttynum)
    }

    /// Tell the supervisor the attached client's window changed, so it can
    /// refresh the geometry of any proxy it holds. Fire-and-forget.
    pub fn console_winch(&self) -> Result<(), ConsoleError> {
        let mut stream = self.connect()?;
        send_request(
            &mut stream,
            &Request {
                version: PROTOCOL_VERSION,
                op: Op::Winch,
                ttynum: None,
            },
        )
    }
}

/// Winch hint that never fails the caller: a supervisor that went away
/// mid-session costs a warning, not the session.
pub fn notify_winch(container: &str, base_dir: &Path) {
    match CommandClient::new(container, base_dir).console_winch() {
        Ok(()) => log_debug("commands", "winch.sent", container),
        Err(e) => log_warn("commands", "winch.failed", &format!("{}: {}", container, e)),
    }
}

fn send_request(stream: &mut UnixStream, request: &Request) -> Result<(), ConsoleError> {
    let mut line = serde_json::to_string(request)
        .map_err(|e| ConsoleError::CommandChannel(format!("encode request: {}", e)))?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .map_err(|e| ConsoleError::CommandChannel(format!("send request: {}", e)))
}

/// Run a console request on an already-connected control socket and
/// consume the grant reply.
pub fn request_console_on(
    stream: &mut UnixStream,
    ttynum: i32,
) -> Result<ConsoleGrant, ConsoleError> {
    send_request(
        stream,
        &Request {
            version: PROTOCOL_VERSION,
            op: Op::Console,
            ttynum: Some(ttynum),
        },
    )?;

    let mut buf = [0u8; 512];
    let (bytes, mut fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg = cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(|e| ConsoleError::CommandChannel(format!("receive grant: {}", e)))?;

        let mut fds = Vec::new();
        let cmsgs = msg
            .cmsgs()
            .map_err(|e| ConsoleError::CommandChannel(format!("grant ancillary data: {}", e)))?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                for fd in raw {
                    // SAFETY: the kernel installed these descriptors into
                    // our table for this message; we are their first and
                    // only owner.
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }
        (msg.bytes, fds)
    };

    if bytes == 0 {
        return Err(ConsoleError::CommandChannel(
            "supervisor closed the command socket".to_string(),
        ));
    }

    let reply: Reply = serde_json::from_slice(&buf[..bytes])
        .map_err(|e| ConsoleError::CommandChannel(format!("decode grant: {}", e)))?;

    if let Some(error) = reply.error {
        return Err(ConsoleError::CommandChannel(error));
    }
    let master = fds.pop().ok_or_else(|| {
        ConsoleError::CommandChannel("grant carried no master descriptor".to_string())
    })?;

    Ok(ConsoleGrant {
        ttynum: reply.ttynum.max(0) as usize,
        master,
        control: stream
            .try_clone()
            .map_err(|e| ConsoleError::CommandChannel(format!("clone control socket: {}", e)))?,
    })
}

/// Supervisor-side: send a console grant (or an error reply) with the
/// slot master as ancillary data.
pub fn send_grant(
    stream: &UnixStream,
    reply: &Reply,
    master: Option<BorrowedFd<'_>>,
) -> Result<(), ConsoleError> {
    let payload = serde_json::to_vec(reply)
        .map_err(|e| ConsoleError::CommandChannel(format!("encode grant: {}", e)))?;
    let iov = [IoSlice::new(&payload)];
    let raw_fds;
    let cmsgs: Vec<ControlMessage> = match &master {
        Some(fd) => {
            raw_fds = [fd.as_raw_fd()];
            vec![ControlMessage::ScmRights(&raw_fds)]
        }
        None => Vec::new(),
    };
    sendmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(|e| ConsoleError::CommandChannel(format!("send grant: {}", e)))?;
    Ok(())
}

/// Supervisor-side: read one request line off the command socket.
pub fn read_request(stream: &mut UnixStream) -> Result<Request, ConsoleError> {
    use std::io::{BufRead, BufReader};
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| ConsoleError::CommandChannel(format!("read request: {}", e)))?;
    serde_json::from_str(&line)
        .map_err(|e| ConsoleError::CommandChannel(format!("decode request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn request_round_trips_as_json() {
        let request = Request {
            version: PROTOCOL_VERSION,
            op: Op::Console,
            ttynum: Some(-1),
        };
        let line = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.op, Op::Console);
        assert_eq!(decoded.ttynum, Some(-1));
    }

    #[test]
    fn winch_request_omits_ttynum() {
        let request = Request {
            version: PROTOCOL_VERSION,
            op: Op::Winch,
            ttynum: None,
        };
        let line = serde_json::to_string(&request).unwrap();
        assert!(!line.contains("ttynum"));
    }

    #[test]
    fn console_grant_passes_master_descriptor() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let pty = nix::pty::openpty(None, None).unwrap();
        let master = pty.master;
        let slave = pty.slave;

        let server_thread = std::thread::spawn(move || {
            let request = read_request(&mut server).unwrap();
            assert_eq!(request.op, Op::Console);
            assert_eq!(request.ttynum, Some(0));
            send_grant(
                &server,
                &Reply {
                    ttynum: 0,
                    error: None,
                },
                Some(master.as_fd()),
            )
            .unwrap();
            // Hold the server end until the client has consumed the grant.
            server
        });

        let grant = request_console_on(&mut client, 0).unwrap();
        assert_eq!(grant.ttynum, 0);
        // A new descriptor in this process, not the server's number.
        assert!(grant.master.as_raw_fd() >= 0);

        // The passed descriptor refers to the same pty: bytes written to
        // its slave surface on the received master.
        crate::terminal::raw_mode(slave.as_raw_fd()).unwrap();
        nix::unistd::write(&slave, b"ok").unwrap();
        let mut buf = [0u8; 8];
        let n = nix::unistd::read(grant.master.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ok");

        drop(grant);
        server_thread.join().unwrap();
    }

    #[test]
    fn error_reply_surfaces_as_command_channel_error() {
        let (mut client, mut server) = UnixStream::pair().unwrap();

        let server_thread = std::thread::spawn(move || {
            read_request(&mut server).unwrap();
            send_grant(
                &server,
                &Reply {
                    ttynum: 0,
                    error: Some("console or tty already in use".to_string()),
                },
                None,
            )
            .unwrap();
        });

        let err = request_console_on(&mut client, 0).unwrap_err();
        match err {
            ConsoleError::CommandChannel(msg) => assert!(msg.contains("in use")),
            other => panic!("unexpected error {:?}", other),
        }
        server_thread.join().unwrap();
    }

    #[test]
    fn closed_supervisor_socket_is_an_error() {
        let (mut client, server) = UnixStream::pair().unwrap();
        drop(server);

        let err = request_console_on(&mut client, 0).unwrap_err();
        assert!(matches!(err, ConsoleError::CommandChannel(_)));
    }
}
