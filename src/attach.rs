//! Host-side attach driver.
//!
//! Puts the local terminal into raw mode, obtains the container's console
//! or tty master through the command channel, becomes a session leader,
//! and pumps bytes in a descriptor loop until the detach escape fires,
//! the master reaches EOF, or an I/O error surfaces. Teardown unwinds in
//! reverse acquisition order; the termios guard restores the terminal on
//! every exit path.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::unistd::{isatty, setsid};

use crate::commands::CommandClient;
use crate::console::tracker::{EscapeAction, EscapeState, TtyState};
use crate::console::{read_fd, write_fd};
use crate::error::ConsoleError;
use crate::log::{log_debug, log_info};
use crate::mainloop::{Mainloop, Verdict};
use crate::terminal::RawModeGuard;

/// Default detach prefix: Ctrl-A.
pub const DEFAULT_ESCAPE: u8 = 1;

/// Attach the calling terminal to a container console or tty.
///
/// `ttynum` uses the wire encoding: 0 for the console, positive for a
/// specific tty, negative for any free one. `escape` is the detach prefix
/// byte in `1..=26` (Ctrl-A is 1). Returns when the user detaches or the
/// container side goes away; errors cover setup and I/O failures.
pub fn attach(
    container: &str,
    base_dir: &Path,
    ttynum: i32,
    escape: u8,
) -> Result<(), ConsoleError> {
    let stdinfd = libc::STDIN_FILENO;
    let stdoutfd = libc::STDOUT_FILENO;

    // SAFETY: stdin outlives the process; the borrow is for one check.
    if !isatty(unsafe { BorrowedFd::borrow_raw(stdinfd) }).unwrap_or(false) {
        return Err(ConsoleError::NotATty(stdinfd));
    }

    let _term = RawModeGuard::new(stdinfd)?;

    let grant = CommandClient::new(container, base_dir).console_request(ttynum)?;
    let masterfd = grant.master.as_raw_fd();
    log_debug(
        "attach",
        "grant",
        &format!("tty {} master fd {}", grant.ttynum, masterfd),
    );

    eprint!("{}", banner(grant.ttynum, escape));

    // Advisory; failing because we already lead a session is fine.
    if setsid().is_err() {
        log_info("attach", "setsid", "already a session leader");
    }

    let mut ts = TtyState::init(stdinfd, masterfd)?;
    ts.stdoutfd = stdoutfd;
    ts.escape = EscapeState::new(escape);
    ts.set_winch_proxy(container, base_dir);
    // Push our geometry before any bytes flow, and hint the supervisor.
    ts.notify_winch();

    let sigfd = ts.sigfd();
    let state = Arc::new(Mutex::new(ts));

    let mut ml = Mainloop::new();
    let s = Arc::clone(&state);
    ml.add_handler(sigfd, Box::new(move |_, _| s.lock().unwrap().handle_signal()));
    let s = Arc::clone(&state);
    ml.add_handler(stdinfd, Box::new(move |_, _| stdin_pump(&s)));
    let s = Arc::clone(&state);
    ml.add_handler(masterfd, Box::new(move |_, _| master_pump(&s)));

    let result = ml.run(-1);

    // Reverse order of acquisition: loop, tracker (mask restore), then
    // the grant's master and control socket; the termios guard last.
    drop(ml);
    drop(state);
    drop(grant);
    result
}

/// The connect banner, byte-exact: tty number, then the detach recipe.
fn banner(ttynum: usize, escape: u8) -> String {
    let letter = (b'a' + escape - 1) as char;
    format!(
        "\nConnected to tty {0}\nType <Ctrl+{1} q> to exit the console, \
         <Ctrl+{1} Ctrl+{1}> to enter Ctrl+{1} itself\n",
        ttynum, letter
    )
}

/// One keystroke from the client terminal: run the detach state machine,
/// forward anything that survives it to the master.
fn stdin_pump(state: &Arc<Mutex<TtyState>>) -> Result<Verdict, ConsoleError> {
    let mut ts = state.lock().unwrap();

    let mut byte = [0u8; 1];
    match read_fd(ts.stdinfd, &mut byte) {
        Ok(0) => return Ok(Verdict::Terminate), // terminal gone
        Ok(_) => {}
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(Verdict::Continue),
        Err(e) => {
            return Err(ConsoleError::ReadFailed {
                fd: ts.stdinfd,
                source: e,
            });
        }
    }

    match ts.escape.feed(byte[0]) {
        EscapeAction::Consume => Ok(Verdict::Continue),
        EscapeAction::Detach => Ok(Verdict::Terminate),
        EscapeAction::Forward(b) => match write_fd(ts.masterfd, &[b]) {
            Ok(_) => Ok(Verdict::Continue),
            Err(e) => Err(ConsoleError::LoopIo(e)),
        },
    }
}

/// Container output to the client terminal. EOF or EIO on the master is
/// the container going away: a clean detach. A starved stdout is fatal -
/// there is no one left to watch the session.
fn master_pump(state: &Arc<Mutex<TtyState>>) -> Result<Verdict, ConsoleError> {
    let ts = state.lock().unwrap();

    let mut buf = [0u8; 1024];
    let r = match read_fd(ts.masterfd, &mut buf) {
        Ok(0) => return Ok(Verdict::Terminate),
        Ok(n) => n,
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(Verdict::Continue),
        Err(Errno::EIO) => return Ok(Verdict::Terminate),
        Err(e) => {
            return Err(ConsoleError::ReadFailed {
                fd: ts.masterfd,
                source: e,
            });
        }
    };

    match write_fd(ts.stdoutfd, &buf[..r]) {
        Ok(w) if w == r => Ok(Verdict::Continue),
        Ok(w) => Err(ConsoleError::WriteShort { read: r, wrote: w }),
        Err(e) => Err(ConsoleError::LoopIo(e)),
    }
}
