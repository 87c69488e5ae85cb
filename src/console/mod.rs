//! Container console and tty allocation.
//!
//! A container owns one console pty pair (its stdio) plus N pre-created
//! tty slots. A remote attach to the console gets a proxy pty: the proxy
//! slave becomes the console's local peer, the proxy master is handed to
//! the client, and the event loop shuttles bytes between proxy and
//! container master while mirroring container output to the session log.
//!
//! Components:
//! - Console: pty pair, peer terminal, log, proxy state
//! - ConsoleSet: console + tty slots, allocate/free arbitration
//! - console_pump: the container-side byte pump callback

pub mod tracker;

use std::fs::OpenOptions;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::pty::openpty;
use nix::sys::termios::Termios;
use nix::unistd::{isatty, read, write};

use crate::error::ConsoleError;
use crate::log::{log_debug, log_info, log_warn};
use crate::mainloop::{LoopHandle, Mainloop, Verdict};
use crate::terminal;
use tracker::TtyState;

/// openpty(3) walks process-global pty state; serialize it so concurrent
/// allocations (console create vs. attach) cannot race.
static OPENPTY_LOCK: Mutex<()> = Mutex::new(());

const PUMP_BUF: usize = 1024;

/// One-shot read on a raw descriptor.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    // SAFETY: the descriptor is owned by the session structure whose
    // callback we are running in; it stays open for the call.
    read(unsafe { BorrowedFd::borrow_raw(fd) }, buf)
}

/// One-shot write on a raw descriptor.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    // SAFETY: as in read_fd.
    write(unsafe { BorrowedFd::borrow_raw(fd) }, buf)
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), Errno> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Errno> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map(drop)
}

fn pts_name(master: &OwnedFd) -> Result<String, Errno> {
    let mut buf = [0u8; 64];
    // SAFETY: ptsname_r writes a NUL-terminated path of at most buf.len()
    // bytes; the return value is the errno, checked below.
    let ret = unsafe { libc::ptsname_r(master.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return Err(Errno::from_raw(ret));
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Allocate a close-on-exec pty pair, returning (master, slave, slave path).
fn new_pty() -> Result<(OwnedFd, OwnedFd, String), ConsoleError> {
    let _guard = OPENPTY_LOCK.lock().unwrap();
    let pty = openpty(None, None).map_err(ConsoleError::PtyAlloc)?;
    set_cloexec(&pty.master).map_err(ConsoleError::PtyAlloc)?;
    set_cloexec(&pty.slave).map_err(ConsoleError::PtyAlloc)?;
    let name = pts_name(&pty.master).map_err(ConsoleError::PtyAlloc)?;
    Ok((pty.master, pty.slave, name))
}

/// Where the console's local peer terminal comes from.
#[derive(Clone, Debug)]
pub enum PeerSource {
    /// No path configured: probe /dev/tty, absence is fine (daemonized).
    Auto,
    /// The configured literal "none": do not create a console at all.
    Disabled,
    /// An explicit terminal path to mirror the console to.
    Path(PathBuf),
}

impl PeerSource {
    /// Interpret the console path configuration value.
    pub fn from_config(path: Option<&str>) -> Self {
        match path {
            None => PeerSource::Auto,
            Some("none") => PeerSource::Disabled,
            Some(p) => PeerSource::Path(PathBuf::from(p)),
        }
    }
}

/// Console configuration supplied by the container's config loader.
#[derive(Clone, Debug)]
pub struct ConsoleSettings {
    pub peer: PeerSource,
    /// Append-only raw byte log of container output, when set.
    pub log_path: Option<PathBuf>,
}

/// The console's current local peer terminal.
enum Peer {
    None,
    /// A host terminal opened from the configured path (or /dev/tty),
    /// with its saved termios for restore-on-teardown.
    Terminal { fd: OwnedFd, tios: Termios },
    /// The slave of the attach proxy pty is acting as peer.
    Proxy,
}

/// Proxy pty state while a remote client is attached to the console.
struct ProxyPty {
    master: OwnedFd,
    slave: OwnedFd,
    #[allow(dead_code)] // reported to clients over the command channel
    name: String,
    /// Control-socket fd of the owning client.
    busy: RawFd,
}

/// A container's console: its pty pair, optional peer terminal and log,
/// and the proxy state for remote attach.
pub struct Console {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    name: String,
    peer: Peer,
    log_fd: Option<OwnedFd>,
    proxy: Option<ProxyPty>,
    tty_state: Option<TtyState>,
    /// Back-reference to the loop dispatching this console's descriptors,
    /// so attach can wire the proxy peer in. Established at registration.
    loop_handle: Option<LoopHandle>,
}

impl Console {
    /// Realize the console from its configuration.
    ///
    /// `PeerSource::Disabled` succeeds but creates no pty; a later console
    /// attach is refused with `NotConfigured`. Peer terminal setup is
    /// best-effort: an unopenable or non-tty peer path leaves the console
    /// without a local mirror.
    pub fn create(settings: &ConsoleSettings) -> Result<Console, ConsoleError> {
        if matches!(settings.peer, PeerSource::Disabled) {
            log_info("console", "create.disabled", "console disabled by configuration");
            return Ok(Console::unconfigured());
        }

        let (master, slave, name) = new_pty()?;
        set_nonblocking(&master).map_err(ConsoleError::PtyAlloc)?;

        let mut console = Console {
            master: Some(master),
            slave: Some(slave),
            name,
            peer: Peer::None,
            log_fd: None,
            proxy: None,
            tty_state: None,
            loop_handle: None,
        };

        console.setup_default_peer(&settings.peer);

        if let Some(path) = &settings.log_path {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o600)
                .custom_flags(libc::O_CLOEXEC)
                .open(path)
                .map_err(|source| ConsoleError::LogOpen {
                    path: path.clone(),
                    source,
                })?;
            log_debug(
                "console",
                "log.open",
                &format!("using '{}' as console log", path.display()),
            );
            console.log_fd = Some(OwnedFd::from(file));
        }

        Ok(console)
    }

    fn unconfigured() -> Console {
        Console {
            master: None,
            slave: None,
            name: String::new(),
            peer: Peer::None,
            log_fd: None,
            proxy: None,
            tty_state: None,
            loop_handle: None,
        }
    }

    /// Open the local peer terminal: the configured path, or the current
    /// controlling terminal if there is one. Never fatal - a daemonized
    /// supervisor simply has no peer.
    fn setup_default_peer(&mut self, source: &PeerSource) {
        let path = match source {
            PeerSource::Path(p) => p.clone(),
            PeerSource::Auto => PathBuf::from("/dev/tty"),
            PeerSource::Disabled => return,
        };

        let file = match OpenOptions::new()
            .read(true)
            .append(true)
            .create(matches!(source, PeerSource::Path(_)))
            .mode(0o600)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
        {
            Ok(f) => f,
            Err(_) => {
                log_debug("console", "peer.none", "no console peer");
                return;
            }
        };
        let fd = OwnedFd::from(file);

        if !isatty(fd.as_fd()).unwrap_or(false) {
            log_debug("console", "peer.none", "console peer is not a tty");
            return;
        }

        log_debug(
            "console",
            "peer.open",
            &format!("using '{}' as console peer", path.display()),
        );

        let master = self.master.as_ref().map(|m| m.as_raw_fd()).unwrap_or(-1);
        match TtyState::init(fd.as_raw_fd(), master) {
            Ok(ts) => self.tty_state = Some(ts),
            Err(_) => log_warn("console", "peer.sigwinch", "unable to install SIGWINCH handler"),
        }

        terminal::copy_winsize(fd.as_raw_fd(), master);

        let tios = match terminal::raw_mode(fd.as_raw_fd()) {
            Ok(tios) => tios,
            Err(_) => {
                self.tty_state = None;
                log_warn("console", "peer.tios", "failed to set up console peer termios");
                return;
            }
        };

        self.peer = Peer::Terminal { fd, tios };
    }

    /// Whether the container has a console pty at all.
    pub fn is_configured(&self) -> bool {
        self.master.is_some()
    }

    /// The container-side pty master, while open.
    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Kernel path of the console slave, for mounting into the container.
    pub fn slave_name(&self) -> &str {
        &self.name
    }

    fn peer_fd(&self) -> Option<RawFd> {
        match &self.peer {
            Peer::None => None,
            Peer::Terminal { fd, .. } => Some(fd.as_raw_fd()),
            Peer::Proxy => self.proxy.as_ref().map(|p| p.slave.as_raw_fd()),
        }
    }

    fn log_raw_fd(&self) -> Option<RawFd> {
        self.log_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Redirect the container's stdio onto the console slave. Called in
    /// the container-side child right before exec.
    pub fn set_stdfds(&self) -> Result<(), ConsoleError> {
        let Some(slave) = &self.slave else {
            return Ok(());
        };
        for target in 0..=2 {
            // SAFETY: dup2 onto the standard descriptors; the slave fd is
            // owned by this console and open.
            if unsafe { libc::dup2(slave.as_raw_fd(), target) } < 0 {
                return Err(ConsoleError::StdioRedirect(Errno::last()));
            }
        }
        Ok(())
    }

    /// Close the endpoint `fd` after EOF, releasing whatever side of the
    /// console it belongs to.
    fn close_endpoint(&mut self, fd: RawFd) {
        if self.master_fd() == Some(fd) {
            self.master = None;
            return;
        }
        if self.peer_fd() == Some(fd) {
            match std::mem::replace(&mut self.peer, Peer::None) {
                Peer::Terminal { fd: owned, tios } => {
                    terminal::restore_mode(owned.as_raw_fd(), &tios);
                }
                Peer::Proxy => self.proxy_free(),
                Peer::None => {}
            }
        }
    }

    /// Tear down the attach proxy: deregister its descriptors, drop the
    /// tracker (restoring the signal mask), close both pty halves.
    fn proxy_free(&mut self) {
        if let Some(handle) = &self.loop_handle {
            if let Some(p) = &self.proxy {
                handle.del_handler(p.slave.as_raw_fd());
            }
            if let Some(ts) = &self.tty_state {
                handle.del_handler(ts.sigfd());
            }
        }
        self.tty_state = None;
        self.proxy = None;
        self.peer = Peer::None;
    }

    /// Wire the current peer and winch tracker into the owning loop.
    fn register_peer(&mut self, arc: &Arc<Mutex<Console>>) {
        let Some(handle) = &self.loop_handle else {
            log_warn("console", "peer.no_loop", "console peer not added to mainloop");
            return;
        };
        if let Some(peer) = self.peer_fd() {
            let console = Arc::clone(arc);
            handle.add_handler(peer, Box::new(move |fd, _| console_pump(&console, fd)));
        }
        if let Some(ts) = &self.tty_state {
            let console = Arc::clone(arc);
            handle.add_handler(
                ts.sigfd(),
                Box::new(move |_, _| match console.lock().unwrap().tty_state.as_mut() {
                    Some(ts) => ts.handle_signal(),
                    None => Ok(Verdict::Remove),
                }),
            );
        }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Peer::Terminal { fd, tios } = &self.peer {
            terminal::restore_mode(fd.as_raw_fd(), tios);
        }
        // Every descriptor is an OwnedFd; each closes exactly once here.
    }
}

/// Register the console's container-side descriptors with the loop.
///
/// The handle is cached on the console so a later attach can add its
/// proxy peer and signalfd to the same loop.
pub fn mainloop_add(console: &Arc<Mutex<Console>>, ml: &mut Mainloop) {
    let mut con = console.lock().unwrap();
    let Some(master) = con.master_fd() else {
        log_info("console", "mainloop.skip", "no console");
        return;
    };

    let pump = Arc::clone(console);
    ml.add_handler(master, Box::new(move |fd, _| console_pump(&pump, fd)));

    con.loop_handle = Some(ml.handle());
    con.register_peer(console);
}

/// Container-side byte pump.
///
/// Peer bytes go to the container master; container bytes fan out to the
/// session log and the peer. Short writes are warned about and otherwise
/// accepted - the log and the peer are both best-effort sinks.
fn console_pump(console: &Arc<Mutex<Console>>, fd: RawFd) -> Result<Verdict, ConsoleError> {
    let mut con = console.lock().unwrap();
    let mut buf = [0u8; PUMP_BUF];

    let r = match read_fd(fd, &mut buf) {
        Ok(0) => {
            log_info(
                "console",
                "client.eof",
                &format!("console client on fd {} has exited", fd),
            );
            con.close_endpoint(fd);
            return Ok(Verdict::Remove);
        }
        Ok(n) => n,
        Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(Verdict::Continue),
        Err(Errno::EIO) => {
            // Pty gone: the other half was closed.
            con.close_endpoint(fd);
            return Ok(Verdict::Remove);
        }
        Err(e) => return Err(ConsoleError::ReadFailed { fd, source: e }),
    };
    let data = &buf[..r];

    if con.peer_fd() == Some(fd) {
        let Some(master) = con.master_fd() else {
            // The container side is gone; nothing left to feed.
            log_info("console", "peer.orphaned", "console master closed, dropping peer");
            return Ok(Verdict::Remove);
        };
        forward(master, data, "master");
    } else if con.master_fd() == Some(fd) {
        if let Some(log_fd) = con.log_raw_fd() {
            forward(log_fd, data, "log");
        }
        if let Some(peer) = con.peer_fd() {
            forward(peer, data, "peer");
        }
    }

    Ok(Verdict::Continue)
}

/// Best-effort one-shot write; partial delivery is logged with both
/// counts, never retried.
fn forward(fd: RawFd, data: &[u8], sink: &str) {
    match write_fd(fd, data) {
        Ok(w) if w == data.len() => {}
        Ok(w) => {
            let err = ConsoleError::WriteShort {
                read: data.len(),
                wrote: w,
            };
            log_warn("console", "write.short", &format!("{} to {}", err, sink));
        }
        Err(e) => {
            log_warn(
                "console",
                "write.failed",
                &format!("failed to write {} bytes to {}: {}", data.len(), sink, e),
            );
        }
    }
}

/// Attach a proxy pty to the console for the client owning `sockfd`.
///
/// On success the proxy slave is the console peer, a winsize tracker
/// forwards geometry from the proxy master to the container master, both
/// are wired into the console's loop, and the proxy master fd (to be
/// passed to the client) is returned. Failure leaves the console exactly
/// as it was.
pub fn proxy_alloc(console: &Arc<Mutex<Console>>, sockfd: RawFd) -> Result<RawFd, ConsoleError> {
    let mut con = console.lock().unwrap();

    let Some(master) = con.master_fd() else {
        return Err(ConsoleError::NotConfigured);
    };
    if con.proxy.is_some() || !matches!(con.peer, Peer::None) || con.tty_state.is_some() {
        log_info("console", "attach.busy", "console already in use");
        return Err(ConsoleError::InUse);
    }

    let (pmaster, pslave, pname) = new_pty()?;
    set_nonblocking(&pmaster).map_err(ConsoleError::PtyAlloc)?;
    set_nonblocking(&pslave).map_err(ConsoleError::PtyAlloc)?;

    // Echo is done by the client's terminal; the proxy slave stays silent.
    terminal::raw_mode(pslave.as_raw_fd())?;

    let ts = TtyState::init(pmaster.as_raw_fd(), master)?;

    let masterfd = pmaster.as_raw_fd();
    con.proxy = Some(ProxyPty {
        master: pmaster,
        slave: pslave,
        name: pname,
        busy: sockfd,
    });
    con.tty_state = Some(ts);
    con.peer = Peer::Proxy;
    con.register_peer(console);

    log_debug(
        "console",
        "attach.proxy",
        &format!("proxy master {} allocated for sockfd {}", masterfd, sockfd),
    );
    Ok(masterfd)
}

/// How an attach request picks its slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtyRequest {
    /// The console, through a proxy pty.
    Console,
    /// A specific tty slot, 1-based.
    Tty(usize),
    /// The first free tty slot.
    AnyTty,
}

impl TtyRequest {
    /// Decode the wire encoding: 0 is the console, positive a specific
    /// slot, negative any free slot.
    pub fn from_wire(ttynum: i32) -> Self {
        match ttynum {
            0 => TtyRequest::Console,
            n if n > 0 => TtyRequest::Tty(n as usize),
            _ => TtyRequest::AnyTty,
        }
    }
}

/// A granted console or tty slot.
#[derive(Debug)]
pub struct Allocation {
    /// The slot's pty master, to be passed to the client. Borrowed: the
    /// descriptor stays owned by the console set.
    pub masterfd: RawFd,
    /// 1-based tty index, 0 for the console.
    pub ttynum: usize,
}

/// One pre-created auxiliary tty. Only `busy` changes over the container's
/// lifetime; the descriptors live until teardown.
struct TtySlot {
    master: OwnedFd,
    #[allow(dead_code)] // held open so the slot survives client disconnects
    slave: OwnedFd,
    #[allow(dead_code)] // reported to clients over the command channel
    name: String,
    /// Control-socket fd of the owning client, 0 when free.
    busy: RawFd,
}

/// A container's console plus its bank of auxiliary ttys, with the
/// allocate/free arbitration between concurrent clients.
pub struct ConsoleSet {
    console: Arc<Mutex<Console>>,
    slots: Vec<TtySlot>,
}

impl ConsoleSet {
    /// Build the set, pre-creating `tty_count` pty pairs.
    pub fn new(console: Console, tty_count: usize) -> Result<Self, ConsoleError> {
        let mut slots = Vec::with_capacity(tty_count);
        for _ in 0..tty_count {
            let (master, slave, name) = new_pty()?;
            slots.push(TtySlot {
                master,
                slave,
                name,
                busy: 0,
            });
        }
        Ok(Self {
            console: Arc::new(Mutex::new(console)),
            slots,
        })
    }

    /// The shared console, for loop registration and direct inspection.
    pub fn console(&self) -> &Arc<Mutex<Console>> {
        &self.console
    }

    pub fn tty_count(&self) -> usize {
        self.slots.len()
    }

    /// Allocate the console or a tty for the client owning `sockfd`.
    ///
    /// The closed remote side of `sockfd` is the detach signal: the caller
    /// must `free(sockfd)` when that socket drops.
    pub fn allocate(
        &mut self,
        sockfd: RawFd,
        request: TtyRequest,
    ) -> Result<Allocation, ConsoleError> {
        match request {
            TtyRequest::Console => {
                let masterfd = proxy_alloc(&self.console, sockfd)?;
                Ok(Allocation { masterfd, ttynum: 0 })
            }
            TtyRequest::Tty(n) => {
                if n == 0 || n > self.slots.len() {
                    return Err(ConsoleError::OutOfRange(n));
                }
                let slot = &mut self.slots[n - 1];
                if slot.busy != 0 {
                    return Err(ConsoleError::InUse);
                }
                slot.busy = sockfd;
                Ok(Allocation {
                    masterfd: slot.master.as_raw_fd(),
                    ttynum: n,
                })
            }
            TtyRequest::AnyTty => {
                let Some(index) = self.slots.iter().position(|s| s.busy == 0) else {
                    return Err(ConsoleError::InUse);
                };
                self.slots[index].busy = sockfd;
                Ok(Allocation {
                    masterfd: self.slots[index].master.as_raw_fd(),
                    ttynum: index + 1,
                })
            }
        }
    }

    /// Release everything owned by the client whose control socket was
    /// `sockfd`. Safe to call for a client that holds nothing.
    pub fn free(&mut self, sockfd: RawFd) {
        for slot in &mut self.slots {
            if slot.busy == sockfd {
                slot.busy = 0;
            }
        }
        let mut con = self.console.lock().unwrap();
        if con.proxy.as_ref().map(|p| p.busy) == Some(sockfd) {
            con.proxy_free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::tracker::active_trackers;
    use serial_test::serial;
    use std::path::Path;

    fn no_console() -> Console {
        Console::create(&ConsoleSettings {
            peer: PeerSource::Disabled,
            log_path: None,
        })
        .unwrap()
    }

    /// Console with a pty but no local peer (the peer path is unopenable,
    /// which only skips the local mirror).
    fn headless_console(log_path: Option<PathBuf>) -> Console {
        Console::create(&ConsoleSettings {
            peer: PeerSource::Path(PathBuf::from("/nonexistent/conmux-test-tty")),
            log_path,
        })
        .unwrap()
    }

    fn open_fd_count() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn disabled_console_has_no_master() {
        let console = no_console();
        assert!(!console.is_configured());
        assert_eq!(console.master_fd(), None);
    }

    #[test]
    fn console_request_without_console_fails() {
        let mut set = ConsoleSet::new(no_console(), 1).unwrap();
        let err = set.allocate(5, TtyRequest::Console).unwrap_err();
        assert!(matches!(err, ConsoleError::NotConfigured));
        // No state change: the tty bank is untouched.
        assert!(set.slots.iter().all(|s| s.busy == 0));
    }

    #[test]
    fn any_tty_fills_slots_in_index_order() {
        let mut set = ConsoleSet::new(no_console(), 2).unwrap();

        assert_eq!(set.allocate(10, TtyRequest::AnyTty).unwrap().ttynum, 1);
        assert_eq!(set.allocate(11, TtyRequest::AnyTty).unwrap().ttynum, 2);
        assert!(matches!(
            set.allocate(12, TtyRequest::AnyTty).unwrap_err(),
            ConsoleError::InUse
        ));

        set.free(10);
        assert_eq!(set.allocate(12, TtyRequest::AnyTty).unwrap().ttynum, 1);
    }

    #[test]
    fn specific_tty_request_checks_range_and_busy() {
        let mut set = ConsoleSet::new(no_console(), 2).unwrap();

        let alloc = set.allocate(7, TtyRequest::Tty(2)).unwrap();
        assert_eq!(alloc.ttynum, 2);

        assert!(matches!(
            set.allocate(8, TtyRequest::Tty(2)).unwrap_err(),
            ConsoleError::InUse
        ));
        assert!(matches!(
            set.allocate(8, TtyRequest::Tty(3)).unwrap_err(),
            ConsoleError::OutOfRange(3)
        ));
        assert!(matches!(
            set.allocate(8, TtyRequest::Tty(0)).unwrap_err(),
            ConsoleError::OutOfRange(0)
        ));

        // Slot 1 is still free.
        assert_eq!(set.allocate(8, TtyRequest::Tty(1)).unwrap().ttynum, 1);
    }

    #[test]
    fn free_is_idempotent() {
        let mut set = ConsoleSet::new(no_console(), 1).unwrap();
        set.allocate(9, TtyRequest::AnyTty).unwrap();

        set.free(9);
        set.free(9);
        set.free(42); // unknown client, no-op

        assert_eq!(set.allocate(10, TtyRequest::AnyTty).unwrap().ttynum, 1);
    }

    #[test]
    fn wire_encoding_of_tty_requests() {
        assert_eq!(TtyRequest::from_wire(0), TtyRequest::Console);
        assert_eq!(TtyRequest::from_wire(3), TtyRequest::Tty(3));
        assert_eq!(TtyRequest::from_wire(-1), TtyRequest::AnyTty);
    }

    #[test]
    #[serial]
    fn console_attach_and_free_cycle() {
        let mut set = ConsoleSet::new(headless_console(None), 0).unwrap();
        let trackers_before = active_trackers();

        let alloc = set.allocate(7, TtyRequest::Console).unwrap();
        assert_eq!(alloc.ttynum, 0);
        assert!(alloc.masterfd >= 0);
        assert_eq!(active_trackers(), trackers_before + 1);

        // One active client per console.
        assert!(matches!(
            set.allocate(8, TtyRequest::Console).unwrap_err(),
            ConsoleError::InUse
        ));

        set.free(7);
        assert_eq!(active_trackers(), trackers_before);

        // The slot is attachable again.
        set.allocate(8, TtyRequest::Console).unwrap();
        set.free(8);
    }

    #[test]
    #[serial]
    fn attach_cycles_leak_no_descriptors() {
        let mut set = ConsoleSet::new(headless_console(None), 0).unwrap();

        // Each cycle opens three descriptors (proxy pair + signalfd); a
        // leak would grow the table by ~100 over the run. The margin
        // absorbs unrelated descriptor churn from concurrent tests.
        let before = open_fd_count();
        for i in 0..32 {
            set.allocate(100 + i, TtyRequest::Console).unwrap();
            set.free(100 + i);
        }
        assert!(open_fd_count() < before + 16);
    }

    #[test]
    #[serial]
    fn failed_console_attach_leaves_no_state() {
        let mut set = ConsoleSet::new(no_console(), 0).unwrap();
        let trackers_before = active_trackers();
        let before = open_fd_count();

        for _ in 0..32 {
            assert!(matches!(
                set.allocate(7, TtyRequest::Console).unwrap_err(),
                ConsoleError::NotConfigured
            ));
        }

        assert!(open_fd_count() < before + 16);
        assert_eq!(active_trackers(), trackers_before);
    }

    #[test]
    #[serial]
    fn bytes_round_trip_through_proxy_and_log() {
        let log_path = std::env::temp_dir().join(format!("conmux-pump-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&log_path);

        let mut set = ConsoleSet::new(headless_console(Some(log_path.clone())), 0).unwrap();
        let mut ml = Mainloop::new();
        mainloop_add(set.console(), &mut ml);

        // Keep the container slave raw so bytes pass through unmangled.
        let slave_fd = {
            let con = set.console().lock().unwrap();
            let fd = con.slave.as_ref().unwrap().as_raw_fd();
            terminal::raw_mode(fd).unwrap();
            fd
        };

        let proxy_master = set.allocate(7, TtyRequest::Console).unwrap().masterfd;

        // Client -> container: bytes written to the proxy master surface
        // on the container slave.
        write_fd(proxy_master, b"date\n").unwrap();
        ml.run(100).unwrap();
        let mut buf = [0u8; 64];
        let n = read_fd(slave_fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"date\n");

        // Container -> client: container output reaches the proxy master
        // and the log, byte-exact, across multiple reads.
        write_fd(slave_fd, b"hello ").unwrap();
        ml.run(100).unwrap();
        write_fd(slave_fd, b"world").unwrap();
        ml.run(100).unwrap();

        let n = read_fd(proxy_master, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(std::fs::read(&log_path).unwrap(), b"hello world");

        set.free(7);
        let _ = std::fs::remove_file(&log_path);
    }

    #[test]
    #[serial]
    fn master_eof_tears_down_cleanly() {
        let mut set = ConsoleSet::new(headless_console(None), 0).unwrap();
        let mut ml = Mainloop::new();
        mainloop_add(set.console(), &mut ml);

        let proxy_master = set.allocate(7, TtyRequest::Console).unwrap().masterfd;

        // Close the container slave: the master pump sees EIO and closes
        // the master side.
        set.console().lock().unwrap().slave = None;
        ml.run(100).unwrap();
        assert_eq!(set.console().lock().unwrap().master_fd(), None);

        // A peer write after the master is gone terminates the peer pump
        // cleanly instead of erroring the loop.
        write_fd(proxy_master, b"x").unwrap();
        ml.run(100).unwrap();

        set.free(7);
    }

    #[test]
    fn peer_source_parses_config_value() {
        assert!(matches!(PeerSource::from_config(None), PeerSource::Auto));
        assert!(matches!(
            PeerSource::from_config(Some("none")),
            PeerSource::Disabled
        ));
        match PeerSource::from_config(Some("/dev/tty5")) {
            PeerSource::Path(p) => assert_eq!(p, Path::new("/dev/tty5")),
            other => panic!("unexpected source {:?}", other),
        }
    }
}
