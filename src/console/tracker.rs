//! Winsize tracking for attached terminals.
//!
//! SIGWINCH is not installed as a classic asynchronous handler. The signal
//! is blocked in the calling thread's mask and delivered through a
//! signalfd instead, so the ordinary event loop drains it under normal
//! locking rules; an async handler would need the registry lock and could
//! deadlock against an attach or detach mutating it. Every live tracker is
//! also recorded in a process-wide registry so the rare no-event-loop path
//! can still walk all sessions and propagate geometry.

use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::signal::{SigSet, Signal, SigmaskHow, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::commands;
use crate::error::ConsoleError;
use crate::log::{log_debug, log_warn};
use crate::mainloop::Verdict;
use crate::terminal;

/// Where a tracker's cross-process window-change hint goes: the supervisor
/// of this container, reachable under this base directory.
#[derive(Clone, Debug)]
pub struct WinchHint {
    pub container: String,
    pub base_dir: PathBuf,
}

struct RegistryEntry {
    id: u64,
    srcfd: RawFd,
    dstfd: RawFd,
    hint: Option<WinchHint>,
}

/// All live trackers. Mutated only at tracker construction/destruction.
static ACTIVE_TRACKERS: Mutex<Vec<RegistryEntry>> = Mutex::new(Vec::new());
static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

fn unregister(id: u64) {
    ACTIVE_TRACKERS.lock().unwrap().retain(|e| e.id != id);
}

/// Number of live trackers in the process-wide registry.
pub fn active_trackers() -> usize {
    ACTIVE_TRACKERS.lock().unwrap().len()
}

/// Fallback winch propagation for code paths with no event loop: walk
/// every live tracker and push its source geometry to its destination.
pub fn sigwinch_fallback() {
    let trackers = ACTIVE_TRACKERS.lock().unwrap();
    for entry in trackers.iter() {
        terminal::copy_winsize(entry.srcfd, entry.dstfd);
        if let Some(hint) = &entry.hint {
            commands::notify_winch(&hint.container, &hint.base_dir);
        }
    }
}

/// Outcome of feeding one input byte through the detach state machine.
#[derive(Debug, PartialEq, Eq)]
pub enum EscapeAction {
    /// Deliver this byte to the pty master.
    Forward(u8),
    /// The escape prefix: swallow the byte, arm the state machine.
    Consume,
    /// Escape then 'q': detach without writing anything.
    Detach,
}

/// The two-byte in-band detach sequence: a configurable prefix byte
/// (Ctrl-A is 0x01) followed by `q`. Prefix twice forwards the prefix
/// itself once.
#[derive(Debug)]
pub struct EscapeState {
    escape: u8,
    saw_escape: bool,
}

impl EscapeState {
    pub fn new(escape: u8) -> Self {
        Self {
            escape,
            saw_escape: false,
        }
    }

    pub fn feed(&mut self, byte: u8) -> EscapeAction {
        if byte == self.escape && !self.saw_escape {
            self.saw_escape = true;
            return EscapeAction::Consume;
        }
        if byte == b'q' && self.saw_escape {
            return EscapeAction::Detach;
        }
        self.saw_escape = false;
        EscapeAction::Forward(byte)
    }
}

/// Per-session winsize tracker.
///
/// Owns the SIGWINCH signal descriptor and its registry node; borrows the
/// source and destination descriptors from the session that created it.
/// SIGWINCH stays blocked in the thread mask for the tracker's whole
/// lifetime; the saved mask is restored exactly once, on drop.
pub struct TtyState {
    id: u64,
    /// Source of geometry (and of client keystrokes in the attach driver).
    pub stdinfd: RawFd,
    /// Destination of the attach driver's master pump.
    pub stdoutfd: RawFd,
    /// Destination of geometry: the container-side pty master.
    pub masterfd: RawFd,
    /// Detach state machine for the attach driver's stdin pump.
    pub escape: EscapeState,
    winch_hint: Option<WinchHint>,
    sigfd: SignalFd,
    oldmask: SigSet,
}

impl TtyState {
    /// Install SIGWINCH tracking from `srcfd` to `dstfd`.
    ///
    /// Blocks SIGWINCH in the current mask (saving the previous one),
    /// obtains a signalfd for it, and records the tracker in the
    /// process-wide registry. On failure the registry insertion and the
    /// mask change are rolled back.
    ///
    /// The returned tracker's `sigfd()` can be poll()ed (added to a
    /// mainloop) for SIGWINCH.
    pub fn init(srcfd: RawFd, dstfd: RawFd) -> Result<Self, ConsoleError> {
        let id = NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed);
        ACTIVE_TRACKERS.lock().unwrap().push(RegistryEntry {
            id,
            srcfd,
            dstfd,
            hint: None,
        });

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGWINCH);
        let mut oldmask = SigSet::empty();
        if let Err(e) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut oldmask)) {
            unregister(id);
            return Err(ConsoleError::SignalBlock(e));
        }

        let sigfd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        {
            Ok(sigfd) => sigfd,
            Err(e) => {
                let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&oldmask), None);
                unregister(id);
                return Err(ConsoleError::SignalFd(e));
            }
        };

        log_debug(
            "tracker",
            "sigwinch.init",
            &format!("got SIGWINCH fd {}", sigfd.as_raw_fd()),
        );

        Ok(Self {
            id,
            stdinfd: srcfd,
            stdoutfd: -1,
            masterfd: dstfd,
            escape: EscapeState::new(1),
            winch_hint: None,
            sigfd,
            oldmask,
        })
    }

    /// The SIGWINCH signal descriptor, for event-loop registration.
    pub fn sigfd(&self) -> RawFd {
        self.sigfd.as_raw_fd()
    }

    /// Route the cross-process window-change hint to this container's
    /// supervisor on every winch.
    pub fn set_winch_proxy(&mut self, container: &str, base_dir: &Path) {
        let hint = WinchHint {
            container: container.to_string(),
            base_dir: base_dir.to_path_buf(),
        };
        let mut trackers = ACTIVE_TRACKERS.lock().unwrap();
        if let Some(entry) = trackers.iter_mut().find(|e| e.id == self.id) {
            entry.hint = Some(hint.clone());
        }
        self.winch_hint = Some(hint);
    }

    /// Drain one signal record and run the winch propagation.
    pub fn handle_signal(&mut self) -> Result<Verdict, ConsoleError> {
        match self.sigfd.read_signal() {
            Ok(Some(_)) => {
                self.notify_winch();
                Ok(Verdict::Continue)
            }
            // Spurious wakeup; nothing queued.
            Ok(None) => Ok(Verdict::Continue),
            Err(e) => Err(ConsoleError::ReadFailed {
                fd: self.sigfd.as_raw_fd(),
                source: e,
            }),
        }
    }

    /// Propagate current geometry and, when configured, issue the
    /// cross-process hint. Never fatal.
    pub fn notify_winch(&self) {
        terminal::copy_winsize(self.stdinfd, self.masterfd);
        if let Some(hint) = &self.winch_hint {
            commands::notify_winch(&hint.container, &hint.base_dir);
        }
    }
}

impl Drop for TtyState {
    fn drop(&mut self) {
        unregister(self.id);
        if sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.oldmask), None).is_err() {
            log_warn("tracker", "mask.restore", "failed to restore signal mask");
        }
        // The signalfd closes with its field.
    }
}
