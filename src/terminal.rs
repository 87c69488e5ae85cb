//! Terminal mode management - raw mode setup and window size plumbing.
//!
//! Key functionality:
//! - raw_mode: disable echo/canonical/signal processing for proxied ttys
//! - RawModeGuard: RAII wrapper that restores terminal settings on drop
//! - copy_winsize: propagate geometry from one terminal to another

use std::os::fd::{BorrowedFd, RawFd};

use nix::sys::termios::{
    self, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use nix::unistd::isatty;

use crate::error::ConsoleError;
use crate::log::{log_debug, log_warn};

/// Put a terminal into raw byte-at-a-time mode, returning the previous
/// settings for restoration.
///
/// Echo, canonical line editing, and signal generation are disabled; the
/// proxying master is responsible for echo. Break conditions raise BRKINT
/// rather than being ignored. Reads deliver a single byte (VMIN=1,
/// VTIME=0).
pub fn raw_mode(fd: RawFd) -> Result<Termios, ConsoleError> {
    // SAFETY: callers hand us descriptors they own; the borrow only lives
    // for the duration of the termios calls below.
    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };

    if !isatty(bfd).unwrap_or(false) {
        return Err(ConsoleError::NotATty(fd));
    }

    let original = termios::tcgetattr(bfd).map_err(ConsoleError::TermiosIo)?;

    let mut raw = original.clone();
    raw.input_flags.remove(InputFlags::IGNBRK);
    raw.input_flags.insert(InputFlags::BRKINT);
    raw.local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(bfd, SetArg::TCSAFLUSH, &raw).map_err(ConsoleError::TermiosIo)?;

    Ok(original)
}

/// Restore previously saved terminal settings, draining pending output
/// first. Failure is logged, not propagated: restoration runs on teardown
/// paths where there is nothing left to unwind.
pub fn restore_mode(fd: RawFd, tios: &Termios) {
    // SAFETY: as in raw_mode; the descriptor is still owned by the caller.
    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
    if termios::tcsetattr(bfd, SetArg::TCSAFLUSH, tios).is_err() {
        log_warn("terminal", "restore.failed", "failed to set old terminal settings");
    }
}

/// RAII guard that restores terminal settings on drop.
///
/// When created, puts the terminal into raw mode. When dropped, restores
/// the original settings on whatever path the caller exits through.
pub struct RawModeGuard {
    fd: RawFd,
    original: Termios,
}

impl RawModeGuard {
    /// Raw-ify `fd`, keeping the saved termios for restoration.
    pub fn new(fd: RawFd) -> Result<Self, ConsoleError> {
        let original = raw_mode(fd)?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        restore_mode(self.fd, &self.original);
    }
}

/// Read the window size of a terminal. Returns None when the descriptor
/// is not a tty or the ioctl fails.
pub fn get_winsize(fd: RawFd) -> Option<(u16, u16)> {
    // SAFETY: winsize is a C struct with no invariants; an all-zero value
    // is valid and the ioctl overwrites it on success.
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };

    // SAFETY: TIOCGWINSZ writes a winsize struct through the pointer; the
    // return value is checked below.
    let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
    if ret == -1 {
        return None;
    }
    Some((ws.ws_row, ws.ws_col))
}

/// Propagate the window size from one terminal to another.
///
/// `srcfd` is the terminal to take geometry from (typically the client
/// side), `dstfd` the one to apply it to (typically a pty master). A
/// non-tty source or a failed ioctl is silently a no-op; resize is always
/// best-effort.
pub fn copy_winsize(srcfd: RawFd, dstfd: RawFd) {
    // SAFETY: the borrow only lives for the isatty check.
    let src = unsafe { BorrowedFd::borrow_raw(srcfd) };
    if !isatty(src).unwrap_or(false) {
        return;
    }

    // SAFETY: see get_winsize.
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(srcfd, libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
    if ret == -1 {
        return;
    }

    log_debug(
        "terminal",
        "winsize.set",
        &format!("set winsz dstfd:{} cols:{} rows:{}", dstfd, ws.ws_col, ws.ws_row),
    );

    // SAFETY: TIOCSWINSZ reads a winsize struct; failure is intentionally
    // ignored, the destination keeps its old geometry.
    unsafe {
        libc::ioctl(dstfd, libc::TIOCSWINSZ as libc::c_ulong, &ws);
    }
}
