//! Error types for the console subsystem.
//!
//! One enum covers every failure class the library reports. Recoverable
//! conditions inside pump callbacks (EAGAIN, short best-effort writes) are
//! logged as warnings instead of surfacing here.

use std::os::fd::RawFd;
use std::path::PathBuf;

use nix::errno::Errno;

/// Errors reported by console setup, allocation, and the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    /// The descriptor is not a terminal.
    #[error("fd {0} is not a tty")]
    NotATty(RawFd),

    /// The kernel refused a termios get or set.
    #[error("terminal attribute i/o failed: {0}")]
    TermiosIo(#[source] Errno),

    /// Pty pair creation failed.
    #[error("failed to allocate a pty: {0}")]
    PtyAlloc(#[source] Errno),

    /// Could not block SIGWINCH in the thread signal mask.
    #[error("failed to block SIGWINCH: {0}")]
    SignalBlock(#[source] Errno),

    /// Could not obtain a signal descriptor for SIGWINCH.
    #[error("failed to get signalfd: {0}")]
    SignalFd(#[source] Errno),

    /// The descriptor loop's wait or a loop-terminating write failed.
    #[error("mainloop i/o failed: {0}")]
    LoopIo(#[source] Errno),

    /// A pump read failed with something other than EAGAIN/EINTR/EIO.
    #[error("read on fd {fd} failed: {source}")]
    ReadFailed {
        fd: RawFd,
        #[source]
        source: Errno,
    },

    /// Fewer bytes were written than read. Warning-grade in the console
    /// pump (the log is best-effort); loop-terminating in the attach
    /// driver, where a starved stdout means the session is unusable.
    #[error("short write r:{read} w:{wrote}")]
    WriteShort { read: usize, wrote: usize },

    /// The console or the requested tty slot is held by another client,
    /// or no free slot remains.
    #[error("console or tty already in use")]
    InUse,

    /// The requested tty index does not exist.
    #[error("tty {0} out of range")]
    OutOfRange(usize),

    /// The container has no console (configured with path "none").
    #[error("console not set up")]
    NotConfigured,

    /// Opening the console log file failed.
    #[error("failed to open console log {}: {source}", path.display())]
    LogOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Redirecting the container's stdio onto the console slave failed.
    #[error("failed to dup console onto stdio: {0}")]
    StdioRedirect(#[source] Errno),

    /// The command channel to the container supervisor failed.
    #[error("command channel: {0}")]
    CommandChannel(String),
}
