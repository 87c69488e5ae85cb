//! conmux: container console multiplexer.
//!
//! A container owns one console pty pair serving as its stdio, plus a
//! bank of pre-created auxiliary ttys. This crate provides both sides of
//! an interactive session with them:
//!
//! - the supervisor-side pieces: console realization, tty allocation and
//!   arbitration between concurrent clients, the byte pumps and the
//!   poll-driven descriptor loop they run in, and session logging;
//! - the host-side attach driver behind the `conmux attach` CLI.
//!
//! SIGWINCH is handled as a descriptor event (signalfd) everywhere an
//! event loop exists, so window-resize propagation obeys the same
//! single-threaded dispatch rules as the byte pumps.

pub mod attach;
pub mod commands;
pub mod config;
pub mod console;
pub mod error;
pub mod log;
pub mod mainloop;
pub mod paths;
pub mod terminal;
