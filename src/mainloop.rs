//! Poll-driven descriptor loop.
//!
//! Single-threaded cooperative dispatch: every registered descriptor gets
//! a callback, poll(2) wakes the loop, and ready callbacks run to
//! completion one at a time. Callbacks never block; all I/O is one-shot.
//!
//! Callbacks cannot safely reshape the handler table they are running
//! out of, so structural changes from inside a dispatch (or from
//! allocator code running inside another handler) go through a cloneable
//! `LoopHandle` whose queued operations the loop applies between rounds.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::ConsoleError;
use crate::log::log_warn;

/// What a handler wants the loop to do after an event.
pub enum Verdict {
    /// Keep the handler registered.
    Continue,
    /// Deregister this handler; the loop keeps running.
    Remove,
    /// Stop the loop cleanly.
    Terminate,
}

/// Event callback registered for one descriptor.
///
/// Errors terminate the loop; `run` returns the first one.
pub type Handler = Box<dyn FnMut(RawFd, PollFlags) -> Result<Verdict, ConsoleError> + Send>;

enum PendingOp {
    Add(RawFd, Handler),
    Del(RawFd),
}

/// Deferred add/del access to a [`Mainloop`].
///
/// Held by structures (e.g. a console) that outlive individual attach
/// cycles and need to wire descriptors in and out of the loop that is
/// currently dispatching them.
#[derive(Clone)]
pub struct LoopHandle {
    ops: Arc<Mutex<Vec<PendingOp>>>,
}

impl LoopHandle {
    /// Queue a handler registration; applied before the next poll.
    pub fn add_handler(&self, fd: RawFd, handler: Handler) {
        self.ops.lock().unwrap().push(PendingOp::Add(fd, handler));
    }

    /// Queue a handler removal; applied before the next poll.
    pub fn del_handler(&self, fd: RawFd) {
        self.ops.lock().unwrap().push(PendingOp::Del(fd));
    }
}

/// The descriptor loop.
pub struct Mainloop {
    entries: Vec<(RawFd, Handler)>,
    handle: LoopHandle,
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Mainloop {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            handle: LoopHandle {
                ops: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    /// A handle for deferred registration from handlers or allocator code.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Register a handler for a descriptor, replacing any existing one.
    pub fn add_handler(&mut self, fd: RawFd, handler: Handler) {
        self.entries.retain(|(f, _)| *f != fd);
        self.entries.push((fd, handler));
    }

    /// Deregister the handler for a descriptor, if any.
    pub fn del_handler(&mut self, fd: RawFd) {
        self.entries.retain(|(f, _)| *f != fd);
    }

    fn apply_pending(&mut self) {
        let ops: Vec<PendingOp> = {
            let mut queue = self.handle.ops.lock().unwrap();
            queue.drain(..).collect()
        };
        for op in ops {
            match op {
                PendingOp::Add(fd, handler) => self.add_handler(fd, handler),
                PendingOp::Del(fd) => self.del_handler(fd),
            }
        }
    }

    /// Run the loop until a handler terminates it, a handler fails, the
    /// handler set drains empty, or the wait times out.
    ///
    /// `timeout_ms < 0` waits indefinitely. Returns `Ok(())` on clean
    /// termination, empty set, or timeout; the first handler error
    /// otherwise.
    pub fn run(&mut self, timeout_ms: i32) -> Result<(), ConsoleError> {
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX)
        };

        loop {
            self.apply_pending();
            if self.entries.is_empty() {
                return Ok(());
            }

            let mut fds: Vec<PollFd> = self
                .entries
                .iter()
                .map(|(fd, _)| {
                    // SAFETY: the descriptor was registered by its owner and
                    // stays open at least until its handler removes it.
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN)
                })
                .collect();

            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ConsoleError::LoopIo(e)),
            }

            // Snapshot readiness before dispatch; handlers may queue
            // add/del operations against this very table.
            let ready: Vec<(RawFd, PollFlags)> = self
                .entries
                .iter()
                .zip(fds.iter())
                .filter_map(|((fd, _), pfd)| {
                    pfd.revents().filter(|r| !r.is_empty()).map(|r| (*fd, r))
                })
                .collect();
            drop(fds);

            let mut removed: Vec<RawFd> = Vec::new();
            let mut terminate = false;

            for (fd, revents) in ready {
                if removed.contains(&fd) {
                    continue;
                }
                if revents.contains(PollFlags::POLLNVAL) {
                    // The owner closed the descriptor without deregistering.
                    log_warn(
                        "mainloop",
                        "fd.stale",
                        &format!("dropping handler for closed fd {}", fd),
                    );
                    removed.push(fd);
                    continue;
                }
                let Some(idx) = self.entries.iter().position(|(f, _)| *f == fd) else {
                    continue;
                };
                let handler = &mut self.entries[idx].1;
                match handler(fd, revents)? {
                    Verdict::Continue => {}
                    Verdict::Remove => removed.push(fd),
                    Verdict::Terminate => {
                        terminate = true;
                        break;
                    }
                }
            }

            for fd in removed {
                self.del_handler(fd);
            }
            if terminate {
                return Ok(());
            }
        }
    }
}
