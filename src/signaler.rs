//! Self-pipe + signal-to-queue bridge.
//!
//! The installed handler only ever does two things: append a signal
//! number to a bounded, lock-free queue, and write one byte to a pipe.
//! Both operations are async-signal-safe by construction — no
//! allocation, no locks, nothing that can block. All the real work
//! (logging, dispatch, state mutation) happens later, on the main loop
//! thread, once it wakes from `sleep()`.
//!
//! Grounded in the self-pipe pattern from `signal-hook`'s `pipe` module
//! (see the vendored copy in the retrieval pack under
//! `kata-containers/.../vendor/signal-hook/src/pipe.rs`) and registered
//! through `signal-hook-registry`, the same low-level registration crate
//! `nvidia_gpu_stats` depends on for its own signal handling.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd;

use crate::posix;

const QUEUE_CAPACITY: usize = 5;

/// The fixed set of signals the master recognizes.
pub const RECOGNIZED: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
    Signal::SIGCHLD,
    Signal::SIGABRT,
];

/// Map a recognized signal to its lowercased handler-method suffix, e.g.
/// `SIGHUP` → `"hup"` → `handle_hup`. Unmapped signals return `None`.
pub fn handler_name(sig: i32) -> Option<&'static str> {
    let signal = Signal::try_from(sig).ok()?;
    RECOGNIZED.iter().find(|s| **s == signal)?;
    Some(match signal {
        Signal::SIGHUP => "hup",
        Signal::SIGQUIT => "quit",
        Signal::SIGINT => "int",
        Signal::SIGTERM => "term",
        Signal::SIGTTIN => "ttin",
        Signal::SIGTTOU => "ttou",
        Signal::SIGUSR1 => "usr1",
        Signal::SIGUSR2 => "usr2",
        Signal::SIGWINCH => "winch",
        Signal::SIGCHLD => "chld",
        Signal::SIGABRT => "abort",
        _ => unreachable!("not in RECOGNIZED"),
    })
}

/// Bounded FIFO of raw signal numbers. Capacity 5; overflow is silently
/// dropped. Mutated only by the handler (push) and the main loop (pop),
/// but implemented with atomics since the handler can, in principle,
/// interleave with itself across distinct signals.
#[derive(Debug, Default)]
pub struct SignalQueue {
    slots: [AtomicI32; QUEUE_CAPACITY],
    head: AtomicUsize,
    len: AtomicUsize,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `sig`. Returns `false` (a no-op, never an error) if the
    /// queue is already at capacity.
    pub fn push(&self, sig: i32) -> bool {
        loop {
            let len = self.len.load(Ordering::Acquire);
            if len >= QUEUE_CAPACITY {
                return false;
            }
            if self
                .len
                .compare_exchange_weak(len, len + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let idx = (self.head.load(Ordering::Acquire) + len) % QUEUE_CAPACITY;
                self.slots[idx].store(sig, Ordering::Release);
                return true;
            }
        }
    }

    /// Pop the head, if any. Single-consumer (the main loop).
    pub fn pop(&self) -> Option<i32> {
        let len = self.len.load(Ordering::Acquire);
        if len == 0 {
            return None;
        }
        let head = self.head.load(Ordering::Acquire);
        let sig = self.slots[head].load(Ordering::Acquire);
        self.head.store((head + 1) % QUEUE_CAPACITY, Ordering::Release);
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(sig)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unidirectional pipe whose write end is fed by a signal handler and
/// whose read end the main loop polls with a bounded timeout.
pub struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SelfPipe {
    pub fn new() -> nix::Result<Self> {
        use std::os::fd::IntoRawFd;
        let (read_fd, write_fd) = unistd::pipe()?;
        posix::set_non_blocking(&read_fd).ok();
        posix::set_non_blocking(&write_fd).ok();
        posix::set_close_on_exec(&read_fd).ok();
        posix::set_close_on_exec(&write_fd).ok();
        Ok(SelfPipe {
            read_fd: read_fd.into_raw_fd(),
            write_fd: write_fd.into_raw_fd(),
        })
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Write one byte, swallowing `EAGAIN`/`EINTR`. Safe to call from a
    /// signal handler: a single `write(2)` and nothing else.
    pub fn wake(write_fd: RawFd) {
        loop {
            match unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(write_fd) }, b".") {
                Ok(_) => break,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    /// Block until the read end is readable or `timeout` elapses, then
    /// drain every available byte. Returns `true` if any bytes were read.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.read_fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout_ms: PollTimeout = (timeout.as_millis() as u16).into();
        match poll(&mut fds, timeout_ms) {
            Ok(0) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => return false,
            Err(_) => return false,
            Ok(_) => {}
        }
        self.drain()
    }

    fn drain(&self) -> bool {
        let mut any = false;
        let mut buf = [0u8; 512];
        loop {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.read_fd) };
            match unistd::read(borrowed, &mut buf) {
                Ok(0) => break,
                Ok(_) => any = true,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                Err(_) => break,
            }
        }
        any
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        let _ = unistd::close(self.read_fd);
        let _ = unistd::close(self.write_fd);
    }
}

/// Installs and owns the signal-handling machinery for one process
/// generation (master or, after re-init, a forked worker).
pub struct Signaler {
    pub queue: Arc<SignalQueue>,
    pipe: SelfPipe,
    registered: Vec<signal_hook_registry::SigId>,
}

impl Signaler {
    /// Install handlers for the recognized set and create the self-pipe.
    /// If a prior pipe/registration exists (re-init after fork in the
    /// child), it is torn down first.
    pub fn init() -> nix::Result<Self> {
        let queue = Arc::new(SignalQueue::new());
        let pipe = SelfPipe::new()?;
        let write_fd = pipe.write_fd();

        let mut registered = Vec::with_capacity(RECOGNIZED.len());
        for signal in RECOGNIZED {
            let queue = Arc::clone(&queue);
            let raw = *signal as i32;
            // SAFETY: the closure only touches atomics and performs one
            // `write(2)` syscall — both async-signal-safe.
            let id = unsafe {
                signal_hook_registry::register(raw, move || {
                    queue.push(raw);
                    SelfPipe::wake(write_fd);
                })
            }
            .map_err(|_| Errno::EINVAL)?;
            registered.push(id);
        }

        Ok(Signaler {
            queue,
            pipe,
            registered,
        })
    }

    /// Force the next `sleep()` to return immediately, regardless of the
    /// signal queue's state.
    pub fn wake(&self) {
        SelfPipe::wake(self.pipe.write_fd());
    }

    /// Block up to `max_wait` for a self-pipe wakeup, draining it fully
    /// before returning.
    pub fn sleep(&self, max_wait: Duration) {
        self.pipe.sleep(max_wait);
    }

    pub fn pop_signal(&self) -> Option<i32> {
        self.queue.pop()
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            signal_hook_registry::unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_bounded_at_capacity() {
        let q = SignalQueue::new();
        for i in 1..=5 {
            assert!(q.push(i));
        }
        assert!(!q.push(6));
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn queue_is_fifo() {
        let q = SignalQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn recognized_names_map_to_handle_suffix() {
        assert_eq!(handler_name(Signal::SIGHUP as i32), Some("hup"));
        assert_eq!(handler_name(Signal::SIGCHLD as i32), Some("chld"));
        assert_eq!(handler_name(Signal::SIGTTOU as i32), Some("ttou"));
    }

    #[test]
    fn unrecognized_signal_has_no_handler() {
        assert_eq!(handler_name(Signal::SIGPIPE as i32), None);
    }
}
