use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::reactor::{CompletionHandler, FdEntry, Interest, MAX_EVENTS, pending_socket_error};

/// Epoll notification mode. Level-triggered is the default; edge-triggered
/// sets EPOLLET on every registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerMode {
    #[default]
    LevelTriggered,
    EdgeTriggered,
}

/// Sentinel carried in the epoll data word for the wake-up eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness backend over Linux epoll.
///
/// Registrations are one-shot: the entry is removed before its handler runs,
/// and a second delivery requires an explicit re-registration. An eventfd is
/// kept in the interest set so `wake` can interrupt a blocking wait from any
/// thread; it never counts as a processed event.
pub struct EpollReactor {
    epoll: Epoll,
    wake_fd: OwnedFd,
    mode: TriggerMode,
    stopped: AtomicBool,
    entries: Mutex<HashMap<RawFd, FdEntry>>,
}

impl EpollReactor {
    pub fn new() -> io::Result<Self> {
        Self::with_mode(TriggerMode::default())
    }

    pub fn with_mode(mode: TriggerMode) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        epoll.add(&wake_fd, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;

        Ok(Self {
            epoll,
            wake_fd,
            mode,
            stopped: AtomicBool::new(false),
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn epoll_flags(&self, interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.wants_read() {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.wants_write() {
            flags |= EpollFlags::EPOLLOUT;
        }
        // EPOLLERR and EPOLLHUP are always reported; no need to request them.
        if self.mode == TriggerMode::EdgeTriggered {
            flags |= EpollFlags::EPOLLET;
        }
        flags
    }

    /// One-shot registration of `handler` for readiness on `fd`.
    ///
    /// Registering a descriptor that is already present replaces its mask and
    /// handler (update-then-wait).
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: CompletionHandler,
    ) -> io::Result<()> {
        let mut event = EpollEvent::new(self.epoll_flags(interest), fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        let mut entries = self.entries.lock();
        let replaced = entries
            .insert(fd, FdEntry { interest, handler })
            .is_some();

        let res = if replaced {
            self.epoll.modify(borrowed, &mut event)
        } else {
            self.epoll.add(borrowed, event)
        };

        if let Err(errno) = res {
            entries.remove(&fd);
            return Err(errno.into());
        }

        Ok(())
    }

    /// Removes a registration. Silent when the descriptor is not registered.
    pub fn unregister(&self, fd: RawFd) {
        let removed = self.entries.lock().remove(&fd).is_some();
        if removed {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            // The fd may already be closed; nothing useful to do about it.
            let _ = self.epoll.delete(borrowed);
        }
    }

    /// Replaces the interest mask for an existing registration, keeping the
    /// handler. Silent when the descriptor is not registered.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&fd) else {
            return Ok(());
        };
        entry.interest = interest;

        let mut event = EpollEvent::new(self.epoll_flags(interest), fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(borrowed, &mut event)?;

        Ok(())
    }

    /// Waits up to `timeout` and delivers at most one batch of ready events.
    /// Returns the number of completion handlers invoked.
    pub fn run_one(&self, timeout: Duration) -> io::Result<usize> {
        if self.is_stopped() {
            return Ok(0);
        }

        let timeout_ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        let n = loop {
            match self.epoll.wait(&mut events, timeout_ms) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
                Ok(n) => break n,
            }
        };

        // Move ready handlers out under the lock, invoke them after it is
        // released so a completion handler can re-register freely.
        let mut ready: SmallVec<[(CompletionHandler, io::Result<usize>); 8]> = SmallVec::new();
        {
            let mut entries = self.entries.lock();
            for event in events.iter().take(n) {
                if event.data() == WAKE_TOKEN {
                    self.drain_wake_channel();
                    continue;
                }

                let fd = event.data() as RawFd;
                let Some(entry) = entries.remove(&fd) else {
                    continue;
                };

                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let _ = self.epoll.delete(borrowed);

                let flags = event.events();
                let result = if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                    pending_socket_error(fd)
                } else {
                    Ok(0)
                };
                ready.push((entry.handler, result));
            }
        }

        let processed = ready.len();
        for (handler, result) in ready {
            handler(result);
        }

        Ok(processed)
    }

    /// Non-blocking variant of [`EpollReactor::run_one`].
    pub fn poll_one(&self) -> io::Result<usize> {
        self.run_one(Duration::ZERO)
    }

    /// Interrupts a blocking wait. Callable from any thread.
    pub fn wake(&self) {
        let one: u64 = 1;
        // A full eventfd counter still leaves the fd readable; EAGAIN here
        // means the wait will wake anyway.
        let res = unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                (&raw const one).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        let _ = res;
    }

    fn drain_wake_channel(&self) {
        let mut buf = 0u64;
        let res = unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                (&raw mut buf).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        let _ = res;
    }

    /// Makes the current and all subsequent waits return immediately.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of registered descriptors, wake-up channel excluded.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for EpollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollReactor")
            .field("mode", &self.mode)
            .field("registered", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
