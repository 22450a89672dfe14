use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::reactor::{CompletionHandler, FdEntry, Interest, pending_socket_error};

/// Readiness backend over POSIX poll(2), the portable fallback.
///
/// poll is stateless, so the descriptor set is rebuilt for every wait from
/// the registration map; one-shot semantics come from removing the entry
/// before its handler runs. A self-pipe is included in every poll set so
/// `wake` can interrupt a blocking wait.
pub struct PollReactor {
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    stopped: AtomicBool,
    entries: Mutex<HashMap<RawFd, FdEntry>>,
}

impl PollReactor {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        let (wake_read, wake_write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [&wake_read, &wake_write] {
            let res = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
            if res != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self {
            wake_read,
            wake_write,
            stopped: AtomicBool::new(false),
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn poll_flags(interest: Interest) -> PollFlags {
        let mut flags = PollFlags::empty();
        if interest.wants_read() {
            flags |= PollFlags::POLLIN;
        }
        if interest.wants_write() {
            flags |= PollFlags::POLLOUT;
        }
        // POLLERR and POLLHUP are reported unconditionally.
        flags
    }

    /// One-shot registration; an already-registered descriptor gets its mask
    /// and handler replaced.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: CompletionHandler,
    ) -> io::Result<()> {
        self.entries.lock().insert(fd, FdEntry { interest, handler });
        // The fd joins the set on the next wait; unblock a wait in flight so
        // it picks the new registration up promptly.
        self.wake();
        Ok(())
    }

    /// Removes a registration. Silent when the descriptor is not registered.
    pub fn unregister(&self, fd: RawFd) {
        self.entries.lock().remove(&fd);
    }

    /// Replaces the interest mask, keeping the handler. Silent on absence.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if let Some(entry) = self.entries.lock().get_mut(&fd) {
            entry.interest = interest;
            self.wake();
        }
        Ok(())
    }

    /// Waits up to `timeout`, delivers at most one batch of ready events and
    /// returns the number of completion handlers invoked.
    pub fn run_one(&self, timeout: Duration) -> io::Result<usize> {
        if self.is_stopped() {
            return Ok(0);
        }

        // Snapshot the registration set. Entries added while we sleep wake
        // the poll through the self-pipe and are picked up next round.
        let watched: Vec<(RawFd, PollFlags)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .map(|(fd, entry)| (*fd, Self::poll_flags(entry.interest)))
                .collect()
        };

        let mut poll_fds = Vec::with_capacity(watched.len() + 1);
        poll_fds.push(PollFd::new(self.wake_read.as_fd(), PollFlags::POLLIN));
        for (fd, flags) in &watched {
            let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
            poll_fds.push(PollFd::new(borrowed, *flags));
        }

        let timeout_ms = PollTimeout::from(timeout.as_millis().min(u128::from(u16::MAX)) as u16);
        loop {
            match poll(&mut poll_fds, timeout_ms) {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
                Ok(_) => break,
            }
        }

        let mut woken = false;
        if let Some(revents) = poll_fds[0].revents()
            && revents.contains(PollFlags::POLLIN)
        {
            woken = true;
        }

        let ready_fds: SmallVec<[(RawFd, PollFlags); 8]> = poll_fds[1..]
            .iter()
            .zip(&watched)
            .filter_map(|(poll_fd, (fd, _))| {
                let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
                (!revents.is_empty()).then_some((*fd, revents))
            })
            .collect();

        drop(poll_fds);
        if woken {
            self.drain_wake_channel();
        }

        let mut ready: SmallVec<[(CompletionHandler, io::Result<usize>); 8]> = SmallVec::new();
        {
            let mut entries = self.entries.lock();
            for (fd, revents) in ready_fds {
                let Some(entry) = entries.remove(&fd) else {
                    continue;
                };

                let result = if revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
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

    /// Non-blocking variant of [`PollReactor::run_one`].
    pub fn poll_one(&self) -> io::Result<usize> {
        self.run_one(Duration::ZERO)
    }

    /// Interrupts a blocking wait. Callable from any thread.
    pub fn wake(&self) {
        let byte = 1u8;
        // EAGAIN means the pipe already holds a wake byte.
        let res = unsafe {
            libc::write(self.wake_write.as_raw_fd(), (&raw const byte).cast::<libc::c_void>(), 1)
        };
        let _ = res;
    }

    fn drain_wake_channel(&self) {
        let mut buf = [0u8; 64];
        loop {
            let res = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if res <= 0 {
                break;
            }
        }
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

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("registered", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
