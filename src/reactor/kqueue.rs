use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::sys::time::TimeSpec;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::reactor::{CompletionHandler, FdEntry, Interest, MAX_EVENTS, pending_socket_error};

/// Ident reserved for the EVFILT_USER wake-up event.
const WAKE_IDENT: usize = usize::MAX;

/// Readiness backend over kqueue (macOS and the BSDs).
///
/// EV_ONESHOT gives the facility-level one-shot behavior; the registration
/// map entry is still removed before the handler runs so both filters of a
/// descriptor resolve to a single delivery. An EVFILT_USER event serves as
/// the wake-up channel.
pub struct KqueueReactor {
    kqueue: Kqueue,
    stopped: AtomicBool,
    entries: Mutex<HashMap<RawFd, FdEntry>>,
}

impl KqueueReactor {
    pub fn new() -> io::Result<Self> {
        let kqueue = Kqueue::new()?;

        // Arm the wake-up user event once; NOTE_TRIGGER fires it.
        let wake = KEvent::new(
            WAKE_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
            0,
            0,
        );
        kqueue.kevent(&[wake], &mut [], None)?;

        Ok(Self {
            kqueue,
            stopped: AtomicBool::new(false),
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn changes_for(fd: RawFd, interest: Interest, flags: EventFlag) -> SmallVec<[KEvent; 2]> {
        let mut changes = SmallVec::new();
        if interest.wants_read() {
            changes.push(KEvent::new(
                fd as usize,
                EventFilter::EVFILT_READ,
                flags,
                FilterFlag::empty(),
                0,
                0,
            ));
        }
        if interest.wants_write() {
            changes.push(KEvent::new(
                fd as usize,
                EventFilter::EVFILT_WRITE,
                flags,
                FilterFlag::empty(),
                0,
                0,
            ));
        }
        changes
    }

    /// One-shot registration; an already-registered descriptor gets its mask
    /// and handler replaced.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: CompletionHandler,
    ) -> io::Result<()> {
        let mut entries = self.entries.lock();

        if let Some(previous) = entries.insert(fd, FdEntry { interest, handler }) {
            self.delete_filters(fd, previous.interest);
        }

        let changes = Self::changes_for(fd, interest, EventFlag::EV_ADD | EventFlag::EV_ONESHOT);
        if let Err(errno) = self.kqueue.kevent(&changes, &mut [], None) {
            entries.remove(&fd);
            return Err(errno.into());
        }

        Ok(())
    }

    /// Removes a registration. Silent when the descriptor is not registered.
    pub fn unregister(&self, fd: RawFd) {
        if let Some(entry) = self.entries.lock().remove(&fd) {
            self.delete_filters(fd, entry.interest);
        }
    }

    /// Replaces the interest mask, keeping the handler. Silent on absence.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&fd) else {
            return Ok(());
        };

        let previous = entry.interest;
        entry.interest = interest;
        self.delete_filters(fd, previous);

        let changes = Self::changes_for(fd, interest, EventFlag::EV_ADD | EventFlag::EV_ONESHOT);
        self.kqueue.kevent(&changes, &mut [], None)?;

        Ok(())
    }

    fn delete_filters(&self, fd: RawFd, interest: Interest) {
        // ENOENT is expected when a one-shot filter already fired.
        let changes = Self::changes_for(fd, interest, EventFlag::EV_DELETE);
        let _ = self.kqueue.kevent(&changes, &mut [], None);
    }

    /// Waits up to `timeout`, delivers at most one batch of ready events and
    /// returns the number of completion handlers invoked.
    pub fn run_one(&self, timeout: Duration) -> io::Result<usize> {
        if self.is_stopped() {
            return Ok(0);
        }

        let zero = KEvent::new(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0, 0);
        let mut events = [zero; MAX_EVENTS];

        let n = loop {
            match self
                .kqueue
                .kevent(&[], &mut events, Some(TimeSpec::from_duration(timeout)))
            {
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
                Ok(n) => break n,
            }
        };

        let mut ready: SmallVec<[(CompletionHandler, io::Result<usize>); 8]> = SmallVec::new();
        {
            let mut entries = self.entries.lock();
            for event in events.iter().take(n) {
                if event.filter() == Ok(EventFilter::EVFILT_USER) {
                    continue;
                }

                let fd = event.ident() as RawFd;
                let Some(entry) = entries.remove(&fd) else {
                    continue;
                };

                // The fired filter is gone (EV_ONESHOT); drop the sibling so
                // the other readiness direction cannot fire a stale entry.
                self.delete_filters(fd, entry.interest);

                let flags = event.flags();
                let result = if flags.contains(EventFlag::EV_ERROR) {
                    let code = event.data() as i32;
                    if code != 0 {
                        Err(io::Error::from_raw_os_error(code))
                    } else {
                        Ok(0)
                    }
                } else if flags.contains(EventFlag::EV_EOF) {
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

    /// Non-blocking variant of [`KqueueReactor::run_one`].
    pub fn poll_one(&self) -> io::Result<usize> {
        self.run_one(Duration::ZERO)
    }

    /// Interrupts a blocking wait. Callable from any thread.
    pub fn wake(&self) {
        let trigger = KEvent::new(
            WAKE_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::empty(),
            FilterFlag::NOTE_TRIGGER,
            0,
            0,
        );
        let _ = self.kqueue.kevent(&[trigger], &mut [], None);
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

impl std::fmt::Debug for KqueueReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KqueueReactor")
            .field("registered", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
