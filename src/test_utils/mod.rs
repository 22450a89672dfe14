#![allow(unused)]

use dashmap::DashMap;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

/// Non-blocking pipe; returns (read end, write end).
pub(crate) fn pipe_pair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe failed: {}", std::io::Error::last_os_error());

    for fd in fds {
        let res = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(res, 0, "fcntl failed: {}", std::io::Error::last_os_error());
    }

    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Records labeled events from handlers across threads so scenario tests can
/// assert on ordering and counts without sprinkling mutexes everywhere.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker {
    events: Arc<DashMap<&'static str, Vec<u64>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, label: &'static str, value: u64) {
        self.events.entry(label).or_default().push(value);
    }

    pub(crate) fn get(&self, label: &'static str) -> Vec<u64> {
        self.events.get(label).map(|v| v.clone()).unwrap_or_default()
    }

    pub(crate) fn count(&self, label: &'static str) -> usize {
        self.events.get(label).map_or(0, |v| v.len())
    }
}
