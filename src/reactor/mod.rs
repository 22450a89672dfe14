//! Readiness-notification backends.
//!
//! Each backend exposes the same surface: one-shot registration of a
//! completion handler against a file descriptor and an interest mask,
//! `run_one(timeout)` delivering at most one batch of ready events, and a
//! wake-up channel so a blocked wait can be interrupted by work posted from
//! another thread. The actual I/O is performed by the socket layer once the
//! readiness callback fires; readiness backends always report zero bytes.

use bitflags::bitflags;
use std::io;
use std::os::fd::RawFd;

bitflags! {
    /// Operations a registration is interested in.
    ///
    /// `ACCEPT` and `CONNECT` are aliases the socket layer uses for clarity;
    /// at the notification facility they map to read and write readiness
    /// respectively. `ERROR` and `HANGUP` are always reported regardless of
    /// the requested mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Interest: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const ACCEPT = 1 << 2;
        const CONNECT = 1 << 3;
        const ERROR = 1 << 4;
        const HANGUP = 1 << 5;
    }
}

impl Interest {
    pub(crate) fn wants_read(self) -> bool {
        self.intersects(Interest::READ | Interest::ACCEPT)
    }

    pub(crate) fn wants_write(self) -> bool {
        self.intersects(Interest::WRITE | Interest::CONNECT)
    }
}

/// Completion callback carrying the (error, bytes-transferred) outcome.
///
/// Readiness backends deliver `Ok(0)` on plain readiness; the per-socket
/// error is fetched and delivered when the event mask indicates error or
/// hangup and a pending error code exists.
pub type CompletionHandler = Box<dyn FnOnce(io::Result<usize>) + Send>;

pub(crate) struct FdEntry {
    pub(crate) interest: Interest,
    pub(crate) handler: CompletionHandler,
}

/// Upper bound on events drained per wait, per backend.
pub(crate) const MAX_EVENTS: usize = 128;

/// Retrieves the pending per-socket error for a descriptor the facility
/// flagged with error/hangup. A hangup with no pending error code is ordinary
/// readiness: the subsequent I/O call observes EOF on its own.
pub(crate) fn pending_socket_error(fd: RawFd) -> io::Result<usize> {
    use nix::sys::socket::{getsockopt, sockopt};
    use std::os::fd::BorrowedFd;

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match getsockopt(&borrowed, sockopt::SocketError) {
        Ok(code) if code != 0 => Err(io::Error::from_raw_os_error(code)),
        // Not a socket (pipes in tests), or no error pending.
        _ => Ok(0),
    }
}

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::{EpollReactor, TriggerMode};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::KqueueReactor;

#[cfg(unix)]
pub mod poll;
#[cfg(unix)]
pub use poll::PollReactor;

/// The readiness backend for the compilation target.
#[cfg(target_os = "linux")]
pub type PlatformReactor = EpollReactor;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub type PlatformReactor = KqueueReactor;

#[cfg(all(
    unix,
    not(target_os = "linux"),
    not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
pub type PlatformReactor = PollReactor;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_and_connect_alias_read_and_write() {
        assert!(Interest::ACCEPT.wants_read());
        assert!(!Interest::ACCEPT.wants_write());
        assert!(Interest::CONNECT.wants_write());
        assert!(!Interest::CONNECT.wants_read());
        assert!((Interest::READ | Interest::WRITE).wants_read());
    }
}
