//! Thin typed socket surface over the reactor.
//!
//! These wrappers own a non-blocking std socket and translate async
//! operations into one-shot reactor registrations; the actual system call
//! happens on the readiness callback. Everything heavier (buffered streams,
//! protocol codecs) belongs to the application.

pub mod socket;
pub use socket::{TcpListener, TcpStream, UdpSocket, WaitKind};
