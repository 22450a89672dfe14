use std::io::{self, Read, Write};
use std::net::{self, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use crate::reactor::{Interest, pending_socket_error};
use crate::runtime::{IoContext, IoExecutor};

/// What an [`async_wait`](TcpStream::async_wait) waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Readable,
    Writable,
    Error,
}

impl From<WaitKind> for Interest {
    fn from(kind: WaitKind) -> Interest {
        match kind {
            WaitKind::Readable => Interest::READ,
            WaitKind::Writable => Interest::WRITE,
            WaitKind::Error => Interest::ERROR,
        }
    }
}

fn register_wait<F>(executor: &IoExecutor, fd: i32, kind: WaitKind, handler: F) -> io::Result<()>
where
    F: FnOnce(io::Result<()>) + Send + 'static,
{
    executor
        .reactor()
        .register(fd, kind.into(), Box::new(move |res| handler(res.map(|_| ()))))
}

/// Accepting socket bound to a local address, non-blocking from birth.
#[derive(Debug)]
pub struct TcpListener {
    inner: net::TcpListener,
    executor: IoExecutor,
}

impl TcpListener {
    pub fn bind(ctx: &IoContext, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;

        Ok(Self {
            inner,
            executor: ctx.executor(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// One-shot readiness wait; re-arm by calling again from the handler.
    pub fn async_wait<F>(&self, kind: WaitKind, handler: F) -> io::Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        register_wait(&self.executor, self.inner.as_raw_fd(), kind, handler)
    }

    /// Accepts one connection asynchronously: registers for accept readiness
    /// and performs the `accept` on the callback. The delivered stream is
    /// non-blocking and bound to the same loop.
    pub fn async_accept<F>(&self, handler: F) -> io::Result<()>
    where
        F: FnOnce(io::Result<(TcpStream, SocketAddr)>) + Send + 'static,
    {
        let listener = self.inner.try_clone()?;
        let executor = self.executor.clone();

        self.executor.reactor().register(
            self.inner.as_raw_fd(),
            Interest::ACCEPT,
            Box::new(move |res| {
                let outcome = res.and_then(|_| listener.accept()).and_then(|(stream, peer)| {
                    stream.set_nonblocking(true)?;
                    Ok((TcpStream::from_std(stream, executor), peer))
                });
                handler(outcome);
            }),
        )
    }

    /// Drops the pending readiness registration, if any.
    pub fn cancel(&self) {
        self.executor.reactor().unregister(self.inner.as_raw_fd());
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Connected (or connecting) stream socket, non-blocking from birth.
#[derive(Debug)]
pub struct TcpStream {
    inner: net::TcpStream,
    executor: IoExecutor,
}

impl TcpStream {
    /// Starts a non-blocking connect and delivers the connected stream to
    /// `handler` once the socket reports writability; the pending socket
    /// error is checked there, so refused connections surface as `Err`.
    pub fn async_connect<F>(ctx: &IoContext, addr: SocketAddr, handler: F) -> io::Result<()>
    where
        F: FnOnce(io::Result<TcpStream>) + Send + 'static,
    {
        use nix::sys::socket::{
            AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6, SockaddrLike, connect,
            socket,
        };

        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };

        let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;

        // O_NONBLOCK via fcntl rather than a socket() flag; macOS has no
        // SOCK_NONBLOCK.
        let res = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }

        let sockaddr: Box<dyn SockaddrLike> = match addr {
            SocketAddr::V4(v4) => Box::new(SockaddrIn::from(v4)),
            SocketAddr::V6(v6) => Box::new(SockaddrIn6::from(v6)),
        };

        match connect(fd.as_raw_fd(), &*sockaddr) {
            Ok(()) => {}
            Err(nix::errno::Errno::EINPROGRESS) => {}
            Err(errno) => return Err(errno.into()),
        }

        let raw_fd = fd.as_raw_fd();
        let executor = ctx.executor();
        ctx.reactor().register(
            raw_fd,
            Interest::CONNECT,
            Box::new(move |res| {
                // Writability alone does not mean the connect succeeded;
                // consult the pending error either way.
                let outcome = res.and_then(|_| pending_socket_error(raw_fd)).map(|_| {
                    let stream = unsafe { net::TcpStream::from_raw_fd(fd.into_raw_fd()) };
                    TcpStream::from_std(stream, executor)
                });
                handler(outcome);
            }),
        )
    }

    pub(crate) fn from_std(inner: net::TcpStream, executor: IoExecutor) -> Self {
        Self { inner, executor }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// One-shot readiness wait; re-arm by calling again from the handler.
    pub fn async_wait<F>(&self, kind: WaitKind, handler: F) -> io::Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        register_wait(&self.executor, self.inner.as_raw_fd(), kind, handler)
    }

    /// Non-blocking read; `WouldBlock` means wait for readability first.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    /// Non-blocking write; `WouldBlock` means wait for writability first.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    /// Drops the pending readiness registration, if any.
    pub fn cancel(&self) {
        self.executor.reactor().unregister(self.inner.as_raw_fd());
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Datagram socket, non-blocking from birth.
#[derive(Debug)]
pub struct UdpSocket {
    inner: net::UdpSocket,
    executor: IoExecutor,
}

impl UdpSocket {
    pub fn bind(ctx: &IoContext, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = net::UdpSocket::bind(addr)?;
        inner.set_nonblocking(true)?;

        Ok(Self {
            inner,
            executor: ctx.executor(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// One-shot readiness wait; re-arm by calling again from the handler.
    pub fn async_wait<F>(&self, kind: WaitKind, handler: F) -> io::Result<()>
    where
        F: FnOnce(io::Result<()>) + Send + 'static,
    {
        register_wait(&self.executor, self.inner.as_raw_fd(), kind, handler)
    }

    /// Non-blocking send; `WouldBlock` means wait for writability first.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, addr)
    }

    /// Non-blocking receive; `WouldBlock` means wait for readability first.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf)
    }

    /// Drops the pending readiness registration, if any.
    pub fn cancel(&self) {
        self.executor.reactor().unregister(self.inner.as_raw_fd());
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.cancel();
    }
}
