//! Non-blocking TCP socket handle.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};

use crate::addr::Address;

/// Thin wrapper over an owned socket file descriptor.
///
/// The fd has exactly one owner and is closed once, on drop. Moving the
/// handle transfers ownership; there is no way to copy it. Sockets must be
/// switched to non-blocking mode before their fd is handed to a reactor
/// channel.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create an IPv4 TCP stream socket.
    pub fn stream() -> io::Result<Self> {
        let inner = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        Ok(Socket { inner })
    }

    pub(crate) fn from_socket2(inner: socket2::Socket) -> Self {
        Socket { inner }
    }

    pub fn bind(&self, addr: Address) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(addr.to_socket_addr()))
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection. Returns `WouldBlock` when the backlog
    /// is empty.
    pub fn accept(&self) -> io::Result<(Socket, Address)> {
        let (sock, peer) = self.inner.accept()?;
        let peer = sockaddr_to_address(&peer);
        Ok((Socket { inner: sock }, peer))
    }

    /// Start a connect. On a non-blocking socket an in-progress connect is
    /// not an error; completion is observed through write readiness.
    pub fn connect(&self, addr: Address) -> io::Result<()> {
        match self.inner.connect(&SockAddr::from(addr.to_socket_addr())) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write bytes. `WouldBlock` means the kernel send buffer is full.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send(buf)
    }

    /// Read bytes. `Ok(0)` means the peer closed its write half.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.inner.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)
    }

    pub fn set_reuse_addr(&self, enable: bool) -> io::Result<()> {
        self.inner.set_reuse_address(enable)
    }

    pub fn set_nonblocking(&self, enable: bool) -> io::Result<()> {
        self.inner.set_nonblocking(enable)
    }

    pub fn set_keep_alive(&self, enable: bool) -> io::Result<()> {
        set_bool_opt(
            self.inner.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            enable,
        )
    }

    pub fn set_no_delay(&self, enable: bool) -> io::Result<()> {
        set_bool_opt(
            self.inner.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            enable,
        )
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        Ok(sockaddr_to_address(&self.inner.local_addr()?))
    }

    pub fn peer_addr(&self) -> io::Result<Address> {
        Ok(sockaddr_to_address(&self.inner.peer_addr()?))
    }

    /// Pending socket error, if any (`SO_ERROR`).
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn sockaddr_to_address(sa: &SockAddr) -> Address {
    match sa.as_socket() {
        Some(SocketAddr::V4(v4)) => Address::from(v4),
        _ => Address::any(0),
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, enable: bool) -> io::Result<()> {
    let optval: libc::c_int = if enable { 1 } else { 0 };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listen_accept_wouldblock() {
        let sock = Socket::stream().unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.set_nonblocking(true).unwrap();
        sock.bind(Address::loopback(0)).unwrap();
        sock.listen(16).unwrap();

        let err = sock.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_local_addr_after_bind() {
        let sock = Socket::stream().unwrap();
        sock.bind(Address::loopback(0)).unwrap();
        let addr = sock.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(addr.ip(), std::net::Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_options_succeed() {
        let sock = Socket::stream().unwrap();
        sock.set_keep_alive(true).unwrap();
        sock.set_no_delay(true).unwrap();
        sock.set_keep_alive(false).unwrap();
    }
}
