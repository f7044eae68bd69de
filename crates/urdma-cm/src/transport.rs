//! Lower-layer protocol sockets
//!
//! The MPA handshake runs over plain TCP. All sockets are non-blocking;
//! active connects complete asynchronously and are reported as
//! writability.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, SockaddrIn};
use urdma_core::error::{Error, Result};

/// A CEP's socket
pub enum LlpSocket {
    Listener(TcpListener),
    Stream(TcpStream),
}

impl LlpSocket {
    /// Bind a listening socket; `AddressInUse` if the address is taken
    pub fn listen(addr: SocketAddrV4) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(SocketAddr::V4(addr)),
            _ => Error::Io(e),
        })?;
        listener.set_nonblocking(true)?;
        Ok(LlpSocket::Listener(listener))
    }

    /// Start a non-blocking connect
    pub fn connect(addr: SocketAddrV4) -> Result<Self> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        match connect(fd.as_raw_fd(), &SockaddrIn::from(addr)) {
            Ok(()) | Err(Errno::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }
        let stream = TcpStream::from(fd);
        stream.set_nodelay(true)?;
        Ok(LlpSocket::Stream(stream))
    }

    /// Accept one pending connection, `None` when the backlog is empty
    pub fn accept(&self) -> Result<Option<(LlpSocket, SocketAddrV4)>> {
        let LlpSocket::Listener(listener) = self else {
            return Err(Error::InvalidArgument("accept on a stream socket".into()));
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                Ok(Some((LlpSocket::Stream(stream), v4(peer)?)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let addr = match self {
            LlpSocket::Listener(l) => l.local_addr()?,
            LlpSocket::Stream(s) => s.local_addr()?,
        };
        v4(addr)
    }

    pub fn peer_addr(&self) -> Result<SocketAddrV4> {
        match self {
            LlpSocket::Listener(_) => Err(Error::InvalidArgument("listener has no peer".into())),
            LlpSocket::Stream(s) => v4(s.peer_addr()?),
        }
    }

    /// Pending socket error (SO_ERROR), used to finish an async connect
    pub fn take_error(&self) -> Result<Option<io::Error>> {
        Ok(match self {
            LlpSocket::Listener(l) => l.take_error()?,
            LlpSocket::Stream(s) => s.take_error()?,
        })
    }

    /// Write a whole handshake frame
    ///
    /// Frames are far smaller than a fresh socket's send buffer, so a
    /// short write is reported as a transport error rather than queued.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self {
            LlpSocket::Listener(_) => Err(Error::InvalidArgument("send on a listener".into())),
            LlpSocket::Stream(s) => {
                s.write_all(frame)?;
                Ok(())
            }
        }
    }
}

impl Read for LlpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LlpSocket::Stream(s) => s.read(buf),
            LlpSocket::Listener(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "read on a listening socket",
            )),
        }
    }
}

impl AsRawFd for LlpSocket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            LlpSocket::Listener(l) => l.as_raw_fd(),
            LlpSocket::Stream(s) => s.as_raw_fd(),
        }
    }
}

fn v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(a) => Ok(a),
        SocketAddr::V6(a) => Err(Error::InvalidArgument(format!("IPv6 address {} not supported", a))),
    }
}
