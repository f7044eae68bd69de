//! Control socket listener
//!
//! A SOCK_SEQPACKET Unix socket at a filesystem path. Accepted
//! connections are non-blocking and close-on-exec.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr,
};
use tracing::{debug, info};
use urdma_core::error::{Error, Result};

const BACKLOG: i32 = 16;

/// Longest path that fits `sockaddr_un.sun_path` with its terminator
fn max_path_len() -> usize {
    // Safety: sockaddr_un is plain data
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len() - 1
}

pub struct ControlListener {
    fd: OwnedFd,
    path: PathBuf,
}

impl ControlListener {
    /// Bind and listen at `path`, replacing a stale socket file
    pub fn bind(path: &Path) -> Result<Self> {
        let len = path.as_os_str().as_bytes().len();
        if len > max_path_len() {
            return Err(Error::InvalidArgument(format!(
                "socket path {} is {} bytes, limit {}",
                path.display(),
                len,
                max_path_len()
            )));
        }

        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(BACKLOG)?)?;

        info!(path = %path.display(), "control socket listening");
        Ok(Self { fd, path: path.to_path_buf() })
    }

    /// Accept one pending client; `None` if there is none
    pub fn accept(&self) -> Result<Option<OwnedFd>> {
        match accept4(self.fd.as_raw_fd(), SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            // Safety: accept4 returned a fresh fd we now own
            Ok(raw) => Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) })),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for ControlListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
