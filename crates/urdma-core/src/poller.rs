//! Readiness polling over epoll
//!
//! Level-triggered. Each registered fd carries a caller-chosen `u64`
//! token that comes back in [`Readiness`]. The poller does not own the
//! registered fds; callers must `delete` before closing one.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;

use crate::error::Result;

/// Events of interest for a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    /// Peer shut down its write side
    pub const HANGUP: Interest = Interest(libc::EPOLLRDHUP as u32);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl core::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// One ready registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// EPOLLHUP or EPOLLRDHUP
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(ev: &libc::epoll_event) -> Self {
        let bits = ev.events;
        Readiness {
            token: ev.u64,
            readable: bits & libc::EPOLLIN as u32 != 0,
            writable: bits & libc::EPOLLOUT as u32 != 0,
            hangup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
            error: bits & libc::EPOLLERR as u32 != 0,
        }
    }
}

/// An epoll instance
pub struct Poller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    /// Create a poller that returns at most `max_events` per wait
    pub fn new(max_events: usize) -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        Ok(Self {
            // Safety: epoll_create1 returned a fresh fd we now own
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, core::ptr::null_mut())
        };
        if ret < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event { events: interest.bits(), u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if ret < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Wait for readiness; `None` blocks until something is ready
    ///
    /// Ready registrations are appended to `out`. An interrupted wait
    /// returns 0.
    pub fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            // Round up so a sub-millisecond deadline does not busy-spin
            Some(t) => t.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                return Ok(0);
            }
            return Err(errno.into());
        }

        let n = n as usize;
        out.extend(self.events[..n].iter().map(Readiness::from_event));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poller_reports_readable_token() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(8).unwrap();
        poller.add(b.as_raw_fd(), 42, Interest::READABLE).unwrap();

        let mut ready = Vec::new();
        assert_eq!(poller.wait(&mut ready, Some(Duration::ZERO)).unwrap(), 0);

        a.write_all(b"x").unwrap();
        let n = poller.wait(&mut ready, Some(Duration::from_millis(500))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(ready[0].token, 42);
        assert!(ready[0].readable);
    }

    #[test]
    fn test_poller_hangup_and_delete() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(8).unwrap();
        poller
            .add(b.as_raw_fd(), 7, Interest::READABLE | Interest::HANGUP)
            .unwrap();
        drop(a);

        let mut ready = Vec::new();
        poller.wait(&mut ready, Some(Duration::from_millis(500))).unwrap();
        assert!(ready[0].hangup);

        poller.delete(b.as_raw_fd()).unwrap();
        ready.clear();
        assert_eq!(poller.wait(&mut ready, Some(Duration::ZERO)).unwrap(), 0);
    }

    #[test]
    fn test_poller_modify_interest() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(8).unwrap();
        poller.add(b.as_raw_fd(), 1, Interest::READABLE).unwrap();

        let mut ready = Vec::new();
        assert_eq!(poller.wait(&mut ready, Some(Duration::ZERO)).unwrap(), 0);

        poller.modify(b.as_raw_fd(), 1, Interest::WRITABLE).unwrap();
        assert_eq!(poller.wait(&mut ready, Some(Duration::ZERO)).unwrap(), 1);
        assert!(ready[0].writable);
    }
}
