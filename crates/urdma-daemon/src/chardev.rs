//! Kernel notification channel
//!
//! The kernel module reports QP connects and disconnects as fixed-size
//! records on a character device, one record per read, and the daemon
//! answers with `QP_RTR` records on the same fd.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::debug;
use urdma_core::error::{Error, Result};
use urdma_core::kabi::{KernelEvent, QpRtr, MAX_RECORD_LEN};
use urdma_core::warn_once;

pub struct KernelChannel {
    file: File,
}

impl KernelChannel {
    /// Open the device read-write, non-blocking and close-on-exec
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        Ok(Self { file })
    }

    /// Wrap an already open record channel
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }

    /// Read one record
    ///
    /// `None` when nothing is pending, or when the record was short or of
    /// an unknown type; those are logged once and dropped.
    pub fn read_event(&mut self) -> Result<Option<KernelEvent>> {
        let mut buf = [0u8; MAX_RECORD_LEN];
        let n = match self.file.read(&mut buf) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match KernelEvent::decode(&buf[..n]) {
            Ok(ev) => Ok(Some(ev)),
            Err(Error::ShortMessage { expected, got }) => {
                warn_once!(expected, got, "short kernel record discarded");
                Ok(None)
            }
            Err(e) => {
                warn_once!(error = %e, "kernel record discarded");
                debug!(error = %e, "kernel record discarded");
                Ok(None)
            }
        }
    }

    /// Tell the kernel the QP is ready to receive
    pub fn write_rtr(&mut self, kmod_qp_id: u32) -> Result<()> {
        let rec = KernelEvent::Rtr(QpRtr { kmod_qp_id }).encode();
        let n = self.file.write(&rec)?;
        if n != rec.len() {
            return Err(Error::ShortMessage { expected: rec.len(), got: n });
        }
        Ok(())
    }
}

impl AsRawFd for KernelChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use urdma_core::kabi::{QpConnected, QP_RTR_LEN};

    /// Channel plus the "kernel" end of a seqpacket pair
    fn pair() -> (KernelChannel, File) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        (KernelChannel::from_fd(a), File::from(b))
    }

    #[test]
    fn test_read_connected_record() {
        let (mut chan, mut kernel) = pair();
        assert!(chan.read_event().unwrap().is_none());

        let ev = KernelEvent::Connected(QpConnected {
            dev_id: 0,
            qp_id: 1,
            kmod_qp_id: 42,
            rxq: 1,
            txq: 1,
            ord_max: 8,
            ird_max: 8,
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 4001),
            dst_ether: [2, 0, 0, 0, 0, 9],
        });
        kernel.write_all(&ev.encode()).unwrap();
        assert_eq!(chan.read_event().unwrap(), Some(ev));
    }

    #[test]
    fn test_short_and_unknown_records_dropped() {
        let (mut chan, mut kernel) = pair();
        kernel.write_all(&1u32.to_ne_bytes()).unwrap();
        assert!(chan.read_event().unwrap().is_none());

        let mut unknown = 99u32.to_ne_bytes().to_vec();
        unknown.extend_from_slice(&[0; 4]);
        kernel.write_all(&unknown).unwrap();
        assert!(chan.read_event().unwrap().is_none());
    }

    #[test]
    fn test_write_rtr() {
        let (mut chan, mut kernel) = pair();
        chan.write_rtr(7).unwrap();

        let mut buf = [0u8; MAX_RECORD_LEN];
        let n = kernel.read(&mut buf).unwrap();
        assert_eq!(n, QP_RTR_LEN);
        assert_eq!(
            KernelEvent::decode(&buf[..n]).unwrap(),
            KernelEvent::Rtr(QpRtr { kmod_qp_id: 7 })
        );
    }

    #[test]
    fn test_closed_channel() {
        let (mut chan, kernel) = pair();
        drop(kernel);
        assert!(matches!(chan.read_event(), Err(Error::PeerClosed)));
    }
}
