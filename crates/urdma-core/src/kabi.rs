//! Kernel notification records
//!
//! Fixed-size records exchanged over the `/dev/urdma` character device.
//! The kernel writes `QP_CONNECTED` and `QP_DISCONNECTED`; the daemon
//! writes `QP_RTR` once a connected QP's queues are running.
//!
//! The `event_type` and id fields are host-endian (both ends run on the
//! same machine). Addresses and ports are stored in network order.
//!
//! ```text
//! QP_CONNECTED (40 bytes)
//!  0 event_type u32    16 kmod_qp_id u32    32 dst_ether [6]
//!  4 dev_id     u16    20 src_port   u16    38 pad       [2]
//!  6 qp_id      u16    22 dst_port   u16
//!  8 rxq        u16    24 src_ipv4   [4]
//! 10 txq        u16    28 dst_ipv4   [4]
//! 12 ord_max    u16
//! 14 ird_max    u16
//!
//! QP_DISCONNECTED (8 bytes): event_type u32, dev_id u16, qp_id u16
//! QP_RTR          (8 bytes): event_type u32, kmod_qp_id u32
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

pub const EVENT_QP_CONNECTED: u32 = 1;
pub const EVENT_QP_DISCONNECTED: u32 = 2;
pub const EVENT_QP_RTR: u32 = 3;

pub const QP_CONNECTED_LEN: usize = 40;
pub const QP_DISCONNECTED_LEN: usize = 8;
pub const QP_RTR_LEN: usize = 8;

/// Largest record on the channel
pub const MAX_RECORD_LEN: usize = QP_CONNECTED_LEN;

/// A QP finished its handshake and needs dataplane queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpConnected {
    pub dev_id: u16,
    /// Daemon-side slot id
    pub qp_id: u16,
    /// Kernel-side QP number, echoed back in `QP_RTR`
    pub kmod_qp_id: u32,
    pub rxq: u16,
    pub txq: u16,
    pub ord_max: u16,
    pub ird_max: u16,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub dst_ether: [u8; 6],
}

/// A QP's connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpDisconnected {
    pub dev_id: u16,
    pub qp_id: u16,
}

/// The daemon confirms the QP is ready to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpRtr {
    pub kmod_qp_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelEvent {
    Connected(QpConnected),
    Disconnected(QpDisconnected),
    Rtr(QpRtr),
}

impl KernelEvent {
    pub fn event_type(&self) -> u32 {
        match self {
            KernelEvent::Connected(_) => EVENT_QP_CONNECTED,
            KernelEvent::Disconnected(_) => EVENT_QP_DISCONNECTED,
            KernelEvent::Rtr(_) => EVENT_QP_RTR,
        }
    }

    /// Decode one record
    ///
    /// Records shorter than their type's size are rejected whole.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, 4)?;
        match ne_u32(buf, 0) {
            EVENT_QP_CONNECTED => {
                need(buf, QP_CONNECTED_LEN)?;
                let mut dst_ether = [0u8; 6];
                dst_ether.copy_from_slice(&buf[32..38]);
                Ok(KernelEvent::Connected(QpConnected {
                    dev_id: ne_u16(buf, 4),
                    qp_id: ne_u16(buf, 6),
                    rxq: ne_u16(buf, 8),
                    txq: ne_u16(buf, 10),
                    ord_max: ne_u16(buf, 12),
                    ird_max: ne_u16(buf, 14),
                    kmod_qp_id: ne_u32(buf, 16),
                    src: SocketAddrV4::new(ipv4_at(buf, 24), be_u16(buf, 20)),
                    dst: SocketAddrV4::new(ipv4_at(buf, 28), be_u16(buf, 22)),
                    dst_ether,
                }))
            }
            EVENT_QP_DISCONNECTED => {
                need(buf, QP_DISCONNECTED_LEN)?;
                Ok(KernelEvent::Disconnected(QpDisconnected {
                    dev_id: ne_u16(buf, 4),
                    qp_id: ne_u16(buf, 6),
                }))
            }
            EVENT_QP_RTR => {
                need(buf, QP_RTR_LEN)?;
                Ok(KernelEvent::Rtr(QpRtr { kmod_qp_id: ne_u32(buf, 4) }))
            }
            other => Err(Error::protocol(format!("unknown kernel event type {}", other))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_RECORD_LEN);
        out.extend_from_slice(&self.event_type().to_ne_bytes());
        match self {
            KernelEvent::Connected(ev) => {
                for v in [ev.dev_id, ev.qp_id, ev.rxq, ev.txq, ev.ord_max, ev.ird_max] {
                    out.extend_from_slice(&v.to_ne_bytes());
                }
                out.extend_from_slice(&ev.kmod_qp_id.to_ne_bytes());
                out.extend_from_slice(&ev.src.port().to_be_bytes());
                out.extend_from_slice(&ev.dst.port().to_be_bytes());
                out.extend_from_slice(&ev.src.ip().octets());
                out.extend_from_slice(&ev.dst.ip().octets());
                out.extend_from_slice(&ev.dst_ether);
                out.extend_from_slice(&[0, 0]);
            }
            KernelEvent::Disconnected(ev) => {
                out.extend_from_slice(&ev.dev_id.to_ne_bytes());
                out.extend_from_slice(&ev.qp_id.to_ne_bytes());
            }
            KernelEvent::Rtr(ev) => {
                out.extend_from_slice(&ev.kmod_qp_id.to_ne_bytes());
            }
        }
        out
    }
}

#[inline]
fn need(buf: &[u8], expected: usize) -> Result<()> {
    if buf.len() < expected {
        return Err(Error::ShortMessage { expected, got: buf.len() });
    }
    Ok(())
}

#[inline]
fn ne_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn ne_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn ipv4_at(buf: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> QpConnected {
        QpConnected {
            dev_id: 0,
            qp_id: 3,
            kmod_qp_id: 0x1234,
            rxq: 3,
            txq: 3,
            ord_max: 16,
            ird_max: 8,
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4791),
            dst: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000),
            dst_ether: [0x02, 0, 0, 0, 0, 0x2a],
        }
    }

    #[test]
    fn test_connected_layout() {
        let bytes = KernelEvent::Connected(connected()).encode();
        assert_eq!(bytes.len(), QP_CONNECTED_LEN);
        // Ports and addresses in network order
        assert_eq!(&bytes[20..22], &4791u16.to_be_bytes());
        assert_eq!(&bytes[24..28], &[10, 0, 0, 1]);
        assert_eq!(&bytes[32..38], &[0x02, 0, 0, 0, 0, 0x2a]);
        assert_eq!(
            KernelEvent::decode(&bytes).unwrap(),
            KernelEvent::Connected(connected())
        );
    }

    #[test]
    fn test_rtr_and_disconnected_sizes() {
        let rtr = KernelEvent::Rtr(QpRtr { kmod_qp_id: 77 });
        assert_eq!(rtr.encode().len(), QP_RTR_LEN);

        let disc = KernelEvent::Disconnected(QpDisconnected { dev_id: 1, qp_id: 2 });
        let bytes = disc.encode();
        assert_eq!(bytes.len(), QP_DISCONNECTED_LEN);
        assert_eq!(KernelEvent::decode(&bytes).unwrap(), disc);
    }

    #[test]
    fn test_short_record_rejected() {
        let bytes = KernelEvent::Connected(connected()).encode();
        assert!(matches!(
            KernelEvent::decode(&bytes[..20]),
            Err(Error::ShortMessage { expected: QP_CONNECTED_LEN, got: 20 })
        ));
        assert!(matches!(
            KernelEvent::decode(&[1, 0]),
            Err(Error::ShortMessage { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn test_unknown_event_type() {
        let bytes = 99u32.to_ne_bytes();
        let err = KernelEvent::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
