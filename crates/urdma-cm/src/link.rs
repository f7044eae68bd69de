//! Boundary between the CM and the resource layer
//!
//! The CM reports QP lifecycle changes through a [`QpLink`] and receives
//! RTR completions through an [`RtrNotifier`], which may be driven from
//! any thread.

use std::io::Write;
use std::net::SocketAddrV4;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use urdma_core::error::{Error, Result};
use urdma_core::kabi::{KernelEvent, QpConnected, QpDisconnected};

use crate::cep::CepId;
use crate::notifier::EventFd;

/// A daemon QP bound to a CEP by `initiate` or `accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundQp {
    pub dev_id: u16,
    pub qp_id: u16,
    /// Kernel-side id echoed back in `QP_RTR`
    pub kmod_qp_id: u32,
    pub ord_max: u16,
    pub ird_max: u16,
    pub dst_ether: [u8; 6],
}

impl BoundQp {
    /// Build the `QP_CONNECTED` record for this QP
    pub fn connected(&self, src: SocketAddrV4, dst: SocketAddrV4) -> QpConnected {
        QpConnected {
            dev_id: self.dev_id,
            qp_id: self.qp_id,
            kmod_qp_id: self.kmod_qp_id,
            rxq: self.qp_id,
            txq: self.qp_id,
            ord_max: self.ord_max,
            ird_max: self.ird_max,
            src,
            dst,
            dst_ether: self.dst_ether,
        }
    }

    pub fn disconnected(&self) -> QpDisconnected {
        QpDisconnected { dev_id: self.dev_id, qp_id: self.qp_id }
    }
}

/// Why a CEP reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    PeerClosed,
    /// Either side refused the connection
    Rejected,
    Timeout,
    ProtocolViolation,
    TransportError,
    RtrFailed,
}

impl CloseReason {
    pub(crate) fn from_error(err: &Error) -> Self {
        match err {
            Error::Timeout => CloseReason::Timeout,
            Error::PeerClosed => CloseReason::PeerClosed,
            Error::ProtocolViolation(_) | Error::UnknownOpcode(_) | Error::ShortMessage { .. } => {
                CloseReason::ProtocolViolation
            }
            _ => CloseReason::TransportError,
        }
    }
}

/// Upcalls to the application waiting on a CEP
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmEvent {
    /// A peer's MPA request arrived on a child of `listener`
    ConnectRequest { listener: CepId, cep: CepId, private_data: Vec<u8> },
    /// The peer answered our request
    ConnectReply { cep: CepId, accepted: bool, private_data: Vec<u8> },
    /// The QP reached RTR
    Established { cep: CepId },
    Closed { cep: CepId, reason: CloseReason },
}

impl CmEvent {
    pub fn cep(&self) -> CepId {
        match self {
            CmEvent::ConnectRequest { cep, .. }
            | CmEvent::ConnectReply { cep, .. }
            | CmEvent::Established { cep }
            | CmEvent::Closed { cep, .. } => *cep,
        }
    }
}

/// Where the CM reports QP lifecycle changes
pub trait QpLink {
    fn connected(&mut self, ev: &QpConnected) -> Result<()>;
    fn disconnected(&mut self, ev: &QpDisconnected) -> Result<()>;
}

/// Collects records in memory
impl QpLink for Vec<KernelEvent> {
    fn connected(&mut self, ev: &QpConnected) -> Result<()> {
        self.push(KernelEvent::Connected(*ev));
        Ok(())
    }

    fn disconnected(&mut self, ev: &QpDisconnected) -> Result<()> {
        self.push(KernelEvent::Disconnected(*ev));
        Ok(())
    }
}

/// Writes each record whole to a channel such as the urdma chardev
pub struct RecordLink<W: Write> {
    out: W,
}

impl<W: Write> RecordLink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, ev: KernelEvent) -> Result<()> {
        let rec = ev.encode();
        let n = self.out.write(&rec)?;
        if n != rec.len() {
            return Err(Error::ShortMessage { expected: rec.len(), got: n });
        }
        Ok(())
    }
}

impl<W: Write> QpLink for RecordLink<W> {
    fn connected(&mut self, ev: &QpConnected) -> Result<()> {
        self.write(KernelEvent::Connected(*ev))
    }

    fn disconnected(&mut self, ev: &QpDisconnected) -> Result<()> {
        self.write(KernelEvent::Disconnected(*ev))
    }
}

/// RTR outcome for the QP with this kernel id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtrNotice {
    Success(u32),
    Failure(u32),
}

/// Thread-safe sender of RTR outcomes into the CM loop
#[derive(Clone)]
pub struct RtrNotifier {
    queue: Arc<SegQueue<RtrNotice>>,
    wake: Arc<EventFd>,
}

impl RtrNotifier {
    pub(crate) fn new(queue: Arc<SegQueue<RtrNotice>>, wake: Arc<EventFd>) -> Self {
        Self { queue, wake }
    }

    pub fn success(&self, kmod_qp_id: u32) -> Result<()> {
        self.send(RtrNotice::Success(kmod_qp_id))
    }

    pub fn failure(&self, kmod_qp_id: u32) -> Result<()> {
        self.send(RtrNotice::Failure(kmod_qp_id))
    }

    fn send(&self, notice: RtrNotice) -> Result<()> {
        self.queue.push(notice);
        self.wake.notify()
    }
}
