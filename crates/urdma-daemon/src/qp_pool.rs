//! Queue-pair slots and per-port free lists
//!
//! Every port owns `max_qp` slots, ids `1..=max_qp`; QP 0 carries port
//! control traffic and is never handed out. Free ids sit on a LIFO stack
//! so the most recently released slot is reused first.
//!
//! # Publication
//!
//! A slot's connection parameters are shared with the packet-processing
//! core. Writers fill them in under the slot's [`SpinLock`] and then
//! publish `Connected` with a Release store; readers check the state
//! with an Acquire load before copying the parameters out.

use core::sync::atomic::{AtomicU8, Ordering};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use urdma_core::error::{Error, Result};
use urdma_core::ids::{DevId, QpId};
use urdma_core::spinlock::SpinLock;

use crate::config::PortConfig;
use crate::process::ProcessId;

/// The one port MTU that selects the jumbo class
pub const JUMBO_PORT_MTU: u16 = 9000;
pub const MTU_CLASS_JUMBO: u16 = 8192;
pub const MTU_CLASS_STANDARD: u16 = 1024;

/// iWARP MTU class for a port MTU
#[inline]
pub const fn mtu_class(port_mtu: u16) -> u16 {
    match port_mtu {
        JUMBO_PORT_MTU => MTU_CLASS_JUMBO,
        _ => MTU_CLASS_STANDARD,
    }
}

/// Connection state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QpConnState {
    /// On the free list
    Idle = 0,
    /// Owned by a process, not yet connected
    Unconnected = 1,
    Connected = 2,
    /// Connection torn down or failed; stays until the owner releases it
    Error = 3,
}

impl From<u8> for QpConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => QpConnState::Idle,
            1 => QpConnState::Unconnected,
            2 => QpConnState::Connected,
            _ => QpConnState::Error,
        }
    }
}

/// Negotiated parameters of a connected QP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpParams {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub ord_max: u16,
    pub ird_max: u16,
    pub mtu: u16,
    pub rx_desc_count: u16,
    pub remote_ether: [u8; 6],
}

#[derive(Debug, Default)]
struct QpConn {
    owner: Option<ProcessId>,
    params: Option<QpParams>,
}

/// One queue pair
pub struct QpSlot {
    dev_id: DevId,
    qp_id: QpId,
    state: AtomicU8,
    conn: SpinLock<QpConn>,
}

impl QpSlot {
    fn new(dev_id: DevId, qp_id: QpId) -> Self {
        Self {
            dev_id,
            qp_id,
            state: AtomicU8::new(QpConnState::Idle as u8),
            conn: SpinLock::new(QpConn::default()),
        }
    }

    #[inline]
    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    #[inline]
    pub fn qp_id(&self) -> QpId {
        self.qp_id
    }

    /// Hardware rx queue serving this QP
    #[inline]
    pub fn rx_queue(&self) -> u16 {
        self.qp_id.as_u16()
    }

    #[inline]
    pub fn tx_queue(&self) -> u16 {
        self.qp_id.as_u16()
    }

    #[inline]
    pub fn state(&self) -> QpConnState {
        QpConnState::from(self.state.load(Ordering::Acquire))
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.conn.lock().owner
    }

    /// Record the connection and publish `Connected`
    ///
    /// Only an owned, unconnected slot can be connected.
    pub fn mark_connected(&self, params: QpParams) -> Result<()> {
        let mut conn = self.conn.lock();
        let state = self.state();
        if state != QpConnState::Unconnected {
            return Err(Error::invariant(format!(
                "QP {}/{} connected in state {:?}",
                self.dev_id, self.qp_id, state
            )));
        }
        conn.params = Some(params);
        self.state.store(QpConnState::Connected as u8, Ordering::Release);
        Ok(())
    }

    /// Publish `Error` for an owned slot; returns false if the slot is free
    pub fn mark_disconnected(&self) -> bool {
        let conn = self.conn.lock();
        if conn.owner.is_none() {
            return false;
        }
        self.state.store(QpConnState::Error as u8, Ordering::Release);
        true
    }

    /// Read path for packet processing: parameters if connected
    pub fn connection(&self) -> Option<QpParams> {
        if self.state() != QpConnState::Connected {
            return None;
        }
        let conn = self.conn.lock();
        // Re-check under the lock: a release may have raced the load above
        if self.state() != QpConnState::Connected {
            return None;
        }
        conn.params
    }
}

/// One port's slots and free stack
pub struct Port {
    config: PortConfig,
    /// Index `qp_id - 1`
    slots: Vec<Arc<QpSlot>>,
    free: Vec<u16>,
}

impl Port {
    fn new(dev_id: DevId, config: PortConfig, max_qp: u16) -> Self {
        Self {
            config,
            slots: (1..=max_qp)
                .map(|q| Arc::new(QpSlot::new(dev_id, QpId::new(q))))
                .collect(),
            // Popped from the back, so 1 comes out first
            free: (1..=max_qp).rev().collect(),
        }
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        self.config.ipv4
    }

    pub fn mtu(&self) -> u16 {
        self.config.mtu
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// QP slots of every port
pub struct QpPool {
    ports: Vec<Port>,
    max_qp: u16,
}

impl QpPool {
    pub fn new(ports: &[PortConfig], max_qp: u16) -> Self {
        Self {
            ports: ports
                .iter()
                .enumerate()
                .map(|(i, &cfg)| Port::new(DevId::new(i as u16), cfg, max_qp))
                .collect(),
            max_qp,
        }
    }

    #[inline]
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    #[inline]
    pub fn max_qp(&self) -> u16 {
        self.max_qp
    }

    pub fn port(&self, dev: DevId) -> Option<&Port> {
        self.ports.get(dev.as_usize())
    }

    /// True if `(dev, qp)` names an allocatable slot
    pub fn is_valid(&self, dev: DevId, qp: QpId) -> bool {
        dev.as_usize() < self.ports.len() && (1..=self.max_qp).contains(&qp.as_u16())
    }

    pub fn slot(&self, dev: DevId, qp: QpId) -> Option<&Arc<QpSlot>> {
        if !self.is_valid(dev, qp) {
            return None;
        }
        self.ports[dev.as_usize()].slots.get(qp.as_usize() - 1)
    }

    /// Hand the next free slot on `dev` to `owner`
    pub fn allocate(&mut self, dev: DevId, owner: ProcessId) -> Result<Arc<QpSlot>> {
        let port = self
            .ports
            .get_mut(dev.as_usize())
            .ok_or_else(|| Error::InvalidArgument(format!("no such device {}", dev)))?;
        let qp = port
            .free
            .pop()
            .ok_or(Error::NoQpAvailable { dev_id: dev.as_u16() })?;

        let slot = Arc::clone(&port.slots[qp as usize - 1]);
        {
            let mut conn = slot.conn.lock();
            conn.owner = Some(owner);
            conn.params = None;
            slot.state.store(QpConnState::Unconnected as u8, Ordering::Release);
        }
        Ok(slot)
    }

    /// Return `owner`'s slot to the free stack, whatever its connection state
    ///
    /// `NotOwner` if `owner` does not hold it, including a slot that is
    /// already free; the free stack is left untouched in that case.
    pub fn release(&mut self, dev: DevId, qp: QpId, owner: ProcessId) -> Result<()> {
        if !self.is_valid(dev, qp) {
            return Err(Error::InvalidArgument(format!("no such QP {}/{}", dev, qp)));
        }
        let port = &mut self.ports[dev.as_usize()];
        let slot = &port.slots[qp.as_usize() - 1];
        {
            let mut conn = slot.conn.lock();
            if conn.owner != Some(owner) {
                return Err(Error::NotOwner { dev_id: dev.as_u16(), qp_id: qp.as_u16() });
            }
            conn.owner = None;
            conn.params = None;
            slot.state.store(QpConnState::Idle as u8, Ordering::Release);
        }
        port.free.push(qp.as_u16());
        Ok(())
    }
}
