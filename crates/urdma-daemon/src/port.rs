//! Port boundary
//!
//! The daemon programs NIC queues and flow steering through [`PortOps`].
//! [`SoftPorts`] keeps the same bookkeeping in memory; it backs the
//! daemon when no NIC driver is attached and records every call for
//! inspection.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use tracing::debug;
use urdma_core::error::{Error, Result};
use urdma_core::ids::{DevId, QpId};

/// Steer UDP traffic for one QP to its rx queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SteeringRule {
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub rx_queue: u16,
}

/// Per-port NIC operations the event loop needs
pub trait PortOps {
    fn has_flow_director(&self, dev: DevId) -> bool;

    fn add_steering_rule(&mut self, dev: DevId, rule: SteeringRule) -> Result<()>;

    fn remove_steering_rule(&mut self, dev: DevId, rule: SteeringRule) -> Result<()>;

    /// Start the rx and tx queues of `qp`
    fn start_queues(&mut self, dev: DevId, qp: QpId) -> Result<()>;

    /// Ring size of the QP's rx queue, if the port can report it
    fn rx_queue_desc_count(&self, dev: DevId, qp: QpId) -> Option<u16>;

    /// Discard whatever is queued on the QP's rx queue; returns packets dropped
    fn drain_rx_queue(&mut self, dev: DevId, qp: QpId) -> usize;

    /// Periodic housekeeping, once per loop iteration
    fn tick(&mut self);
}

#[derive(Debug, Default)]
struct SoftPort {
    flow_director: bool,
    rules: HashSet<SteeringRule>,
    started: HashSet<u16>,
    /// Packets waiting per rx queue
    backlog: HashMap<u16, usize>,
    desc_count: Option<u16>,
}

/// In-memory ports
#[derive(Debug, Default)]
pub struct SoftPorts {
    ports: Vec<SoftPort>,
    ticks: u64,
    fail_steering: bool,
    fail_start: bool,
    fail_remove: bool,
}

impl SoftPorts {
    pub fn new(port_count: usize, flow_director: bool) -> Self {
        Self {
            ports: (0..port_count)
                .map(|_| SoftPort { flow_director, ..Default::default() })
                .collect(),
            ..Default::default()
        }
    }

    /// Report this ring size for every rx queue
    pub fn with_desc_count(mut self, n: u16) -> Self {
        for p in &mut self.ports {
            p.desc_count = Some(n);
        }
        self
    }

    /// Make subsequent rule installs fail
    pub fn fail_steering(&mut self, fail: bool) {
        self.fail_steering = fail;
    }

    /// Make subsequent queue starts fail
    pub fn fail_start(&mut self, fail: bool) {
        self.fail_start = fail;
    }

    /// Make subsequent rule removals fail
    pub fn fail_remove(&mut self, fail: bool) {
        self.fail_remove = fail;
    }

    /// Queue packets on an rx queue
    pub fn inject(&mut self, dev: DevId, qp: QpId, packets: usize) {
        if let Some(p) = self.ports.get_mut(dev.as_usize()) {
            *p.backlog.entry(qp.as_u16()).or_default() += packets;
        }
    }

    pub fn rules(&self, dev: DevId) -> Vec<SteeringRule> {
        self.ports
            .get(dev.as_usize())
            .map(|p| p.rules.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_started(&self, dev: DevId, qp: QpId) -> bool {
        self.ports
            .get(dev.as_usize())
            .is_some_and(|p| p.started.contains(&qp.as_u16()))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn port_mut(&mut self, dev: DevId) -> Result<&mut SoftPort> {
        self.ports
            .get_mut(dev.as_usize())
            .ok_or_else(|| Error::InvalidArgument(format!("no such port {}", dev)))
    }
}

impl PortOps for SoftPorts {
    fn has_flow_director(&self, dev: DevId) -> bool {
        self.ports.get(dev.as_usize()).is_some_and(|p| p.flow_director)
    }

    fn add_steering_rule(&mut self, dev: DevId, rule: SteeringRule) -> Result<()> {
        if self.fail_steering {
            return Err(Error::Io(std::io::Error::other("flow rule table full")));
        }
        let port = self.port_mut(dev)?;
        if !port.rules.insert(rule) {
            return Err(Error::InvalidArgument(format!("duplicate steering rule {:?}", rule)));
        }
        debug!(dev = %dev, ?rule, "steering rule added");
        Ok(())
    }

    fn remove_steering_rule(&mut self, dev: DevId, rule: SteeringRule) -> Result<()> {
        if self.fail_remove {
            return Err(Error::Io(std::io::Error::other("flow rule busy")));
        }
        let port = self.port_mut(dev)?;
        if !port.rules.remove(&rule) {
            return Err(Error::InvalidArgument(format!("no steering rule {:?}", rule)));
        }
        debug!(dev = %dev, ?rule, "steering rule removed");
        Ok(())
    }

    fn start_queues(&mut self, dev: DevId, qp: QpId) -> Result<()> {
        if self.fail_start {
            return Err(Error::Io(std::io::Error::other("queue start failed")));
        }
        self.port_mut(dev)?.started.insert(qp.as_u16());
        Ok(())
    }

    fn rx_queue_desc_count(&self, dev: DevId, _qp: QpId) -> Option<u16> {
        self.ports.get(dev.as_usize()).and_then(|p| p.desc_count)
    }

    fn drain_rx_queue(&mut self, dev: DevId, qp: QpId) -> usize {
        let Some(port) = self.ports.get_mut(dev.as_usize()) else {
            return 0;
        };
        port.started.remove(&qp.as_u16());
        port.backlog.remove(&qp.as_u16()).unwrap_or(0)
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }
}
