//! Daemon event loop
//!
//! One thread, one epoll set:
//!
//! | Token | Source |
//! |-------|--------|
//! | `0` | control socket listener |
//! | `1` | kernel notification channel |
//! | `id + 2` | client process `id` |
//!
//! Each iteration waits up to `poll_timeout`, handles every ready source
//! in arrival order, then gives each port its housekeeping tick.
//! Per-client errors end that client; an invariant violation ends the
//! loop.

use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use urdma_core::core_mask::CorePool;
use urdma_core::error::{Error, ErrorClass, Result};
use urdma_core::ids::{DevId, QpId};
use urdma_core::kabi::{KernelEvent, QpConnected, QpDisconnected};
use urdma_core::poller::{Interest, Poller, Readiness};
use urdma_core::{error_once, warn_once};

use crate::chardev::KernelChannel;
use crate::config::DaemonConfig;
use crate::control::ControlListener;
use crate::port::{PortOps, SteeringRule};
use crate::process::{ProcessId, ProcessRegistry};
use crate::qp_pool::{mtu_class, QpConnState, QpParams, QpPool, QpSlot};
use crate::signal;

const LISTENER_TOKEN: u64 = 0;
const CHARDEV_TOKEN: u64 = 1;
const PROCESS_TOKEN_BASE: u64 = 2;

const MAX_EVENTS: usize = 64;

#[inline]
fn process_token(id: ProcessId) -> u64 {
    id.as_u32() as u64 + PROCESS_TOKEN_BASE
}

/// Builder for [`Daemon`]
#[derive(Default)]
pub struct DaemonBuilder {
    config: Option<DaemonConfig>,
    chardev: Option<KernelChannel>,
}

impl DaemonBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DaemonConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an already open kernel channel instead of `config.chardev`
    pub fn chardev(mut self, chan: KernelChannel) -> Self {
        self.chardev = Some(chan);
        self
    }

    /// Build the daemon
    ///
    /// 1. Validates the config
    /// 2. Opens the kernel channel
    /// 3. Binds the control socket
    /// 4. Sizes the core and QP pools
    /// 5. Registers the listener and channel with epoll
    pub fn build<P: PortOps>(self, ports: P) -> Result<Daemon<P>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let chardev = match self.chardev {
            Some(chan) => chan,
            None => KernelChannel::open(&config.chardev).map_err(|e| {
                error!(path = %config.chardev.display(), error = %e, "cannot open kernel channel");
                e
            })?,
        };
        let listener = ControlListener::bind(&config.sock_name)?;

        let cores = CorePool::new(config.worker_cores);
        let qps = QpPool::new(&config.ports, config.max_qp);

        let poller = Poller::new(MAX_EVENTS)?;
        poller.add(listener.as_raw_fd(), LISTENER_TOKEN, Interest::READABLE)?;
        poller.add(chardev.as_raw_fd(), CHARDEV_TOKEN, Interest::READABLE)?;

        info!(
            ports = config.ports.len(),
            max_qp = config.max_qp,
            cores = cores.total(),
            flow_director = config.flow_director,
            "daemon ready"
        );

        Ok(Daemon {
            config,
            ports,
            cores,
            qps,
            registry: ProcessRegistry::new(),
            listener,
            chardev,
            poller,
            ready: Vec::with_capacity(MAX_EVENTS),
        })
    }
}

pub struct Daemon<P: PortOps> {
    config: DaemonConfig,
    ports: P,
    cores: CorePool,
    qps: QpPool,
    registry: ProcessRegistry,
    listener: ControlListener,
    chardev: KernelChannel,
    poller: Poller,
    ready: Vec<Readiness>,
}

impl<P: PortOps> Daemon<P> {
    /// Loop until SIGINT/SIGTERM or a fatal error
    pub fn run(&mut self) -> Result<()> {
        while !signal::shutdown_requested() {
            if let Err(e) = self.poll_once() {
                error!(error = %e, "daemon stopping");
                self.shutdown();
                return Err(e);
            }
        }
        info!("shutdown requested");
        self.shutdown();
        Ok(())
    }

    /// One loop iteration; returns the number of ready sources handled
    pub fn poll_once(&mut self) -> Result<usize> {
        // ── Step 1: Wait for readiness ──
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        self.poller.wait(&mut ready, Some(self.config.poll_timeout))?;

        // ── Step 2: Dispatch in arrival order ──
        let mut result = Ok(());
        for r in &ready {
            let res = match r.token {
                LISTENER_TOKEN => self.accept_clients(),
                CHARDEV_TOKEN => self.on_chardev(),
                t => self.on_process(ProcessId::new((t - PROCESS_TOKEN_BASE) as u32), r),
            };
            if let Err(e) = res {
                result = Err(e);
                break;
            }
        }
        let handled = ready.len();
        self.ready = ready;
        result?;

        // ── Step 3: Port housekeeping ──
        self.ports.tick();

        Ok(handled)
    }

    /// Drop every client, returning their resources
    pub fn shutdown(&mut self) {
        for id in self.registry.ids() {
            if let Err(e) = self.drop_process(id) {
                error!(process = %id, error = %e, "cleanup failed during shutdown");
            }
        }
    }

    // ── Accessors ──

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn cores(&self) -> &CorePool {
        &self.cores
    }

    pub fn qps(&self) -> &QpPool {
        &self.qps
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut P {
        &mut self.ports
    }

    pub fn process_count(&self) -> usize {
        self.registry.len()
    }

    pub fn control_path(&self) -> &Path {
        self.listener.path()
    }

    // ── Control channel ──

    fn accept_clients(&mut self) -> Result<()> {
        loop {
            let fd = match self.listener.accept() {
                Ok(Some(fd)) => fd,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Ok(());
                }
            };
            let raw = fd.as_raw_fd();
            let id = self.registry.register(fd);
            if let Err(e) = self.poller.add(raw, process_token(id), Interest::READABLE | Interest::HANGUP) {
                warn!(process = %id, error = %e, "cannot watch client");
                self.registry.remove(id);
                continue;
            }
            info!(process = %id, "client connected");
        }
    }

    fn on_process(&mut self, id: ProcessId, r: &Readiness) -> Result<()> {
        let Some(proc) = self.registry.get_mut(id) else {
            return Ok(());
        };

        let res = if r.readable {
            proc.service(&mut self.cores, &mut self.qps)
        } else if r.hangup || r.error {
            Err(Error::PeerClosed)
        } else {
            Ok(())
        };

        match res {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                match e.class() {
                    ErrorClass::ProtocolViolation => {
                        error_once!(process = %id, error = %e, "client protocol violation")
                    }
                    ErrorClass::TransportError => debug!(process = %id, error = %e, "client gone"),
                    _ => warn!(process = %id, error = %e, "client request failed"),
                }
                self.drop_process(id)
            }
        }
    }

    /// The single cleanup path for a client
    fn drop_process(&mut self, id: ProcessId) -> Result<()> {
        let Some(mut proc) = self.registry.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.poller.delete(proc.as_raw_fd()) {
            debug!(process = %id, error = %e, "epoll delete failed");
        }
        let released = proc.session_mut().cleanup(&mut self.cores, &mut self.qps)?;
        info!(
            process = %id,
            qps = released.qps.len(),
            cores = released.cores.count(),
            "client disconnected"
        );
        Ok(())
    }

    // ── Kernel channel ──

    fn on_chardev(&mut self) -> Result<()> {
        match self.chardev.read_event()? {
            Some(ev) => self.handle_kernel_event(ev),
            None => Ok(()),
        }
    }

    /// Apply one kernel record
    pub fn handle_kernel_event(&mut self, ev: KernelEvent) -> Result<()> {
        match ev {
            KernelEvent::Connected(rec) => self.on_qp_connected(&rec),
            KernelEvent::Disconnected(rec) => self.on_qp_disconnected(&rec),
            KernelEvent::Rtr(rec) => {
                warn_once!(kmod_qp_id = rec.kmod_qp_id, "QP_RTR from kernel ignored");
                Ok(())
            }
        }
    }

    fn kernel_slot(&self, dev_id: u16, qp_id: u16) -> Result<Arc<QpSlot>> {
        self.qps
            .slot(DevId::new(dev_id), QpId::new(qp_id))
            .cloned()
            .ok_or_else(|| Error::invariant(format!("kernel named unknown QP {}/{}", dev_id, qp_id)))
    }

    fn steering(&self, dev: DevId) -> bool {
        self.config.flow_director && self.ports.has_flow_director(dev)
    }

    fn on_qp_connected(&mut self, rec: &QpConnected) -> Result<()> {
        let slot = self.kernel_slot(rec.dev_id, rec.qp_id)?;
        let (dev, qp) = (slot.dev_id(), slot.qp_id());
        let (port_ipv4, port_mtu) = match self.qps.port(dev) {
            Some(port) => (port.ipv4(), port.mtu()),
            None => return Err(Error::invariant(format!("no port {}", dev))),
        };

        let state = slot.state();
        if state != QpConnState::Unconnected {
            return Err(Error::invariant(format!("QP {}/{} connected in state {:?}", dev, qp, state)));
        }
        if rec.src.port() == 0 {
            return Err(Error::invariant(format!("QP {}/{} connected from port 0", dev, qp)));
        }
        if *rec.src.ip() != port_ipv4 {
            return Err(Error::invariant(format!(
                "QP {}/{} source {} is not port address {}",
                dev,
                qp,
                rec.src.ip(),
                port_ipv4
            )));
        }
        if rec.rxq != slot.rx_queue() || rec.txq != slot.tx_queue() {
            return Err(Error::invariant(format!(
                "QP {}/{} queues rx {} tx {}, expected rx {} tx {}",
                dev,
                qp,
                rec.rxq,
                rec.txq,
                slot.rx_queue(),
                slot.tx_queue()
            )));
        }

        let params = QpParams {
            local: rec.src,
            remote: rec.dst,
            ord_max: rec.ord_max,
            ird_max: rec.ird_max,
            mtu: mtu_class(port_mtu),
            rx_desc_count: self
                .ports
                .rx_queue_desc_count(dev, qp)
                .unwrap_or(self.config.rx_desc_count),
            remote_ether: rec.dst_ether,
        };

        if let Err(e) = self.start_dataplane(&slot, rec.src) {
            error!(dev = %dev, qp = %qp, error = %e, "cannot start QP dataplane");
            slot.mark_disconnected();
            return Ok(());
        }

        slot.mark_connected(params)?;
        self.chardev.write_rtr(rec.kmod_qp_id)?;
        info!(
            dev = %dev,
            qp = %qp,
            kmod_qp_id = rec.kmod_qp_id,
            remote = %rec.dst,
            mtu = params.mtu,
            "QP ready to receive"
        );
        Ok(())
    }

    fn start_dataplane(&mut self, slot: &QpSlot, local: SocketAddrV4) -> Result<()> {
        let (dev, qp) = (slot.dev_id(), slot.qp_id());
        let rule = self.steering(dev).then(|| SteeringRule {
            dst_ip: *local.ip(),
            dst_port: local.port(),
            rx_queue: slot.rx_queue(),
        });

        if let Some(rule) = rule {
            self.ports.add_steering_rule(dev, rule)?;
        }
        if let Err(e) = self.ports.start_queues(dev, qp) {
            if let Some(rule) = rule {
                if let Err(re) = self.ports.remove_steering_rule(dev, rule) {
                    warn!(dev = %dev, qp = %qp, error = %re, "steering rule rollback failed");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn on_qp_disconnected(&mut self, rec: &QpDisconnected) -> Result<()> {
        let slot = self.kernel_slot(rec.dev_id, rec.qp_id)?;
        let (dev, qp) = (slot.dev_id(), slot.qp_id());

        if self.steering(dev) {
            if let Some(params) = slot.connection() {
                let rule = SteeringRule {
                    dst_ip: *params.local.ip(),
                    dst_port: params.local.port(),
                    rx_queue: slot.rx_queue(),
                };
                if let Err(e) = self.ports.remove_steering_rule(dev, rule) {
                    debug!(dev = %dev, qp = %qp, error = %e, "steering rule removal failed");
                }
            }
        }

        let dropped = self.ports.drain_rx_queue(dev, qp);
        slot.mark_disconnected();
        info!(dev = %dev, qp = %qp, dropped, "QP disconnected");
        Ok(())
    }
}
