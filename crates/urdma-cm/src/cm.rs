//! `ConnectionManager`: CEP lifecycle and the MPA handshake
//!
//! ```text
//! passive:  Listening ──accept──▶ AwaitingPeerHandshakeRequest ──req──▶ HandshakeRequestReceived
//!                                        │                                  │ accept()
//!                                        │                                  ▼
//!                                        │                              Accepting ──▶ AwaitingRtr ──rtr──▶ RdmaMode
//!                                        ▼                                                 ▲
//! active:   Connecting ──connected──▶ AwaitingHandshakeReply ──rep──▶ HandshakeReplyReceived ┘
//!
//! any state ──close / hangup / timeout / bad frame──▶ Closed
//! ```
//!
//! The manager is single-threaded. Readiness is turned into deferred
//! work, and all state changes happen in work handlers or in the public
//! operations, one at a time. RTR outcomes from other threads arrive
//! through an [`RtrNotifier`].
//!
//! # Reference Counting
//!
//! A CEP is created holding one reference, dropped when its transport
//! closes. Every scheduled work item holds one until it fires or is
//! cancelled, and every passively created CEP holds one on its listener.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{debug, info, warn};
use urdma_core::error::{Error, Result};
use urdma_core::kabi::KernelEvent;
use urdma_core::poller::{Interest, Poller, Readiness};

use crate::cep::{Cep, CepId, CepTable};
use crate::config::CmConfig;
use crate::link::{BoundQp, CloseReason, CmEvent, QpLink, RtrNotice, RtrNotifier};
use crate::mpa::{encode_frame, FrameKind, Progress, FLAG_REJECT};
use crate::notifier::EventFd;
use crate::state::CepState;
use crate::transport::LlpSocket;
use crate::work::{WorkDispatcher, WorkItem, WorkStats, WorkType};

/// Poll token of the RTR wake eventfd; CEP tokens never reach it
const RTR_TOKEN: u64 = u64::MAX;

/// Interest while waiting for a handshake frame
fn handshake_interest() -> Interest {
    Interest::READABLE | Interest::HANGUP
}

/// Builder for a [`ConnectionManager`]
#[derive(Default)]
pub struct CmBuilder {
    config: Option<CmConfig>,
}

impl CmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the manager
    ///
    /// 1. Validates the config
    /// 2. Creates the epoll set
    /// 3. Creates the RTR wake eventfd and registers it
    pub fn build<L: QpLink>(self, link: L) -> Result<ConnectionManager<L>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let poller = Poller::new(config.max_events)?;

        let rtr_wake = Arc::new(EventFd::create()?);
        poller.add(rtr_wake.fd(), RTR_TOKEN, Interest::READABLE)?;

        Ok(ConnectionManager {
            ceps: CepTable::new(config.pdata_max),
            work: WorkDispatcher::new(),
            link,
            poller,
            rtr_queue: Arc::new(SegQueue::new()),
            rtr_wake,
            bound: HashMap::new(),
            ready: Vec::with_capacity(config.max_events),
            config,
        })
    }
}

pub struct ConnectionManager<L: QpLink> {
    config: CmConfig,
    ceps: CepTable,
    work: WorkDispatcher,
    link: L,
    poller: Poller,
    rtr_queue: Arc<SegQueue<RtrNotice>>,
    rtr_wake: Arc<EventFd>,
    /// kmod_qp_id -> CEP whose QP was reported connected
    bound: HashMap<u32, CepId>,
    ready: Vec<Readiness>,
}

fn lookup(ceps: &mut CepTable, id: CepId) -> Result<&mut Cep> {
    ceps.get_mut(id)
        .ok_or_else(|| Error::InvalidArgument(format!("no such endpoint {:?}", id)))
}

impl<L: QpLink> ConnectionManager<L> {
    // ── Public operations ──

    /// Bind a listening CEP; `AddressInUse` if the address is taken
    pub fn create_listener(&mut self, addr: SocketAddrV4, events: Sender<CmEvent>) -> Result<CepId> {
        let socket = LlpSocket::listen(addr)?;
        let local = socket.local_addr()?;

        let id = self.ceps.insert();
        if let Err(e) = self.poller.add(socket.as_raw_fd(), id.to_token(), Interest::READABLE) {
            self.ceps.release(id)?;
            return Err(e);
        }

        let cep = lookup(&mut self.ceps, id)?;
        cep.state = CepState::Listening;
        cep.local_addr = Some(local);
        cep.socket = Some(socket);
        cep.events = Some(events);

        info!(cep = %id, addr = %local, "listening");
        Ok(id)
    }

    /// Stop listening; children already accepted are not affected
    pub fn destroy_listener(&mut self, id: CepId) -> Result<()> {
        let state = lookup(&mut self.ceps, id)?.state;
        if state != CepState::Listening {
            return Err(Error::InvalidState { op: "destroy_listener", state: state.name() });
        }
        self.close(id)
    }

    /// Start an active connection carrying `private_data` in the MPA request
    ///
    /// The whole handshake must finish within the request timeout.
    pub fn initiate(
        &mut self,
        remote: SocketAddrV4,
        private_data: &[u8],
        qp: BoundQp,
        events: Sender<CmEvent>,
    ) -> Result<CepId> {
        if private_data.len() > self.config.pdata_max {
            return Err(Error::InvalidArgument(format!(
                "private data length {} exceeds maximum {}",
                private_data.len(),
                self.config.pdata_max
            )));
        }

        let socket = LlpSocket::connect(remote)?;
        let id = self.ceps.insert();
        let interest = Interest::WRITABLE | Interest::HANGUP;
        if let Err(e) = self.poller.add(socket.as_raw_fd(), id.to_token(), interest) {
            self.ceps.release(id)?;
            return Err(e);
        }

        let timeout = self.config.mpa_request_timeout;
        let cep = lookup(&mut self.ceps, id)?;
        cep.state = CepState::Connecting;
        cep.remote_addr = Some(remote);
        cep.pdata = private_data.to_vec();
        cep.qp = Some(qp);
        cep.socket = Some(socket);
        cep.events = Some(events);
        cep.deadline = Some(Instant::now() + timeout);

        self.schedule(id, WorkType::Timeout, timeout)?;
        debug!(cep = %id, remote = %remote, "connecting");
        Ok(id)
    }

    /// Accept a received request: send the reply and report the QP connected
    ///
    /// Valid only in `HandshakeRequestReceived`; otherwise nothing changes.
    pub fn accept(&mut self, id: CepId, private_data: &[u8], qp: BoundQp) -> Result<()> {
        let frame = self.reply_frame(id, "accept", 0, private_data)?;

        let cep = lookup(&mut self.ceps, id)?;
        cep.state = CepState::Accepting;
        cep.qp = Some(qp);

        if let Err(e) = self.send(id, &frame) {
            self.close_now(id, CloseReason::TransportError)?;
            return Err(e);
        }
        if let Err(e) = self.establish(id) {
            self.fail(id, e)?;
        }
        Ok(())
    }

    /// Refuse a received request with a reject-flagged reply
    pub fn reject(&mut self, id: CepId, private_data: &[u8]) -> Result<()> {
        let frame = self.reply_frame(id, "reject", FLAG_REJECT, private_data)?;

        if let Err(e) = self.send(id, &frame) {
            self.close_now(id, CloseReason::TransportError)?;
            return Err(e);
        }
        self.close_now(id, CloseReason::Rejected)
    }

    /// Close a CEP from the local side
    pub fn close(&mut self, id: CepId) -> Result<()> {
        lookup(&mut self.ceps, id)?;
        self.cancel(id)?;
        self.schedule(id, WorkType::CloseTransport, Duration::ZERO)?;
        Ok(())
    }

    /// The QP behind `kmod_qp_id` reached RTR
    pub fn notify_rtr_success(&mut self, kmod_qp_id: u32) -> Result<()> {
        let Some(id) = self.awaiting_rtr(kmod_qp_id) else {
            return Ok(());
        };
        if self.close_pending(id) {
            debug!(cep = %id, kmod_qp_id, "RTR after close, ignoring");
            return Ok(());
        }
        self.cancel(id)?;

        let cep = lookup(&mut self.ceps, id)?;
        cep.state = CepState::RdmaMode;
        cep.deadline = None;
        cep.notify(CmEvent::Established { cep: id });

        info!(cep = %id, kmod_qp_id, "established");
        Ok(())
    }

    /// The QP behind `kmod_qp_id` could not be brought up
    pub fn notify_rtr_failure(&mut self, kmod_qp_id: u32) -> Result<()> {
        match self.awaiting_rtr(kmod_qp_id) {
            Some(id) => self.close_now(id, CloseReason::RtrFailed),
            None => Ok(()),
        }
    }

    /// Consume one record from the kernel channel
    ///
    /// Only `QP_RTR` is meaningful here; it counts as RTR success.
    pub fn handle_kernel_record(&mut self, buf: &[u8]) -> Result<()> {
        match KernelEvent::decode(buf)? {
            KernelEvent::Rtr(rtr) => self.notify_rtr_success(rtr.kmod_qp_id),
            other => {
                debug!(event_type = other.event_type(), "ignoring kernel record");
                Ok(())
            }
        }
    }

    /// Handle for delivering RTR outcomes from other threads
    pub fn rtr_notifier(&self) -> RtrNotifier {
        RtrNotifier::new(Arc::clone(&self.rtr_queue), Arc::clone(&self.rtr_wake))
    }

    /// Take a reference on a CEP
    pub fn acquire(&mut self, id: CepId) -> Result<()> {
        self.ceps.acquire(id)
    }

    /// Drop a reference; at zero the CEP is destroyed and its listener released
    pub fn release(&mut self, id: CepId) -> Result<()> {
        let Some(cep) = self.ceps.release(id)? else {
            return Ok(());
        };
        debug!(cep = %id, "destroyed");
        if let Some(listener) = cep.listener {
            self.release(listener)?;
        }
        Ok(())
    }

    // ── Accessors ──

    pub fn cep(&self, id: CepId) -> Option<&Cep> {
        self.ceps.get(id)
    }

    pub fn state(&self, id: CepId) -> Option<CepState> {
        self.ceps.get(id).map(|c| c.state)
    }

    /// Live CEPs, including closed ones still referenced
    pub fn len(&self) -> usize {
        self.ceps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ceps.is_empty()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn config(&self) -> &CmConfig {
        &self.config
    }

    pub fn work_stats(&self) -> WorkStats {
        self.work.stats()
    }

    /// Earliest pending work deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.work.next_deadline()
    }

    // ── Event loop ──

    /// Run one loop iteration, waiting at most `max_wait` (`None`: until
    /// readiness or the next work deadline)
    ///
    /// Returns the number of readiness events plus work items handled.
    /// Errors are fatal; per-connection failures close the CEP instead.
    pub fn poll(&mut self, max_wait: Option<Duration>) -> Result<usize> {
        // ── Step 1: Bound the wait by the earliest work deadline ──
        let now = Instant::now();
        let timeout = match (self.work.next_deadline(), max_wait) {
            (Some(d), Some(w)) => Some(d.saturating_duration_since(now).min(w)),
            (Some(d), None) => Some(d.saturating_duration_since(now)),
            (None, w) => w,
        };

        // ── Step 2: Wait for readiness ──
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        self.poller.wait(&mut ready, timeout)?;

        // ── Step 3: Turn readiness into work ──
        let mut result = Ok(());
        for r in &ready {
            if r.token == RTR_TOKEN {
                self.rtr_wake.drain();
                continue;
            }
            let id = CepId::from_token(r.token);
            if !self.ceps.contains(id) {
                continue;
            }
            if let Err(e) = self.on_ready(id, r) {
                result = Err(e);
                break;
            }
        }
        let handled = ready.len();
        self.ready = ready;
        result?;

        // ── Step 4: Drain marshaled RTR outcomes ──
        self.drain_rtr()?;

        // ── Step 5: Run due work ──
        let fired = self.run_expired(Instant::now())?;

        Ok(handled + fired)
    }

    /// Fire every work item due at `now`, in deadline order
    pub fn run_expired(&mut self, now: Instant) -> Result<usize> {
        let mut fired = 0;
        while let Some((id, handle)) = self.work.pop_expired(now) {
            let Some(cep) = self.ceps.get_mut(id) else {
                return Err(Error::invariant(format!("work fired for destroyed {:?}", id)));
            };
            // Detach before running so the handler may schedule again
            let Some(item) = cep.work.complete(handle) else {
                debug!(cep = %id, "stale work handle");
                continue;
            };

            let res = self.dispatch(item);
            self.release(id)?;
            res?;
            fired += 1;
        }
        Ok(fired)
    }

    fn drain_rtr(&mut self) -> Result<()> {
        while let Some(notice) = self.rtr_queue.pop() {
            match notice {
                RtrNotice::Success(kmod) => self.notify_rtr_success(kmod)?,
                RtrNotice::Failure(kmod) => self.notify_rtr_failure(kmod)?,
            }
        }
        Ok(())
    }

    fn on_ready(&mut self, id: CepId, r: &Readiness) -> Result<()> {
        let state = lookup(&mut self.ceps, id)?.state;
        if self.close_pending(id) {
            return Ok(());
        }
        let res = if state == CepState::Connecting && (r.writable || r.error || r.hangup) {
            self.on_writable(id)
        } else if r.readable {
            self.on_readable(id, state)
        } else if r.hangup || r.error {
            self.on_hangup(id, state)
        } else {
            Ok(())
        };
        match res {
            Err(e) => self.fail(id, e),
            Ok(()) => Ok(()),
        }
    }

    /// Active connect finished, successfully or not
    fn on_writable(&mut self, id: CepId) -> Result<()> {
        let cep = lookup(&mut self.ceps, id)?;
        let socket = cep
            .socket
            .as_ref()
            .ok_or_else(|| Error::invariant(format!("{:?} connecting without a socket", id)))?;
        if let Some(e) = socket.take_error()? {
            return Err(e.into());
        }

        let local = socket.local_addr()?;
        let fd = socket.as_raw_fd();
        let frame = encode_frame(FrameKind::Request, 0, &cep.pdata, self.config.pdata_max)?;
        cep.local_addr = Some(local);
        cep.mpa.reset(FrameKind::Reply);

        self.send(id, &frame)?;
        self.poller.modify(fd, id.to_token(), handshake_interest())?;
        lookup(&mut self.ceps, id)?.state = CepState::AwaitingHandshakeReply;

        debug!(cep = %id, local = %local, "connected, MPA request sent");
        Ok(())
    }

    fn on_readable(&mut self, id: CepId, state: CepState) -> Result<()> {
        match state {
            CepState::Listening => match self.schedule(id, WorkType::BeginAccept, Duration::ZERO) {
                Err(Error::AlreadyScheduled) => Ok(()),
                other => other,
            },
            s if s.is_reading_handshake() => {
                self.cancel(id)?;
                self.schedule(id, WorkType::ReadHandshakeHeader, Duration::ZERO)
            }
            s => {
                debug!(cep = %id, state = %s, "ignoring readable");
                Ok(())
            }
        }
    }

    fn on_hangup(&mut self, id: CepId, state: CepState) -> Result<()> {
        if state.is_closed() || state == CepState::Listening {
            return Ok(());
        }
        self.cancel(id)?;
        self.schedule(id, WorkType::PeerClosed, Duration::ZERO)
    }

    // ── Work scheduling ──

    /// Arm work for a CEP; the item holds a reference until it fires
    fn schedule(&mut self, id: CepId, kind: WorkType, delay: Duration) -> Result<()> {
        let cep = lookup(&mut self.ceps, id)?;
        if cep.state.is_closed() {
            return Err(Error::InvalidState { op: "schedule", state: cep.state.name() });
        }
        self.work.schedule(id, &mut cep.work, kind, delay)?;
        self.ceps.acquire(id)
    }

    /// A queued close must not be displaced by readiness or RTR
    fn close_pending(&self, id: CepId) -> bool {
        self.ceps
            .get(id)
            .and_then(|c| c.work().pending())
            .is_some_and(|w| matches!(w.kind, WorkType::CloseTransport | WorkType::PeerClosed))
    }

    /// Disarm the CEP's pending work and drop its reference
    fn cancel(&mut self, id: CepId) -> Result<bool> {
        let cep = lookup(&mut self.ceps, id)?;
        if self.work.cancel(&mut cep.work).is_none() {
            return Ok(false);
        }
        self.release(id)?;
        Ok(true)
    }

    fn dispatch(&mut self, item: WorkItem) -> Result<()> {
        let id = item.cep;
        let res = match item.kind {
            WorkType::BeginAccept => self.begin_accept(id),
            WorkType::ReadHandshakeHeader => self.read_handshake(id),
            WorkType::CloseTransport => self.close_now(id, CloseReason::Local),
            WorkType::PeerClosed => self.close_now(id, CloseReason::PeerClosed),
            WorkType::Timeout => self.handle_timeout(id),
        };
        match res {
            Err(e) => self.fail(id, e),
            Ok(()) => Ok(()),
        }
    }

    // ── Work handlers ──

    fn begin_accept(&mut self, listener: CepId) -> Result<()> {
        loop {
            let cep = lookup(&mut self.ceps, listener)?;
            if cep.state != CepState::Listening {
                return Ok(());
            }
            let Some(socket) = cep.socket.as_ref() else {
                return Ok(());
            };
            let accepted = socket.accept();
            match accepted {
                Ok(Some((stream, peer))) => {
                    if let Err(e) = self.spawn_child(listener, stream, peer) {
                        self.child_setup_failed(listener, peer, e)?;
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    // Listener stays up; the peer's connect fails on its side
                    warn!(cep = %listener, error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    /// A child that cannot be set up is dropped; the listener keeps accepting
    fn child_setup_failed(&self, listener: CepId, peer: SocketAddrV4, err: Error) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        warn!(cep = %listener, peer = %peer, error = %err, "cannot set up accepted connection");
        Ok(())
    }

    fn spawn_child(&mut self, listener: CepId, socket: LlpSocket, peer: SocketAddrV4) -> Result<()> {
        let events = lookup(&mut self.ceps, listener)?.events.clone();
        let local = socket.local_addr()?;
        let fd = socket.as_raw_fd();

        let id = self.ceps.insert();
        self.ceps.acquire(listener)?;

        let timeout = self.config.mpa_request_timeout;
        let cep = lookup(&mut self.ceps, id)?;
        cep.state = CepState::AwaitingPeerHandshakeRequest;
        cep.listener = Some(listener);
        cep.local_addr = Some(local);
        cep.remote_addr = Some(peer);
        cep.mpa.reset(FrameKind::Request);
        cep.socket = Some(socket);
        cep.events = events;
        cep.deadline = Some(Instant::now() + timeout);

        if let Err(e) = self.poller.add(fd, id.to_token(), handshake_interest()) {
            warn!(cep = %id, error = %e, "cannot watch accepted socket");
            return self.close_now(id, CloseReason::TransportError);
        }
        if let Err(e) = self.schedule(id, WorkType::Timeout, timeout) {
            self.close_now(id, CloseReason::TransportError)?;
            return Err(e);
        }

        debug!(cep = %id, listener = %listener, peer = %peer, "accepted");
        Ok(())
    }

    fn read_handshake(&mut self, id: CepId) -> Result<()> {
        let cep = lookup(&mut self.ceps, id)?;
        if !cep.state.is_reading_handshake() {
            debug!(cep = %id, state = %cep.state, "ignoring handshake read");
            return Ok(());
        }

        let socket = cep
            .socket
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{:?} reading without a socket", id)))?;
        let progress = cep.mpa.read_from(socket)?;
        match progress {
            Progress::Incomplete => {
                // Resume on the next readable; the original deadline still holds
                let remaining = cep
                    .deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.config.mpa_request_timeout);
                self.schedule(id, WorkType::Timeout, remaining)
            }
            Progress::Complete => self.handshake_frame(id),
        }
    }

    /// A complete MPA frame is in the CEP's receiver
    fn handshake_frame(&mut self, id: CepId) -> Result<()> {
        let cep = lookup(&mut self.ceps, id)?;
        let private_data = cep.mpa.private_data().to_vec();
        let reject = cep.mpa.header().map(|h| h.is_reject()).unwrap_or(false);
        let fd = cep.socket.as_ref().map(|s| s.as_raw_fd());
        cep.deadline = None;

        // Frame is done; only watch for the peer going away
        if let Some(fd) = fd {
            self.poller.modify(fd, id.to_token(), Interest::HANGUP)?;
        }

        let cep = lookup(&mut self.ceps, id)?;
        let state = cep.state;
        match state {
            CepState::AwaitingPeerHandshakeRequest => {
                let listener = cep
                    .listener
                    .ok_or_else(|| Error::invariant(format!("{:?} passive without listener", id)))?;
                cep.state = CepState::HandshakeRequestReceived;
                cep.notify(CmEvent::ConnectRequest { listener, cep: id, private_data });
                debug!(cep = %id, "MPA request received");
                Ok(())
            }
            CepState::AwaitingHandshakeReply => {
                cep.state = CepState::HandshakeReplyReceived;
                cep.notify(CmEvent::ConnectReply { cep: id, accepted: !reject, private_data });
                if reject {
                    debug!(cep = %id, "peer rejected");
                    self.close_now(id, CloseReason::Rejected)
                } else {
                    self.establish(id)
                }
            }
            s => Err(Error::invariant(format!("frame completed in state {}", s))),
        }
    }

    /// Report the bound QP connected and wait for RTR
    fn establish(&mut self, id: CepId) -> Result<()> {
        let cep = lookup(&mut self.ceps, id)?;
        let qp = cep
            .qp
            .ok_or_else(|| Error::InvalidArgument(format!("{:?} has no bound QP", id)))?;
        let (Some(local), Some(remote)) = (cep.local_addr, cep.remote_addr) else {
            return Err(Error::invariant(format!("{:?} establishing without addresses", id)));
        };

        self.link.connected(&qp.connected(local, remote))?;
        self.bound.insert(qp.kmod_qp_id, id);

        let timeout = self.config.mpa_reply_timeout;
        let cep = lookup(&mut self.ceps, id)?;
        cep.qp_established = true;
        cep.state = CepState::AwaitingRtr;
        cep.deadline = Some(Instant::now() + timeout);
        self.schedule(id, WorkType::Timeout, timeout)?;

        debug!(cep = %id, dev_id = qp.dev_id, qp_id = qp.qp_id, "QP connected, awaiting RTR");
        Ok(())
    }

    fn handle_timeout(&mut self, id: CepId) -> Result<()> {
        let state = lookup(&mut self.ceps, id)?.state;
        match state {
            CepState::Connecting | CepState::AwaitingRtr => Err(Error::Timeout),
            s if s.is_reading_handshake() => Err(Error::Timeout),
            s => {
                debug!(cep = %id, state = %s, "ignoring timeout");
                Ok(())
            }
        }
    }

    /// Tear down the transport and drop the creation reference
    fn close_now(&mut self, id: CepId, reason: CloseReason) -> Result<()> {
        if lookup(&mut self.ceps, id)?.state.is_closed() {
            return Ok(());
        }
        self.cancel(id)?;

        let cep = lookup(&mut self.ceps, id)?;
        let prev = cep.state;
        cep.state = CepState::Closed;
        cep.deadline = None;
        let socket = cep.socket.take();
        let qp = cep.qp.take();
        let established = std::mem::replace(&mut cep.qp_established, false);
        cep.notify(CmEvent::Closed { cep: id, reason });

        if let Some(socket) = socket {
            if let Err(e) = self.poller.delete(socket.as_raw_fd()) {
                debug!(cep = %id, error = %e, "epoll delete failed");
            }
        }
        if let (Some(qp), true) = (qp, established) {
            self.bound.remove(&qp.kmod_qp_id);
            if let Err(e) = self.link.disconnected(&qp.disconnected()) {
                warn!(cep = %id, error = %e, "cannot report QP disconnected");
            }
        }

        info!(cep = %id, from = %prev, ?reason, "closed");
        self.release(id)
    }

    /// Close a CEP after a per-connection error; fatal errors propagate
    fn fail(&mut self, id: CepId, err: Error) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        match &err {
            Error::ProtocolViolation(_) => {
                urdma_core::error_once!(cep = %id, error = %err, "MPA protocol violation");
            }
            Error::Timeout | Error::PeerClosed => debug!(cep = %id, error = %err, "handshake aborted"),
            _ => warn!(cep = %id, error = %err, "connection failed"),
        }
        if !self.ceps.contains(id) {
            return Ok(());
        }
        self.close_now(id, CloseReason::from_error(&err))
    }

    // ── Helpers ──

    fn awaiting_rtr(&mut self, kmod_qp_id: u32) -> Option<CepId> {
        let id = *self.bound.get(&kmod_qp_id)?;
        match self.ceps.get(id).map(|c| c.state) {
            Some(CepState::AwaitingRtr) => Some(id),
            state => {
                debug!(kmod_qp_id, ?state, "ignoring RTR notice");
                None
            }
        }
    }

    /// Check the decision state and encode the reply frame
    fn reply_frame(&mut self, id: CepId, op: &'static str, flags: u8, private_data: &[u8]) -> Result<Vec<u8>> {
        let cep = lookup(&mut self.ceps, id)?;
        if cep.state != CepState::HandshakeRequestReceived {
            return Err(Error::InvalidState { op, state: cep.state.name() });
        }
        encode_frame(FrameKind::Reply, flags, private_data, self.config.pdata_max)
    }

    fn send(&mut self, id: CepId, frame: &[u8]) -> Result<()> {
        lookup(&mut self.ceps, id)?
            .socket
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{:?} sending without a socket", id)))?
            .send_frame(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::sync::mpsc::{channel, Receiver};

    use crate::mpa::{MpaHeader, MPA_HEADER_LEN};

    type TestCm = ConnectionManager<Vec<KernelEvent>>;

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    fn cm_with(config: CmConfig) -> TestCm {
        CmBuilder::new().config(config).build(Vec::new()).unwrap()
    }

    fn cm() -> TestCm {
        cm_with(CmConfig::new())
    }

    fn qp(qp_id: u16, kmod_qp_id: u32) -> BoundQp {
        BoundQp { dev_id: 0, qp_id, kmod_qp_id, ord_max: 4, ird_max: 4, dst_ether: [0; 6] }
    }

    /// Drive the loop until an event matches
    fn pump_until(cm: &mut TestCm, rx: &Receiver<CmEvent>, pred: impl Fn(&CmEvent) -> bool) -> CmEvent {
        for _ in 0..300 {
            cm.poll(Some(Duration::from_millis(10))).unwrap();
            while let Ok(ev) = rx.try_recv() {
                if pred(&ev) {
                    return ev;
                }
            }
        }
        panic!("expected event never arrived");
    }

    fn pump(cm: &mut TestCm, rounds: usize) {
        for _ in 0..rounds {
            cm.poll(Some(Duration::from_millis(5))).unwrap();
        }
    }

    fn listener(cm: &mut TestCm) -> (CepId, SocketAddrV4, Receiver<CmEvent>) {
        let (tx, rx) = channel();
        let id = cm.create_listener(loopback(), tx).unwrap();
        let addr = cm.cep(id).unwrap().local_addr().unwrap();
        (id, addr, rx)
    }

    /// Blocking read of one MPA reply from a raw client
    fn read_frame(stream: &mut TcpStream) -> (MpaHeader, Vec<u8>) {
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut raw = [0u8; MPA_HEADER_LEN];
        stream.read_exact(&mut raw).unwrap();
        let hdr = MpaHeader::decode(&raw, FrameKind::Reply, 512).unwrap();
        let mut body = vec![0u8; crate::mpa::padded_len(hdr.pd_len as usize)];
        stream.read_exact(&mut body).unwrap();
        body.truncate(hdr.pd_len as usize);
        (hdr, body)
    }

    fn connect_request(cm: &mut TestCm, rx: &Receiver<CmEvent>) -> CepId {
        match pump_until(cm, rx, |e| matches!(e, CmEvent::ConnectRequest { .. })) {
            CmEvent::ConnectRequest { cep, .. } => cep,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_listener_address_in_use() {
        let mut cm = cm();
        let (_, addr, _rx) = listener(&mut cm);
        let (tx, _rx2) = channel();
        assert!(matches!(cm.create_listener(addr, tx), Err(Error::AddressInUse(_))));
    }

    #[test]
    fn test_passive_handshake_to_rdma_mode() {
        let mut cm = cm();
        let (lid, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"hello", 512).unwrap())
            .unwrap();

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::ConnectRequest { .. }));
        let CmEvent::ConnectRequest { listener, cep, private_data } = ev else { unreachable!() };
        assert_eq!(listener, lid);
        assert_eq!(private_data, b"hello");
        assert_eq!(cm.state(cep), Some(CepState::HandshakeRequestReceived));

        cm.accept(cep, b"welcome", qp(3, 300)).unwrap();
        assert_eq!(cm.state(cep), Some(CepState::AwaitingRtr));

        let (hdr, body) = read_frame(&mut client);
        assert!(!hdr.is_reject());
        assert_eq!(body, b"welcome");

        let KernelEvent::Connected(rec) = cm.link()[0] else { panic!("expected QP_CONNECTED") };
        assert_eq!((rec.qp_id, rec.rxq, rec.txq, rec.kmod_qp_id), (3, 3, 3, 300));
        assert_eq!(rec.src.port(), addr.port());

        cm.notify_rtr_success(300).unwrap();
        assert!(matches!(
            pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Established { .. })),
            CmEvent::Established { cep: c } if c == cep
        ));
        assert_eq!(cm.state(cep), Some(CepState::RdmaMode));
    }

    #[test]
    fn test_accept_refused_outside_request_received() {
        let mut cm = cm();
        let (lid, addr, _rx) = listener(&mut cm);

        let err = cm.accept(lid, b"", qp(1, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidState { op: "accept", state: "Listening" }));
        assert_eq!(cm.state(lid), Some(CepState::Listening));

        // Child exists but the request has not arrived yet
        let _client = TcpStream::connect(addr).unwrap();
        pump(&mut cm, 20);
        let child = cm
            .ceps
            .ids()
            .into_iter()
            .find(|&id| id != lid)
            .expect("child accepted");
        assert_eq!(cm.state(child), Some(CepState::AwaitingPeerHandshakeRequest));
        assert!(matches!(cm.accept(child, b"", qp(1, 1)), Err(Error::InvalidState { .. })));
        assert!(matches!(cm.reject(child, b""), Err(Error::InvalidState { .. })));
        assert_eq!(cm.state(child), Some(CepState::AwaitingPeerHandshakeRequest));
        assert!(cm.link().is_empty());
    }

    #[test]
    fn test_initiate_timeout_closes_once() {
        let mut cm = cm_with(CmConfig::new().mpa_request_timeout(Duration::from_millis(50)));
        // Peer accepts at the TCP level but never answers
        let silent = TcpListener::bind(loopback()).unwrap();
        let remote = match silent.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let (tx, rx) = channel();
        let id = cm.initiate(remote, b"req", qp(1, 10), tx).unwrap();
        assert_eq!(cm.state(id), Some(CepState::Connecting));

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert_eq!(ev, CmEvent::Closed { cep: id, reason: CloseReason::Timeout });

        pump(&mut cm, 20);
        assert!(rx.try_iter().all(|e| !matches!(e, CmEvent::Closed { .. })));
        assert!(cm.next_deadline().is_none());
        assert!(cm.is_empty());
        assert!(cm.link().is_empty());
    }

    #[test]
    fn test_bad_key_closes_with_protocol_violation() {
        let mut cm = cm();
        let (lid, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        // A reply where a request is expected
        client
            .write_all(&encode_frame(FrameKind::Reply, 0, b"", 512).unwrap())
            .unwrap();

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert!(matches!(ev, CmEvent::Closed { reason: CloseReason::ProtocolViolation, .. }));
        assert_eq!(cm.state(lid), Some(CepState::Listening));
    }

    #[test]
    fn test_partial_frame_across_reads() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let frame = encode_frame(FrameKind::Request, 0, b"split-me", 512).unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(&frame[..7]).unwrap();
        pump(&mut cm, 20);
        assert!(rx.try_iter().all(|e| !matches!(e, CmEvent::ConnectRequest { .. })));

        client.write_all(&frame[7..]).unwrap();
        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::ConnectRequest { .. }));
        let CmEvent::ConnectRequest { private_data, .. } = ev else { unreachable!() };
        assert_eq!(private_data, b"split-me");
    }

    #[test]
    fn test_reject_sends_flagged_reply() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let cep = connect_request(&mut cm, &rx);

        cm.reject(cep, b"busy").unwrap();
        let (hdr, body) = read_frame(&mut client);
        assert!(hdr.is_reject());
        assert_eq!(body, b"busy");

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert_eq!(ev, CmEvent::Closed { cep, reason: CloseReason::Rejected });
        assert!(cm.state(cep).is_none());
    }

    #[test]
    fn test_active_and_passive_in_one_manager() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let (tx, arx) = channel();
        let active = cm.initiate(addr, b"from-active", qp(1, 101), tx).unwrap();

        let passive = connect_request(&mut cm, &rx);
        cm.accept(passive, b"from-passive", qp(2, 102)).unwrap();

        let ev = pump_until(&mut cm, &arx, |e| matches!(e, CmEvent::ConnectReply { .. }));
        assert_eq!(
            ev,
            CmEvent::ConnectReply { cep: active, accepted: true, private_data: b"from-passive".to_vec() }
        );
        assert_eq!(cm.state(active), Some(CepState::AwaitingRtr));
        assert_eq!(cm.link().len(), 2);

        let notifier = cm.rtr_notifier();
        notifier.success(101).unwrap();
        notifier.success(102).unwrap();
        pump_until(&mut cm, &arx, |e| matches!(e, CmEvent::Established { .. }));
        pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Established { .. }));
        assert_eq!(cm.state(active), Some(CepState::RdmaMode));
        assert_eq!(cm.state(passive), Some(CepState::RdmaMode));
    }

    #[test]
    fn test_active_sees_reject() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let (tx, arx) = channel();
        let active = cm.initiate(addr, b"", qp(1, 7), tx).unwrap();
        let passive = connect_request(&mut cm, &rx);
        cm.reject(passive, b"").unwrap();

        let ev = pump_until(&mut cm, &arx, |e| matches!(e, CmEvent::Closed { .. }));
        assert_eq!(ev, CmEvent::Closed { cep: active, reason: CloseReason::Rejected });
        assert!(cm.link().is_empty());
    }

    #[test]
    fn test_rtr_failure_disconnects_qp() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let cep = connect_request(&mut cm, &rx);
        cm.accept(cep, b"", qp(9, 900)).unwrap();

        cm.notify_rtr_failure(900).unwrap();
        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert_eq!(ev, CmEvent::Closed { cep, reason: CloseReason::RtrFailed });
        assert!(matches!(
            cm.link().last(),
            Some(KernelEvent::Disconnected(d)) if d.qp_id == 9
        ));

        // A late success for the same QP is ignored
        cm.notify_rtr_success(900).unwrap();
    }

    #[test]
    fn test_rtr_timeout_disconnects_qp() {
        let mut cm = cm_with(CmConfig::new().mpa_reply_timeout(Duration::from_millis(30)));
        let (_, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let cep = connect_request(&mut cm, &rx);
        cm.accept(cep, b"", qp(4, 40)).unwrap();

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert_eq!(ev, CmEvent::Closed { cep, reason: CloseReason::Timeout });
        assert_eq!(cm.link().len(), 2);
    }

    #[test]
    fn test_rtr_from_kernel_record() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let cep = connect_request(&mut cm, &rx);
        cm.accept(cep, b"", qp(5, 55)).unwrap();

        let rec = KernelEvent::Rtr(urdma_core::kabi::QpRtr { kmod_qp_id: 55 }).encode();
        cm.handle_kernel_record(&rec).unwrap();
        assert_eq!(cm.state(cep), Some(CepState::RdmaMode));

        assert!(cm.handle_kernel_record(&rec[..3]).is_err());
    }

    #[test]
    fn test_rtr_notifier_from_other_thread() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let cep = connect_request(&mut cm, &rx);
        cm.accept(cep, b"", qp(6, 66)).unwrap();

        let notifier = cm.rtr_notifier();
        std::thread::spawn(move || notifier.success(66).unwrap())
            .join()
            .unwrap();

        pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Established { .. }));
        assert_eq!(cm.state(cep), Some(CepState::RdmaMode));
    }

    #[test]
    fn test_peer_hangup_closes_child() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let client = TcpStream::connect(addr).unwrap();
        pump(&mut cm, 10);
        drop(client);

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert!(matches!(ev, CmEvent::Closed { reason: CloseReason::PeerClosed, .. }));
    }

    #[test]
    fn test_child_keeps_listener_alive() {
        let mut cm = cm();
        let (lid, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let child = connect_request(&mut cm, &rx);
        assert_eq!(cm.cep(lid).unwrap().refs(), 2);

        cm.destroy_listener(lid).unwrap();
        pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { cep, .. } if *cep == lid));
        assert_eq!(cm.state(lid), Some(CepState::Closed));
        assert!(matches!(cm.destroy_listener(lid), Err(Error::InvalidState { .. })));

        cm.close(child).unwrap();
        pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { cep, .. } if *cep == child));
        assert!(cm.state(lid).is_none());
        assert!(cm.is_empty());
    }

    #[test]
    fn test_close_survives_pending_reply() {
        let mut cm = cm();
        let peer = TcpListener::bind(loopback()).unwrap();
        let remote = match peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let (tx, rx) = channel();
        let id = cm.initiate(remote, b"req", qp(2, 20), tx).unwrap();
        for _ in 0..300 {
            if cm.state(id) == Some(CepState::AwaitingHandshakeReply) {
                break;
            }
            cm.poll(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(cm.state(id), Some(CepState::AwaitingHandshakeReply));

        // Reply is already readable when the close is requested
        let (mut stream, _) = peer.accept().unwrap();
        stream
            .write_all(&encode_frame(FrameKind::Reply, 0, b"ok", 512).unwrap())
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        cm.close(id).unwrap();
        pump(&mut cm, 10);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![CmEvent::Closed { cep: id, reason: CloseReason::Local }]);
        assert!(cm.is_empty());
        assert!(cm.link().is_empty());
    }

    #[test]
    fn test_close_survives_pending_request() {
        let mut cm = cm();
        let (lid, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        let mut child = None;
        for _ in 0..300 {
            child = cm.ceps.ids().into_iter().find(|&c| c != lid);
            if child.is_some() {
                break;
            }
            cm.poll(Some(Duration::from_millis(10))).unwrap();
        }
        let child = child.unwrap();
        assert_eq!(cm.state(child), Some(CepState::AwaitingPeerHandshakeRequest));

        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"late", 512).unwrap())
            .unwrap();
        // Peer data and the peer's FIN are both pending
        drop(client);
        std::thread::sleep(Duration::from_millis(50));
        cm.close(child).unwrap();
        pump(&mut cm, 10);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events, vec![CmEvent::Closed { cep: child, reason: CloseReason::Local }]);
        assert!(cm.state(child).is_none());
        assert_eq!(cm.state(lid), Some(CepState::Listening));
        assert!(cm.link().is_empty());
    }

    #[test]
    fn test_close_survives_late_rtr() {
        let mut cm = cm();
        let (_, addr, rx) = listener(&mut cm);

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let cep = connect_request(&mut cm, &rx);
        cm.accept(cep, b"", qp(5, 500)).unwrap();

        cm.close(cep).unwrap();
        cm.notify_rtr_success(500).unwrap();
        assert_eq!(cm.state(cep), Some(CepState::AwaitingRtr));

        let ev = pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert_eq!(ev, CmEvent::Closed { cep, reason: CloseReason::Local });
        assert!(rx.try_iter().all(|e| !matches!(e, CmEvent::Established { .. })));
        assert!(matches!(
            cm.link().last(),
            Some(KernelEvent::Disconnected(d)) if d.qp_id == 5
        ));
    }

    #[test]
    fn test_child_setup_failure_keeps_listener() {
        let mut cm = cm();
        let (lid, addr, rx) = listener(&mut cm);
        let peer = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000);

        let err = Error::Io(std::io::Error::other("getsockname failed"));
        cm.child_setup_failed(lid, peer, err).unwrap();
        assert_eq!(cm.state(lid), Some(CepState::Listening));

        let fatal = Error::invariant("child table corrupt");
        assert!(cm.child_setup_failed(lid, peer, fatal).unwrap_err().is_fatal());

        // Later connections are still accepted
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .write_all(&encode_frame(FrameKind::Request, 0, b"", 512).unwrap())
            .unwrap();
        let child = connect_request(&mut cm, &rx);
        assert_eq!(cm.state(child), Some(CepState::HandshakeRequestReceived));
    }

    #[test]
    fn test_close_twice_refused() {
        let mut cm = cm();
        let (lid, _, rx) = listener(&mut cm);
        cm.close(lid).unwrap();
        pump_until(&mut cm, &rx, |e| matches!(e, CmEvent::Closed { .. }));
        assert!(cm.close(lid).is_err());
    }

    #[test]
    fn test_oversized_private_data_refused() {
        let mut cm = cm();
        let (tx, _rx) = channel();
        let pdata = vec![0u8; 513];
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        assert!(matches!(
            cm.initiate(remote, &pdata, qp(1, 1), tx),
            Err(Error::InvalidArgument(_))
        ));
        assert!(cm.is_empty());
    }
}
