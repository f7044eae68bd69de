//! Client process registry and the control-channel protocol
//!
//! ```text
//! Connected ──HELLO──▶ Active ──EOF / error──▶ Closed
//! ```
//!
//! Each client talks to the daemon over its own SOCK_SEQPACKET
//! connection, one request per datagram. Any error on a connection ends
//! it, and [`Session::cleanup`] hands back exactly the cores and QPs the
//! session was granted.

use core::fmt;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recv, send, MsgFlags};
use tracing::{debug, info};
use urdma_core::core_mask::{CoreMask, CorePool};
use urdma_core::error::{Error, Result};
use urdma_core::ids::{DevId, QpId};
use urdma_core::sock::{qp_handle, Request, Response, MAX_MSG_LEN};

use crate::qp_pool::{QpConnState, QpPool};

/// Daemon-assigned client identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        ProcessId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no HELLO yet
    Connected,
    /// Holds a core grant
    Active,
    Closed,
}

/// What a session gave back on cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub qps: Vec<(DevId, QpId)>,
    pub cores: CoreMask,
}

/// Protocol state of one client, independent of its socket
#[derive(Debug)]
pub struct Session {
    id: ProcessId,
    state: SessionState,
    qps: Vec<(DevId, QpId)>,
    cores: CoreMask,
}

impl Session {
    pub fn new(id: ProcessId) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            qps: Vec::new(),
            cores: CoreMask::EMPTY,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn qps(&self) -> &[(DevId, QpId)] {
        &self.qps
    }

    pub fn cores(&self) -> CoreMask {
        self.cores
    }

    /// Handle one request datagram; returns the reply to send, if any
    ///
    /// Every error ends the session.
    pub fn on_message(
        &mut self,
        msg: &[u8],
        cores: &mut CorePool,
        qps: &mut QpPool,
    ) -> Result<Option<Vec<u8>>> {
        if self.state == SessionState::Closed {
            return Err(Error::InvalidState { op: "message", state: "Closed" });
        }

        match Request::decode(msg)? {
            Request::Hello { core_count } => {
                if self.state == SessionState::Active {
                    return Err(Error::protocol("HELLO on an active session"));
                }
                let mask = cores.reserve(core_count)?;
                self.cores = mask;
                self.state = SessionState::Active;
                info!(process = %self.id, cores = ?mask, "hello");
                Ok(Some(Response::Hello { mask }.encode()))
            }
            Request::CreateQp { dev_id } => {
                if dev_id as usize >= qps.port_count() {
                    return Err(Error::protocol(format!("CREATE_QP for unknown device {}", dev_id)));
                }
                let slot = qps.allocate(DevId::new(dev_id), self.id)?;
                let qp_id = slot.qp_id();
                self.qps.push((slot.dev_id(), qp_id));
                debug!(process = %self.id, dev_id, qp_id = %qp_id, "QP created");
                Ok(Some(
                    Response::CreateQp {
                        dev_id,
                        qp_id: qp_id.as_u16(),
                        handle: qp_handle(dev_id, qp_id.as_u16()),
                    }
                    .encode(),
                ))
            }
            Request::DestroyQp { dev_id, qp_id } => {
                let (dev, qp) = (DevId::new(dev_id), QpId::new(qp_id));
                if !qps.is_valid(dev, qp) {
                    return Err(Error::protocol(format!("DESTROY_QP for bad QP {}/{}", dev_id, qp_id)));
                }
                qps.release(dev, qp, self.id)?;
                self.qps.retain(|&owned| owned != (dev, qp));
                debug!(process = %self.id, dev_id, qp_id, "QP destroyed");
                Ok(None)
            }
        }
    }

    /// Give back every QP and core this session holds
    ///
    /// Connected QPs are marked disconnected before release. A release
    /// the pool refuses means the books disagree, which is fatal.
    pub fn cleanup(&mut self, cores: &mut CorePool, qps: &mut QpPool) -> Result<Released> {
        let owned = std::mem::take(&mut self.qps);
        let mut first_err = None;
        for &(dev, qp) in &owned {
            if let Some(slot) = qps.slot(dev, qp) {
                if slot.state() == QpConnState::Connected {
                    slot.mark_disconnected();
                }
            }
            if let Err(e) = qps.release(dev, qp, self.id) {
                first_err.get_or_insert(Error::invariant(format!(
                    "{} cleanup of QP {}/{}: {}",
                    self.id, dev, qp, e
                )));
            }
        }

        let granted = std::mem::replace(&mut self.cores, CoreMask::EMPTY);
        if !granted.is_empty() {
            cores.return_cores(&granted)?;
        }
        self.state = SessionState::Closed;

        match first_err {
            Some(e) => Err(e),
            None => Ok(Released { qps: owned, cores: granted }),
        }
    }
}

/// A registered client: its session and control connection
pub struct Process {
    session: Session,
    fd: OwnedFd,
}

impl Process {
    pub fn new(id: ProcessId, fd: OwnedFd) -> Self {
        Self { session: Session::new(id), fd }
    }

    pub fn id(&self) -> ProcessId {
        self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Receive one datagram and answer it
    ///
    /// `Err(PeerClosed)` on EOF; any error means the caller must clean up.
    pub fn service(&mut self, cores: &mut CorePool, qps: &mut QpPool) -> Result<()> {
        // Room for one byte past the largest request so oversize shows up
        let mut buf = [0u8; MAX_MSG_LEN + 1];
        let n = match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => n,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if let Some(reply) = self.session.on_message(&buf[..n], cores, qps)? {
            let sent = send(self.fd.as_raw_fd(), &reply, MsgFlags::MSG_NOSIGNAL)?;
            if sent != reply.len() {
                return Err(Error::ShortMessage { expected: reply.len(), got: sent });
            }
        }
        Ok(())
    }
}

impl AsRawFd for Process {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Every connected client, by id
#[derive(Default)]
pub struct ProcessRegistry {
    procs: HashMap<ProcessId, Process>,
    next_id: u32,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    pub fn register(&mut self, fd: OwnedFd) -> ProcessId {
        let id = ProcessId::new(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.procs.insert(id, Process::new(id, fd));
        id
    }

    pub fn get_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.procs.get_mut(&id)
    }

    pub fn remove(&mut self, id: ProcessId) -> Option<Process> {
        self.procs.remove(&id)
    }

    pub fn ids(&self) -> Vec<ProcessId> {
        self.procs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}
