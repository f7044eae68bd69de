//! Connection endpoints and their arena
//!
//! CEPs live in a [`CepTable`] and are addressed by generational
//! [`CepId`] handles, so a handle to a destroyed CEP can never reach a
//! newer occupant of the same slot. Lifetime is an explicit reference
//! count: the table removes a CEP exactly when its count reaches zero.

use core::fmt;
use std::net::SocketAddrV4;
use std::sync::mpsc::Sender;
use std::time::Instant;

use urdma_core::error::{Error, Result};

use crate::link::{BoundQp, CmEvent};
use crate::mpa::{FrameKind, MpaReceiver};
use crate::state::CepState;
use crate::transport::LlpSocket;
use crate::work::WorkSlots;

/// Stable handle to a CEP
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CepId {
    index: u32,
    generation: u32,
}

impl CepId {
    #[inline]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        CepId { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Pack into a poller token
    #[inline]
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_token(token: u64) -> Self {
        CepId { index: token as u32, generation: (token >> 32) as u32 }
    }
}

impl fmt::Debug for CepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CepId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for CepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cep{}", self.index)
    }
}

/// One iWARP connection endpoint
pub struct Cep {
    pub(crate) id: CepId,
    pub(crate) state: CepState,
    /// Listener this CEP was accepted from; holds a reference on it
    pub(crate) listener: Option<CepId>,
    pub(crate) qp: Option<BoundQp>,
    /// `QP_CONNECTED` was emitted for `qp`
    pub(crate) qp_established: bool,
    pub(crate) socket: Option<LlpSocket>,
    pub(crate) local_addr: Option<SocketAddrV4>,
    pub(crate) remote_addr: Option<SocketAddrV4>,
    pub(crate) mpa: MpaReceiver,
    /// Outbound private data
    pub(crate) pdata: Vec<u8>,
    pub(crate) work: WorkSlots,
    pub(crate) events: Option<Sender<CmEvent>>,
    /// When the current handshake phase gives up
    pub(crate) deadline: Option<Instant>,
    refs: u32,
}

impl Cep {
    pub(crate) fn new(id: CepId, pdata_max: usize) -> Self {
        Self {
            id,
            state: CepState::Idle,
            listener: None,
            qp: None,
            qp_established: false,
            socket: None,
            local_addr: None,
            remote_addr: None,
            mpa: MpaReceiver::new(FrameKind::Request, pdata_max),
            pdata: Vec::new(),
            work: WorkSlots::new(),
            events: None,
            deadline: None,
            refs: 1,
        }
    }

    pub fn id(&self) -> CepId {
        self.id
    }

    pub fn state(&self) -> CepState {
        self.state
    }

    pub fn listener(&self) -> Option<CepId> {
        self.listener
    }

    pub fn qp(&self) -> Option<&BoundQp> {
        self.qp.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote_addr
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn work(&self) -> &WorkSlots {
        &self.work
    }

    /// Deliver an upcall to the waiting caller; a dropped receiver is fine
    pub(crate) fn notify(&self, event: CmEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

struct Entry {
    generation: u32,
    cep: Option<Cep>,
}

/// Arena of CEPs with a free-index stack
pub struct CepTable {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
    pdata_max: usize,
}

impl CepTable {
    pub fn new(pdata_max: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
            pdata_max,
        }
    }

    /// Create a CEP holding one reference
    pub fn insert(&mut self) -> CepId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.entries.push(Entry { generation: 0, cep: None });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        let id = CepId { index, generation: entry.generation };
        entry.cep = Some(Cep::new(id, self.pdata_max));
        self.live += 1;
        id
    }

    pub fn get(&self, id: CepId) -> Option<&Cep> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.cep.as_ref())
    }

    pub fn get_mut(&mut self, id: CepId) -> Option<&mut Cep> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.cep.as_mut())
    }

    pub fn contains(&self, id: CepId) -> bool {
        self.get(id).is_some()
    }

    /// Take another reference
    pub fn acquire(&mut self, id: CepId) -> Result<()> {
        let cep = self
            .get_mut(id)
            .ok_or_else(|| Error::invariant(format!("acquire on destroyed {:?}", id)))?;
        cep.refs += 1;
        Ok(())
    }

    /// Drop a reference; the CEP is removed and returned at zero
    pub fn release(&mut self, id: CepId) -> Result<Option<Cep>> {
        let entry = self
            .entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation && e.cep.is_some())
            .ok_or_else(|| Error::invariant(format!("release on destroyed {:?}", id)))?;

        let refs = match entry.cep.as_mut() {
            Some(cep) => {
                cep.refs -= 1;
                cep.refs
            }
            None => return Ok(None),
        };
        if refs > 0 {
            return Ok(None);
        }

        let cep = entry.cep.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(cep)
    }

    /// Number of live CEPs
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn ids(&self) -> Vec<CepId> {
        self.entries
            .iter()
            .filter_map(|e| e.cep.as_ref().map(|c| c.id))
            .collect()
    }
}
