//! Deferred work dispatcher
//!
//! Each CEP owns a small [`WorkSlots`] pool and may have at most one item
//! scheduled at a time. The dispatcher keeps every armed item in a
//! min-heap keyed by deadline.
//!
//! # Cancellation Strategy
//!
//! Cancelled handles are recorded in a set and skipped when they reach
//! the top of the heap, so cancel never searches the heap. The set is
//! cleared whenever the heap drains.
//!
//! # Firing
//!
//! [`WorkDispatcher::pop_expired`] only names the due item. The caller
//! detaches it from its CEP with [`WorkSlots::complete`], which clears
//! `in_use` and returns the slot, and only then runs the handler. The
//! handler may therefore schedule the next item for the same CEP.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use urdma_core::error::{Error, Result};

use crate::cep::CepId;

/// Per-CEP pre-allocated work items
pub const WORK_SLOTS: usize = 4;

/// What to do when an item fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    /// Listener has pending connections
    BeginAccept,
    /// Handshake socket is readable
    ReadHandshakeHeader,
    /// Local close requested
    CloseTransport,
    /// Peer hung up
    PeerClosed,
    /// Handshake or RTR deadline passed
    Timeout,
}

/// Identifies one scheduling of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkHandle(u64);

#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub kind: WorkType,
    pub deadline: Instant,
    pub handle: WorkHandle,
    pub cep: CepId,
}

/// A CEP's work-item free list and `in_use` guard
pub struct WorkSlots {
    items: [Option<WorkItem>; WORK_SLOTS],
    free: Vec<u8>,
    pending: Option<u8>,
}

impl WorkSlots {
    pub fn new() -> Self {
        Self {
            items: [None; WORK_SLOTS],
            free: (0..WORK_SLOTS as u8).rev().collect(),
            pending: None,
        }
    }

    /// True while an item is scheduled
    #[inline]
    pub fn in_use(&self) -> bool {
        self.pending.is_some()
    }

    /// The scheduled item, if any
    pub fn pending(&self) -> Option<&WorkItem> {
        self.pending.and_then(|i| self.items[i as usize].as_ref())
    }

    /// Number of slots on the free list
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    fn arm(&mut self, item: WorkItem) -> Result<()> {
        if self.in_use() {
            return Err(Error::AlreadyScheduled);
        }
        let idx = self
            .free
            .pop()
            .ok_or_else(|| Error::invariant("work slot free list empty with nothing pending"))?;
        self.items[idx as usize] = Some(item);
        self.pending = Some(idx);
        Ok(())
    }

    fn disarm(&mut self) -> Option<WorkItem> {
        let idx = self.pending.take()?;
        self.free.push(idx);
        self.items[idx as usize].take()
    }

    /// Detach a fired item
    ///
    /// Returns `None` if `handle` is not the pending item (it was
    /// cancelled and possibly replaced).
    pub fn complete(&mut self, handle: WorkHandle) -> Option<WorkItem> {
        match self.pending() {
            Some(item) if item.handle == handle => self.disarm(),
            _ => None,
        }
    }
}

impl Default for WorkSlots {
    fn default() -> Self {
        Self::new()
    }
}

/// Heap entry, min-heap by deadline
struct HeapEntry {
    deadline: Instant,
    handle: WorkHandle,
    cep: CepId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for earliest-first; ties fire in scheduling order
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkStats {
    pub scheduled: u64,
    pub fired: u64,
    pub cancelled: u64,
}

pub struct WorkDispatcher {
    heap: BinaryHeap<HeapEntry>,
    cancelled: HashSet<WorkHandle>,
    next_handle: u64,
    stats: WorkStats,
}

impl WorkDispatcher {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
            cancelled: HashSet::new(),
            next_handle: 1,
            stats: WorkStats::default(),
        }
    }

    /// Arm `kind` for `cep` after `delay`
    ///
    /// Fails with `AlreadyScheduled` if the CEP has an item pending.
    pub fn schedule(
        &mut self,
        cep: CepId,
        slots: &mut WorkSlots,
        kind: WorkType,
        delay: Duration,
    ) -> Result<WorkHandle> {
        let handle = WorkHandle(self.next_handle);
        let deadline = Instant::now() + delay;
        slots.arm(WorkItem { kind, deadline, handle, cep })?;

        self.next_handle += 1;
        self.heap.push(HeapEntry { deadline, handle, cep });
        self.stats.scheduled += 1;
        Ok(handle)
    }

    /// Disarm the CEP's pending item, if any
    pub fn cancel(&mut self, slots: &mut WorkSlots) -> Option<WorkItem> {
        let item = slots.disarm()?;
        self.cancelled.insert(item.handle);
        self.stats.cancelled += 1;
        Some(item)
    }

    /// Next item due at or before `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<(CepId, WorkHandle)> {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop()?;
            if self.cancelled.remove(&entry.handle) {
                continue;
            }
            self.stats.fired += 1;
            return Some((entry.cep, entry.handle));
        }
        self.cancelled.clear();
        None
    }

    /// Earliest deadline among armed items
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if !self.cancelled.contains(&top.handle) {
                return Some(top.deadline);
            }
            let handle = top.handle;
            self.heap.pop();
            self.cancelled.remove(&handle);
        }
        None
    }

    /// Armed items, including cancelled ones not yet discarded
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn stats(&self) -> WorkStats {
        self.stats
    }
}

impl Default for WorkDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cep(n: u32) -> CepId {
        CepId::from_parts(n, 0)
    }

    #[test]
    fn test_single_outstanding_item() {
        let mut d = WorkDispatcher::new();
        let mut slots = WorkSlots::new();

        d.schedule(cep(1), &mut slots, WorkType::Timeout, Duration::from_secs(10))
            .unwrap();
        assert!(slots.in_use());
        assert_eq!(slots.free_slots(), WORK_SLOTS - 1);

        let err = d
            .schedule(cep(1), &mut slots, WorkType::ReadHandshakeHeader, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyScheduled));
        assert_eq!(slots.pending().unwrap().kind, WorkType::Timeout);
    }

    #[test]
    fn test_cancel_returns_slot() {
        let mut d = WorkDispatcher::new();
        let mut slots = WorkSlots::new();

        d.schedule(cep(1), &mut slots, WorkType::Timeout, Duration::ZERO).unwrap();
        let item = d.cancel(&mut slots).unwrap();
        assert_eq!(item.kind, WorkType::Timeout);
        assert!(!slots.in_use());
        assert_eq!(slots.free_slots(), WORK_SLOTS);

        // Cancelled entry never fires
        assert!(d.pop_expired(Instant::now() + Duration::from_secs(1)).is_none());
        assert!(d.cancel(&mut slots).is_none());
        assert_eq!(d.stats().cancelled, 1);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut d = WorkDispatcher::new();
        let mut a = WorkSlots::new();
        let mut b = WorkSlots::new();

        d.schedule(cep(1), &mut a, WorkType::Timeout, Duration::from_secs(5)).unwrap();
        d.schedule(cep(2), &mut b, WorkType::BeginAccept, Duration::ZERO).unwrap();

        let now = Instant::now();
        let (first, h) = d.pop_expired(now).unwrap();
        assert_eq!(first, cep(2));
        assert_eq!(b.complete(h).unwrap().kind, WorkType::BeginAccept);
        assert!(d.pop_expired(now).is_none());

        let later = now + Duration::from_secs(6);
        let (second, h) = d.pop_expired(later).unwrap();
        assert_eq!(second, cep(1));
        assert!(a.complete(h).is_some());
    }

    #[test]
    fn test_reschedule_after_complete() {
        let mut d = WorkDispatcher::new();
        let mut slots = WorkSlots::new();

        d.schedule(cep(1), &mut slots, WorkType::ReadHandshakeHeader, Duration::ZERO)
            .unwrap();
        let (_, h) = d.pop_expired(Instant::now()).unwrap();
        slots.complete(h).unwrap();

        // The handler may arm the next item for the same CEP
        d.schedule(cep(1), &mut slots, WorkType::Timeout, Duration::from_secs(1))
            .unwrap();
        assert_eq!(slots.pending().unwrap().kind, WorkType::Timeout);
    }

    #[test]
    fn test_stale_handle_not_completed() {
        let mut d = WorkDispatcher::new();
        let mut slots = WorkSlots::new();

        let old = d.schedule(cep(1), &mut slots, WorkType::Timeout, Duration::ZERO).unwrap();
        d.cancel(&mut slots);
        d.schedule(cep(1), &mut slots, WorkType::PeerClosed, Duration::ZERO).unwrap();

        assert!(slots.complete(old).is_none());
        assert!(slots.in_use());
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let mut d = WorkDispatcher::new();
        let mut a = WorkSlots::new();
        let mut b = WorkSlots::new();

        d.schedule(cep(1), &mut a, WorkType::Timeout, Duration::from_millis(10)).unwrap();
        d.schedule(cep(2), &mut b, WorkType::Timeout, Duration::from_secs(60)).unwrap();
        d.cancel(&mut a);

        let next = d.next_deadline().unwrap();
        assert!(next > Instant::now() + Duration::from_secs(30));
        assert_eq!(d.len(), 1);
    }
}
