//! Global transaction ordering
//!
//! Every transaction a server applies gets a [`GlobalTransactionId`], its
//! position in the cluster-wide apply order. The ids are issued from one
//! per-stripe sequence under the apply serialization point, so id order is
//! apply order.
//!
//! The manager keeps one record per ordered transaction, keyed by
//! [`ServerTransactionId`]. A record answers "was this already applied?"
//! for resent batches; it is retired once the source client's
//! low-water-mark moves past it.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{
    GlobalTransactionId, NodeId, ProtocolViolation, Result, Sequence, ServerTransactionId,
    TransactionId,
};
use tracing::debug;

/// Per-stripe source of global transaction ids
#[derive(Debug)]
pub struct GlobalTransactionIdSequence {
    stripe: u32,
    sequence: Sequence,
}

impl GlobalTransactionIdSequence {
    /// A sequence whose first id is 1
    pub fn new(stripe: u32) -> Self {
        Self {
            stripe,
            sequence: Sequence::new(),
        }
    }

    /// A sequence continuing after `last`
    pub fn starting_after(stripe: u32, last: GlobalTransactionId) -> Self {
        Self {
            stripe,
            sequence: Sequence::starting_after(last.as_u64()),
        }
    }

    /// Stripe this sequence orders
    pub fn stripe(&self) -> u32 {
        self.stripe
    }

    /// Issue the next id
    pub fn next_id(&self) -> GlobalTransactionId {
        GlobalTransactionId::new(self.sequence.next_value())
    }

    /// Last issued id, `NULL` before the first
    pub fn current(&self) -> GlobalTransactionId {
        GlobalTransactionId::new(self.sequence.current())
    }
}

#[derive(Debug, Clone, Copy)]
struct GlobalRecord {
    global_id: GlobalTransactionId,
    complete: bool,
}

#[derive(Debug, Default)]
struct GlobalState {
    /// Per source node, by source-local transaction id
    records: FxHashMap<NodeId, BTreeMap<TransactionId, GlobalRecord>>,
    incomplete: BTreeSet<GlobalTransactionId>,
}

/// Issues and remembers global transaction ids
#[derive(Debug)]
pub struct GlobalTransactionManager {
    sequence: GlobalTransactionIdSequence,
    state: Mutex<GlobalState>,
}

impl GlobalTransactionManager {
    /// Manager for `stripe`, issuing from 1
    pub fn new(stripe: u32) -> Self {
        Self::with_sequence(GlobalTransactionIdSequence::new(stripe))
    }

    /// Manager issuing from an existing sequence
    pub fn with_sequence(sequence: GlobalTransactionIdSequence) -> Self {
        Self {
            sequence,
            state: Mutex::new(GlobalState::default()),
        }
    }

    /// Order `stxid`
    ///
    /// # Errors
    ///
    /// `DuplicateGlobalTransactionId` if it already has an id.
    pub fn assign(&self, stxid: &ServerTransactionId) -> Result<GlobalTransactionId> {
        let mut state = self.state.lock();
        let per_source = state.records.entry(stxid.source.clone()).or_default();
        if let Some(existing) = per_source.get(&stxid.transaction) {
            return Err(ProtocolViolation::DuplicateGlobalTransactionId {
                transaction: stxid.clone(),
                existing: existing.global_id,
            }
            .raise());
        }
        let global_id = self.sequence.next_id();
        per_source.insert(
            stxid.transaction,
            GlobalRecord {
                global_id,
                complete: false,
            },
        );
        state.incomplete.insert(global_id);
        debug!(target: "tessera::apply", %stxid, %global_id, "Assigned global id");
        Ok(global_id)
    }

    /// Withdraw the id of `stxid` if it never finished applying
    ///
    /// Returns the withdrawn id. The id is not reissued; a later
    /// [`assign`](Self::assign) orders the transaction afresh.
    pub fn revoke(&self, stxid: &ServerTransactionId) -> Option<GlobalTransactionId> {
        let mut state = self.state.lock();
        let per_source = state.records.get_mut(&stxid.source)?;
        if per_source.get(&stxid.transaction)?.complete {
            return None;
        }
        let record = per_source.remove(&stxid.transaction)?;
        if per_source.is_empty() {
            state.records.remove(&stxid.source);
        }
        state.incomplete.remove(&record.global_id);
        debug!(target: "tessera::apply", %stxid, global_id = %record.global_id, "Revoked global id");
        Some(record.global_id)
    }

    /// Global id of `stxid`, if it was ordered and not yet retired
    pub fn lookup(&self, stxid: &ServerTransactionId) -> Option<GlobalTransactionId> {
        self.state
            .lock()
            .records
            .get(&stxid.source)
            .and_then(|r| r.get(&stxid.transaction))
            .map(|r| r.global_id)
    }

    /// Whether `stxid` finished applying
    pub fn is_complete(&self, stxid: &ServerTransactionId) -> bool {
        self.state
            .lock()
            .records
            .get(&stxid.source)
            .and_then(|r| r.get(&stxid.transaction))
            .is_some_and(|r| r.complete)
    }

    /// Mark `stxid` applied; returns `false` if it was unknown or already
    /// complete
    pub fn mark_complete(&self, stxid: &ServerTransactionId) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state
            .records
            .get_mut(&stxid.source)
            .and_then(|r| r.get_mut(&stxid.transaction))
        else {
            return false;
        };
        if record.complete {
            return false;
        }
        record.complete = true;
        let global_id = record.global_id;
        state.incomplete.remove(&global_id);
        true
    }

    /// Retire completed records of `source` below its low-water-mark
    ///
    /// Returns the number of records removed.
    pub fn clear_below(&self, source: &NodeId, low_water_mark: TransactionId) -> usize {
        let mut state = self.state.lock();
        let Some(per_source) = state.records.get_mut(source) else {
            return 0;
        };
        let kept = per_source.split_off(&low_water_mark);
        let below = std::mem::replace(per_source, kept);
        let mut removed = 0;
        for (id, record) in below {
            if record.complete {
                removed += 1;
            } else {
                per_source.insert(id, record);
            }
        }
        if per_source.is_empty() {
            state.records.remove(source);
        }
        if removed > 0 {
            debug!(target: "tessera::apply", %source, %low_water_mark, removed, "Retired ordering records");
        }
        removed
    }

    /// Smallest id of an incomplete transaction, else the next id to issue
    pub fn global_low_water_mark(&self) -> GlobalTransactionId {
        let state = self.state.lock();
        match state.incomplete.first() {
            Some(id) => *id,
            None => self.sequence.current().next(),
        }
    }

    /// Last issued id
    pub fn last_issued(&self) -> GlobalTransactionId {
        self.sequence.current()
    }

    /// Number of records not yet retired
    pub fn record_count(&self) -> usize {
        self.state.lock().records.values().map(BTreeMap::len).sum()
    }
}
