//! Transaction batch accounting
//!
//! Tracks which batches are outstanding and which of their transactions are
//! still unacknowledged, and derives the low-water-mark from that.
//!
//! ## Structure
//!
//! - `batches`: insertion-ordered FIFO of outstanding batches
//! - `batch_seq`: batch id → FIFO position
//! - `txn_to_batch`: reverse index from transaction id to its batch
//! - `pending`: every unacknowledged transaction id, ordered
//!
//! Acknowledgement and low-water-mark queries are O(log n). The structure is
//! plain `&mut self` data; owners guard it with one mutex.

use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use tessera_core::{ProtocolViolation, Result, TransactionId, TxnBatchId};

/// Outstanding state of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    /// Batch id
    pub batch_id: TxnBatchId,
    /// Transactions of the batch in send order
    pub transactions: Vec<TransactionId>,
    /// Of those, the ones not yet acknowledged
    pub pending: BTreeSet<TransactionId>,
}

impl BatchRecord {
    /// Whether every transaction has been acknowledged
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outstanding batches and transactions of one client session
#[derive(Debug, Default)]
pub struct TransactionBatchAccounting {
    batches: BTreeMap<u64, BatchRecord>,
    batch_seq: FxHashMap<TxnBatchId, u64>,
    txn_to_batch: FxHashMap<TransactionId, TxnBatchId>,
    pending: BTreeSet<TransactionId>,
    next_seq: u64,
    highest_issued: TransactionId,
}

impl TransactionBatchAccounting {
    /// Empty accounting
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding batch
    ///
    /// # Errors
    ///
    /// `DuplicateBatch` if the batch id is already outstanding,
    /// `DuplicateTransaction` if one of the ids is.
    pub fn add_batch(&mut self, batch_id: TxnBatchId, ids: &[TransactionId]) -> Result<()> {
        if self.batch_seq.contains_key(&batch_id) {
            return Err(ProtocolViolation::DuplicateBatch(batch_id).raise());
        }
        let mut seen = BTreeSet::new();
        for id in ids {
            if self.txn_to_batch.contains_key(id) || !seen.insert(*id) {
                return Err(ProtocolViolation::DuplicateTransaction(*id).raise());
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        for id in ids {
            self.txn_to_batch.insert(*id, batch_id);
            self.pending.insert(*id);
            self.highest_issued = self.highest_issued.max(*id);
        }
        self.batch_seq.insert(batch_id, seq);
        self.batches.insert(
            seq,
            BatchRecord {
                batch_id,
                transactions: ids.to_vec(),
                pending: seen,
            },
        );
        Ok(())
    }

    /// Acknowledge transactions of a batch
    ///
    /// Returns `true` iff this call completed the batch. Ids that are not
    /// pending in the batch (repeated acknowledgements) are ignored.
    ///
    /// # Errors
    ///
    /// `UnknownBatch` if the batch is not outstanding.
    pub fn acknowledge(&mut self, batch_id: TxnBatchId, ids: &[TransactionId]) -> Result<bool> {
        let Some(&seq) = self.batch_seq.get(&batch_id) else {
            return Err(ProtocolViolation::UnknownBatch(batch_id).raise());
        };
        let Some(record) = self.batches.get_mut(&seq) else {
            return Err(ProtocolViolation::UnknownBatch(batch_id).raise());
        };
        for id in ids {
            if record.pending.remove(id) {
                self.pending.remove(id);
                self.txn_to_batch.remove(id);
            }
        }
        if !record.is_complete() {
            return Ok(false);
        }
        self.batches.remove(&seq);
        self.batch_seq.remove(&batch_id);
        Ok(true)
    }

    /// Smallest unacknowledged id; else the id after the highest ever issued;
    /// `NULL` if nothing was ever issued
    pub fn low_water_mark(&self) -> TransactionId {
        match self.pending.first() {
            Some(id) => *id,
            None if self.highest_issued.is_null() => TransactionId::NULL,
            None => self.highest_issued.next(),
        }
    }

    /// Append outstanding batch ids in the order they were added
    pub fn add_incomplete_batch_ids_to<'a>(&self, out: &'a mut Vec<TxnBatchId>) -> &'a mut Vec<TxnBatchId> {
        out.extend(self.batches.values().map(|b| b.batch_id));
        out
    }

    /// Oldest outstanding batch, or `TxnBatchId::NULL`
    pub fn min_incomplete_batch_id(&self) -> TxnBatchId {
        self.batches
            .values()
            .next()
            .map_or(TxnBatchId::NULL, |b| b.batch_id)
    }

    /// Still-pending transactions of a batch, in original order
    pub fn transaction_ids_for(&self, batch_id: TxnBatchId) -> Vec<TransactionId> {
        self.batch_seq
            .get(&batch_id)
            .and_then(|seq| self.batches.get(seq))
            .map(|b| {
                b.transactions
                    .iter()
                    .filter(|id| b.pending.contains(id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Append every unacknowledged transaction id in ascending order
    pub fn add_incomplete_transaction_ids_to<'a>(
        &self,
        out: &'a mut Vec<TransactionId>,
    ) -> &'a mut Vec<TransactionId> {
        out.extend(self.pending.iter().copied());
        out
    }

    /// Batch a pending transaction belongs to
    pub fn batch_for(&self, id: TransactionId) -> Option<TxnBatchId> {
        self.txn_to_batch.get(&id).copied()
    }

    /// Whether `id` is still unacknowledged
    pub fn is_pending(&self, id: TransactionId) -> bool {
        self.pending.contains(&id)
    }

    /// Number of unacknowledged transactions
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of outstanding batches
    pub fn outstanding_batches(&self) -> usize {
        self.batches.len()
    }

    /// True when nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Forget everything outstanding; the highest issued id is kept so the
    /// low-water-mark never moves backwards
    pub fn clear(&mut self) {
        self.batches.clear();
        self.batch_seq.clear();
        self.txn_to_batch.clear();
        self.pending.clear();
    }
}
