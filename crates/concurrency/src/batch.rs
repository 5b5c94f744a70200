//! Transaction batches
//!
//! Committed transactions accumulate in an open [`TransactionBatch`] until it
//! is sent. Sending encodes it into an [`OutboundBatch`], the unit the server
//! receives and acknowledges.

use crate::record::EncodedTransaction;
use crate::transaction::ClientTransaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tessera_core::{Result, SessionId, TransactionConfig, TransactionId, TxnBatchId};

/// Size limits that close a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Transactions per batch
    pub max_transactions: usize,
    /// Approximate encoded bytes per batch
    pub max_bytes: usize,
}

impl From<&TransactionConfig> for BatchLimits {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            max_transactions: config.max_batch_transactions,
            max_bytes: config.max_batch_bytes,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from(&TransactionConfig::default())
    }
}

/// An open, growing batch of committed transactions
#[derive(Debug)]
pub struct TransactionBatch {
    batch_id: TxnBatchId,
    transactions: Vec<Arc<ClientTransaction>>,
    byte_estimate: usize,
}

impl TransactionBatch {
    /// An empty batch
    pub fn new(batch_id: TxnBatchId) -> Self {
        Self {
            batch_id,
            transactions: Vec::new(),
            byte_estimate: 0,
        }
    }

    /// Build a batch from already-committed transactions, e.g. for resend
    pub fn with_transactions(batch_id: TxnBatchId, transactions: Vec<Arc<ClientTransaction>>) -> Self {
        let mut batch = Self::new(batch_id);
        for txn in transactions {
            batch.add(txn);
        }
        batch
    }

    /// Batch id
    pub fn batch_id(&self) -> TxnBatchId {
        self.batch_id
    }

    /// Append a committed transaction
    pub fn add(&mut self, txn: Arc<ClientTransaction>) {
        self.byte_estimate += estimate_size(&txn);
        self.transactions.push(txn);
    }

    /// Number of transactions
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// True when no transaction was added
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Rough encoded size
    pub fn byte_estimate(&self) -> usize {
        self.byte_estimate
    }

    /// Whether the batch reached either limit
    pub fn is_full(&self, limits: &BatchLimits) -> bool {
        self.len() >= limits.max_transactions || self.byte_estimate >= limits.max_bytes
    }

    /// Ids of the batch's transactions in order
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(|t| t.transaction_id()).collect()
    }

    /// Encode for sending under `session`
    pub fn encode(&self, session: SessionId, low_water_mark: TransactionId) -> Result<OutboundBatch> {
        let transactions = self
            .transactions
            .iter()
            .map(|t| EncodedTransaction::encode(&t.to_record()))
            .collect::<Result<Vec<_>>>()?;
        Ok(OutboundBatch {
            session,
            batch_id: self.batch_id,
            low_water_mark,
            transactions,
        })
    }
}

// Field and argument payloads dominate; the constant covers ids and framing
fn estimate_size(txn: &ClientTransaction) -> usize {
    let changes: usize = txn
        .changes()
        .iter()
        .map(|c| 16 + c.actions.len() * 32)
        .sum();
    64 + changes + txn.new_roots().len() * 32 + txn.notifies().len() * 24 + txn.meta_data().len() * 32
}

/// A batch as sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundBatch {
    /// Connection epoch the batch was sent in
    pub session: SessionId,
    /// Batch id
    pub batch_id: TxnBatchId,
    /// Sender's low-water-mark at send time
    pub low_water_mark: TransactionId,
    /// Transactions in commit order
    pub transactions: Vec<EncodedTransaction>,
}

impl OutboundBatch {
    /// Ids of the carried transactions in order
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(|t| t.transaction_id).collect()
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
