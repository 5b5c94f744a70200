//! Wire records for committed transactions
//!
//! Each committed transaction is serialized into one `TransactionRecord`
//! blob; a batch of blobs travels as one [`OutboundBatch`](crate::batch::OutboundBatch).
//! The server decodes them back and applies them in order.
//!
//! ## Format
//!
//! Records are serialized using MessagePack (`rmp-serde`) for compact
//! binary encoding with schema evolution support.

use crate::transaction::{ChangeBuffer, MetaData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_core::{
    LockId, LockLevel, NotifyAction, ObjectId, Result, SequenceId, ThreadId, TransactionId,
};

/// A notify recorded inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRecord {
    /// Lock whose waiters are woken
    pub lock: LockId,
    /// Notifying thread
    pub thread: ThreadId,
    /// One or all
    pub action: NotifyAction,
}

/// Serializable form of a committed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Client-local transaction id
    pub transaction_id: TransactionId,
    /// Client-local commit order
    pub sequence_id: SequenceId,
    /// Committing thread
    pub thread: ThreadId,
    /// Lock scope the transaction ran under
    pub lock: LockId,
    /// Lock level the transaction ran under
    pub level: LockLevel,
    /// Per-object changes in first-touched order
    pub changes: Vec<ChangeBuffer>,
    /// Root bindings
    pub new_roots: BTreeMap<String, ObjectId>,
    /// Notifies to run at apply time
    pub notifies: Vec<NotifyRecord>,
    /// Object metadata
    pub meta_data: Vec<MetaData>,
}

impl TransactionRecord {
    /// Whether the server must check the lock before applying
    pub fn requires_lock(&self) -> bool {
        !self.level.is_concurrent()
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

/// One encoded transaction inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTransaction {
    /// Id of the encoded transaction, readable without decoding
    pub transaction_id: TransactionId,
    /// MessagePack-encoded [`TransactionRecord`]
    pub bytes: Vec<u8>,
}

impl EncodedTransaction {
    /// Encode a record
    pub fn encode(record: &TransactionRecord) -> Result<Self> {
        Ok(Self {
            transaction_id: record.transaction_id,
            bytes: record.to_bytes()?,
        })
    }

    /// Decode the record
    pub fn decode(&self) -> Result<TransactionRecord> {
        TransactionRecord::from_bytes(&self.bytes)
    }
}
