//! Collaborator traits of the server apply pipeline
//!
//! The pipeline orders and acknowledges transactions; what applying a change
//! means, who hears about it and how acknowledgements travel is supplied by
//! the embedding server through these traits.

use serde::{Deserialize, Serialize};
use tessera_concurrency::TransactionRecord;
use tessera_core::{
    ClientId, GlobalTransactionId, NodeId, Result, ServerTransactionId, SessionId, TransactionId,
    TxnBatchId,
};
use tessera_locks::NotifiedWaiters;

/// Applies decoded transactions to the object store
pub trait ObjectApplier: Send + Sync {
    /// Apply one transaction at its global position
    ///
    /// Called under the apply mutex, in global id order.
    fn apply(
        &self,
        global_id: GlobalTransactionId,
        stxid: &ServerTransactionId,
        record: &TransactionRecord,
    ) -> Result<()>;
}

/// Fans applied change-sets out to other clients
pub trait ChangeBroadcaster: Send + Sync {
    /// Broadcast an applied transaction along with the waiters its notifies
    /// moved
    fn broadcast(
        &self,
        global_id: GlobalTransactionId,
        stxid: &ServerTransactionId,
        record: &TransactionRecord,
        notified: &NotifiedWaiters,
    );
}

/// Server-to-client acknowledgement channel
pub trait ClientChannel: Send + Sync {
    /// Transaction `id` was applied
    fn transaction_acknowledged(&self, session: SessionId, id: TransactionId, node: &NodeId) -> Result<()>;

    /// Batch `batch` was fully processed
    fn batch_acknowledged(&self, session: SessionId, batch: TxnBatchId, node: &NodeId) -> Result<()>;
}

/// Server-side completion callback
pub trait ServerTransactionListener: Send + Sync {
    /// Fires exactly once per applied transaction
    fn transaction_completed(&self, stxid: &ServerTransactionId);
}

/// Watermark published after a batch advanced the global low-water-mark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedWatermark {
    /// Client whose batch triggered the publication
    pub client: ClientId,
    /// That client's low-water-mark
    pub transaction_low_water_mark: TransactionId,
    /// Smallest global id still being applied, else the next to issue
    pub global_low_water_mark: GlobalTransactionId,
}

/// Consumer of published watermarks (garbage collection, replication)
pub trait LowWaterMarkListener: Send + Sync {
    /// A new watermark was published
    fn watermark_published(&self, watermark: &PublishedWatermark);
}

/// Applier that accepts everything and stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullApplier;

impl ObjectApplier for NullApplier {
    fn apply(&self, _: GlobalTransactionId, _: &ServerTransactionId, _: &TransactionRecord) -> Result<()> {
        Ok(())
    }
}

/// Broadcaster with no subscribers
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcaster;

impl ChangeBroadcaster for NullBroadcaster {
    fn broadcast(&self, _: GlobalTransactionId, _: &ServerTransactionId, _: &TransactionRecord, _: &NotifiedWaiters) {}
}
