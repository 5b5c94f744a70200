//! Tessera - transactional consistency core for a clustered object platform
//!
//! Clients mutate shared objects under distributed locks. Their changes are
//! grouped into transactions, transactions into batches, and batches are
//! applied by a server in one global order.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{ClientTransactionManager, LockLevel, RemoteTransactionManager};
//!
//! let remote = Arc::new(RemoteTransactionManager::new(session, &config.transactions, sender));
//! let txns = ClientTransactionManager::new(remote);
//!
//! // once the lock is awarded
//! txns.begin(thread, lock.clone(), LockLevel::Write, false, &abort)?;
//! txns.field_changed(thread, object, "balance", FieldValue::Int(100))?;
//! txns.commit(thread, &lock, None, &abort)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`]: ids, lock levels, errors, configuration
//! - [`locks`]: server lock manager (greedy and non-greedy)
//! - [`concurrency`]: client transactions, batching, acknowledgement accounting
//! - [`engine`]: server apply pipeline and global ordering

pub use tessera_concurrency as concurrency;
pub use tessera_core as core;
pub use tessera_engine as engine;
pub use tessera_locks as locks;

pub use tessera_concurrency::{
    BatchSender, ClientTransaction, ClientTransactionManager, FieldValue, OutboundBatch,
    RemoteTransactionManager, TransactionBatchAccounting, TransactionCompletionListener,
    TransactionRecord,
};
pub use tessera_core::{
    AbortToken, ClientId, GlobalTransactionId, LockConfig, LockId, LockLevel, LockPolicy, NodeId,
    NotifyAction, ObjectId, ProtocolViolation, Result, ServerConfig, ServerId,
    ServerLockLevel, ServerTransactionId, SessionId, TesseraConfig, TesseraError, ThreadId,
    TransactionConfig, TransactionId, TxnBatchId,
};
pub use tessera_engine::{
    ChangeBroadcaster, ClientChannel, GlobalTransactionManager, LowWaterMarkListener,
    ObjectApplier, PublishedWatermark, ServerTransactionListener, ServerTransactionManager,
};
pub use tessera_locks::{
    LockManager, LockResponse, LockResponseSink, NotifiedWaiters, ServerLockContext,
};
