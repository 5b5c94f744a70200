//! Core types for Tessera
//!
//! This crate defines the foundational types shared by the client transaction
//! layer and the server lock/ordering layer:
//! - Identifiers: LockId, ThreadId, ClientId, NodeId, TransactionId, ...
//! - Lock levels: LockLevel (client), ServerLockLevel, NotifyAction
//! - Error: TesseraError and the fatal ProtocolViolation taxonomy
//! - Config: TesseraConfig loaded from `tessera.toml`
//! - Sequence: monotonic id generator
//! - AbortToken: cooperative cancellation for blocking waits
//! - ListenerRegistry: id-keyed listener subscriptions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod ids;
pub mod listeners;
pub mod lock_level;
pub mod sequence;

pub use cancel::AbortToken;
pub use config::{LockConfig, LockPolicy, ServerConfig, TesseraConfig, TransactionConfig};
pub use error::{ProtocolViolation, Result, TesseraError};
pub use ids::{
    ClientId, GlobalTransactionId, LockId, NodeId, ObjectId, SequenceId, ServerId,
    ServerTransactionId, SessionId, SubscriptionId, ThreadId, TransactionId, TxnBatchId,
};
pub use listeners::ListenerRegistry;
pub use lock_level::{LockLevel, NotifyAction, ServerLockLevel};
pub use sequence::Sequence;
