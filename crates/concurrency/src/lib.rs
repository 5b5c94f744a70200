//! Client transaction layer for Tessera
//!
//! This crate records what client threads do to managed objects and ships it
//! to the server:
//! - ClientTransaction: changes recorded under one lock scope
//! - ClientTransactionManager: per-thread scope stacks, begin/commit
//! - RemoteTransactionManager: batching, acknowledgements, resend
//! - TransactionBatchAccounting: outstanding batches and the low-water-mark
//! - TransactionRecord / OutboundBatch: MessagePack wire forms

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accounting;
pub mod batch;
pub mod manager;
pub mod record;
pub mod remote;
pub mod transaction;

pub use accounting::{BatchRecord, TransactionBatchAccounting};
pub use batch::{BatchLimits, OutboundBatch, TransactionBatch};
pub use manager::{ClientTransactionManager, OnCommit};
pub use record::{EncodedTransaction, NotifyRecord, TransactionRecord};
pub use remote::{BatchSender, RemoteTransactionManager, TransactionCompletionListener};
pub use transaction::{ChangeAction, ChangeBuffer, ClientTransaction, FieldValue, MetaData};
