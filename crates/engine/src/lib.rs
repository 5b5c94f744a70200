//! Server engine for Tessera
//!
//! This crate orders and applies client transactions:
//! - GlobalTransactionManager: cluster-wide apply order, exactly-once records
//! - ServerTransactionManager: batch receive, lock checks, apply, acks
//! - Collaborator traits: ObjectApplier, ChangeBroadcaster, ClientChannel,
//!   ServerTransactionListener, LowWaterMarkListener
//!
//! The engine is the only component that knows about both the lock manager
//! and the client transaction wire format.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collaborators;
pub mod coordinator;
pub mod global;

pub use collaborators::{
    ChangeBroadcaster, ClientChannel, LowWaterMarkListener, NullApplier, NullBroadcaster,
    ObjectApplier, PublishedWatermark, ServerTransactionListener,
};
pub use coordinator::{ApplyMetrics, ServerTransactionManager};
pub use global::{GlobalTransactionIdSequence, GlobalTransactionManager};
