//! Distributed lock manager for Tessera
//!
//! This crate implements the server side of the lock protocol:
//! - ServerLockContext: one (client, thread) relationship to a lock
//! - ServerLock: holders, pending requests and waiters of one lock, with
//!   greedy grants to whole client nodes and recall on contention
//! - LockManager: owns every lock, serializes operations per lock id,
//!   defers requests until started, expires try-locks and timed waits
//! - NotifiedWaiters: waiters woken by notify, bucketed by node
//!
//! Responses leave through a [`LockResponseSink`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod manager;
pub mod notified;
pub mod request;
pub mod response;
mod server_lock;
mod timer;

pub use context::{ContextState, ServerLockContext};
pub use manager::LockManager;
pub use notified::NotifiedWaiters;
pub use request::LockRequest;
pub use response::{LockResponse, LockResponseLog, LockResponseSink, NullSink};
pub use server_lock::LockSnapshot;
