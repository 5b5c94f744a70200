//! Lock requests as values
//!
//! Client messages that change lock state. Requests that arrive before the
//! manager is started are queued in this form and replayed in order by
//! `LockManager::start`.

use crate::context::ServerLockContext;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_core::{ClientId, LockId, ServerLockLevel, ThreadId};

/// A state-changing lock message from a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockRequest {
    /// Blocking acquire
    Lock {
        /// Lock
        lock: LockId,
        /// Requesting client
        client: ClientId,
        /// Requesting thread
        thread: ThreadId,
        /// Level wanted
        level: ServerLockLevel,
    },
    /// Acquire that is refused after `timeout` (zero: refuse at once)
    TryLock {
        /// Lock
        lock: LockId,
        /// Requesting client
        client: ClientId,
        /// Requesting thread
        thread: ThreadId,
        /// Level wanted
        level: ServerLockLevel,
        /// How long the request may stay pending
        timeout: Duration,
    },
    /// Release a hold (`ThreadId::VM` releases a greedy hold)
    Unlock {
        /// Lock
        lock: LockId,
        /// Holding client
        client: ClientId,
        /// Holding thread
        thread: ThreadId,
    },
    /// Release and park in the wait set
    Wait {
        /// Lock
        lock: LockId,
        /// Holding client
        client: ClientId,
        /// Holding thread
        thread: ThreadId,
        /// Maximum wait; `None` waits until notified
        timeout: Option<Duration>,
    },
    /// Cancel a waiter or a pending request
    Interrupt {
        /// Lock
        lock: LockId,
        /// Client of the cancelled thread
        client: ClientId,
        /// Cancelled thread
        thread: ThreadId,
    },
    /// Answer to a recall: the greedy hold is returned with its local state
    RecallCommit {
        /// Lock
        lock: LockId,
        /// Former greedy holder
        client: ClientId,
        /// Local holders, waiters and pending requests to take over
        contexts: Vec<ServerLockContext>,
    },
}

impl LockRequest {
    /// Lock the request targets
    pub fn lock_id(&self) -> &LockId {
        match self {
            LockRequest::Lock { lock, .. }
            | LockRequest::TryLock { lock, .. }
            | LockRequest::Unlock { lock, .. }
            | LockRequest::Wait { lock, .. }
            | LockRequest::Interrupt { lock, .. }
            | LockRequest::RecallCommit { lock, .. } => lock,
        }
    }

    /// Client that sent the request
    pub fn client(&self) -> ClientId {
        match self {
            LockRequest::Lock { client, .. }
            | LockRequest::TryLock { client, .. }
            | LockRequest::Unlock { client, .. }
            | LockRequest::Wait { client, .. }
            | LockRequest::Interrupt { client, .. }
            | LockRequest::RecallCommit { client, .. } => *client,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            LockRequest::Lock { .. } => "lock",
            LockRequest::TryLock { .. } => "try_lock",
            LockRequest::Unlock { .. } => "unlock",
            LockRequest::Wait { .. } => "wait",
            LockRequest::Interrupt { .. } => "interrupt",
            LockRequest::RecallCommit { .. } => "recall_commit",
        }
    }
}
