//! Lock contexts
//!
//! A [`ServerLockContext`] is one (client, thread) relationship to one lock.
//! The same type is exchanged with clients: a client answering a recall, or
//! reconnecting after a failover, reports its state as a list of contexts.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_core::{ClientId, LockId, NodeId, ServerLockLevel, ThreadId};

/// What a context represents, with the level involved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextState {
    /// A thread holds the lock
    Holder(ServerLockLevel),
    /// The whole client node holds the lock (thread is `ThreadId::VM`)
    GreedyHolder(ServerLockLevel),
    /// A blocking request waiting for an award
    Pending(ServerLockLevel),
    /// A request that gives up after its timeout
    TryPending(ServerLockLevel),
    /// A thread parked in the lock's wait set; level is what it held
    Waiter(ServerLockLevel),
}

impl ContextState {
    /// The lock level carried by this state
    pub fn level(&self) -> ServerLockLevel {
        match *self {
            ContextState::Holder(l)
            | ContextState::GreedyHolder(l)
            | ContextState::Pending(l)
            | ContextState::TryPending(l)
            | ContextState::Waiter(l) => l,
        }
    }

    /// Short name for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            ContextState::Holder(_) => "holder",
            ContextState::GreedyHolder(_) => "greedy-holder",
            ContextState::Pending(_) => "pending",
            ContextState::TryPending(_) => "try-pending",
            ContextState::Waiter(_) => "waiter",
        }
    }

    /// Holder or greedy holder
    pub fn is_holder(&self) -> bool {
        matches!(self, ContextState::Holder(_) | ContextState::GreedyHolder(_))
    }
}

/// One (client, thread) relationship to a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerLockContext {
    /// Lock the context belongs to
    pub lock: LockId,
    /// Owning client
    pub client: ClientId,
    /// Owning thread (`ThreadId::VM` for greedy holds)
    pub thread: ThreadId,
    /// Role and level
    pub state: ContextState,
    /// Remaining timeout of a waiter or try-pending request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ServerLockContext {
    /// Create a context without a timeout
    pub fn new(lock: LockId, client: ClientId, thread: ThreadId, state: ContextState) -> Self {
        Self {
            lock,
            client,
            thread,
            state,
            timeout: None,
        }
    }

    /// Attach a timeout (waiters and try-pending requests)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Node the context's client runs on
    pub fn node(&self) -> NodeId {
        NodeId::Client(self.client)
    }
}
