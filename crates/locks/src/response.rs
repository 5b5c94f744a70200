//! Lock responses
//!
//! Everything the lock manager tells a client goes through a
//! [`LockResponseSink`]: awards, recalls of greedy holds, refusals of
//! try-lock requests and wait timeouts. Responses are emitted after the
//! lock's state has been released, so a sink may call back into the manager.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tessera_core::{ClientId, LockId, ServerLockLevel, ThreadId};

/// A message from the lock manager to one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockResponse {
    /// The lock was granted; `thread` is `ThreadId::VM` for a greedy grant
    Awarded {
        /// Lock granted
        lock: LockId,
        /// Grantee client
        client: ClientId,
        /// Grantee thread
        thread: ThreadId,
        /// Level granted
        level: ServerLockLevel,
    },
    /// Give back a greedy hold; another request needs `level`
    Recall {
        /// Lock to recall
        lock: LockId,
        /// Greedy holder
        client: ClientId,
        /// Level the blocked request needs
        level: ServerLockLevel,
    },
    /// A try-lock could not be granted in time
    Refused {
        /// Lock requested
        lock: LockId,
        /// Requesting client
        client: ClientId,
        /// Requesting thread
        thread: ThreadId,
        /// Level requested
        level: ServerLockLevel,
    },
    /// A timed wait expired; the waiter is pending again
    WaitTimedOut {
        /// Lock waited on
        lock: LockId,
        /// Waiting client
        client: ClientId,
        /// Waiting thread
        thread: ThreadId,
    },
}

impl LockResponse {
    /// Lock the response concerns
    pub fn lock(&self) -> &LockId {
        match self {
            LockResponse::Awarded { lock, .. }
            | LockResponse::Recall { lock, .. }
            | LockResponse::Refused { lock, .. }
            | LockResponse::WaitTimedOut { lock, .. } => lock,
        }
    }

    /// Client the response is addressed to
    pub fn client(&self) -> ClientId {
        match self {
            LockResponse::Awarded { client, .. }
            | LockResponse::Recall { client, .. }
            | LockResponse::Refused { client, .. }
            | LockResponse::WaitTimedOut { client, .. } => *client,
        }
    }

    /// True for an award to exactly this client/thread
    pub fn is_award_to(&self, client: ClientId, thread: ThreadId) -> bool {
        matches!(self, LockResponse::Awarded { client: c, thread: t, .. } if *c == client && *t == thread)
    }
}

/// Outbound channel for lock responses
pub trait LockResponseSink: Send + Sync {
    /// Deliver one response
    fn send(&self, response: LockResponse);
}

/// Sink that drops every response
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LockResponseSink for NullSink {
    fn send(&self, _response: LockResponse) {}
}

/// Sink that records responses in arrival order
///
/// Used by in-process harnesses; `wait_for` blocks until a matching response
/// arrives.
#[derive(Debug, Default)]
pub struct LockResponseLog {
    responses: Mutex<Vec<LockResponse>>,
    arrived: Condvar,
}

impl LockResponseLog {
    /// An empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> Vec<LockResponse> {
        self.responses.lock().clone()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<LockResponse> {
        std::mem::take(&mut *self.responses.lock())
    }

    /// Number of recorded responses
    pub fn len(&self) -> usize {
        self.responses.lock().len()
    }

    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.responses.lock().is_empty()
    }

    /// Block until a recorded response matches `pred` or `timeout` passes
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&LockResponse) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut responses = self.responses.lock();
        loop {
            if responses.iter().any(&pred) {
                return true;
            }
            if self.arrived.wait_until(&mut responses, deadline).timed_out() {
                return responses.iter().any(&pred);
            }
        }
    }
}

impl LockResponseSink for LockResponseLog {
    fn send(&self, response: LockResponse) {
        self.responses.lock().push(response);
        self.arrived.notify_all();
    }
}
