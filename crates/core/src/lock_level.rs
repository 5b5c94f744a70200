//! Lock levels
//!
//! Clients run transactions under a [`LockLevel`]. The server lock manager
//! only distinguishes shared from exclusive access ([`ServerLockLevel`]);
//! concurrent transactions never reach it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Level a client transaction runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Shared access, no writes allowed
    Read,
    /// Exclusive access
    Write,
    /// Exclusive access; commit waits for the server acknowledgement
    SynchronousWrite,
    /// No server lock; transactions may be reordered relative to each other
    Concurrent,
}

impl LockLevel {
    /// The server lock level this client level needs, if any
    pub fn server_level(&self) -> Option<ServerLockLevel> {
        match self {
            LockLevel::Read => Some(ServerLockLevel::Read),
            LockLevel::Write | LockLevel::SynchronousWrite => Some(ServerLockLevel::Write),
            LockLevel::Concurrent => None,
        }
    }

    /// Whether managed objects may be written under this level
    pub fn allows_writes(&self) -> bool {
        !matches!(self, LockLevel::Read)
    }

    /// Whether commit blocks until the server acknowledges the transaction
    pub fn is_synchronous(&self) -> bool {
        matches!(self, LockLevel::SynchronousWrite)
    }

    /// Whether the transaction is unordered relative to other concurrent ones
    pub fn is_concurrent(&self) -> bool {
        matches!(self, LockLevel::Concurrent)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockLevel::Read => "read",
            LockLevel::Write => "write",
            LockLevel::SynchronousWrite => "synchronous-write",
            LockLevel::Concurrent => "concurrent",
        };
        f.write_str(s)
    }
}

/// Level tracked by the server lock manager
///
/// Ordered: `Read < Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServerLockLevel {
    /// Shared; compatible with other readers
    Read,
    /// Exclusive
    Write,
}

impl ServerLockLevel {
    /// Read-read is the only compatible pair
    #[inline]
    pub fn is_compatible_with(&self, other: ServerLockLevel) -> bool {
        matches!((self, other), (ServerLockLevel::Read, ServerLockLevel::Read))
    }

    /// True for exclusive access
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, ServerLockLevel::Write)
    }
}

impl fmt::Display for ServerLockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLockLevel::Read => f.write_str("read"),
            ServerLockLevel::Write => f.write_str("write"),
        }
    }
}

/// How many waiters a notify wakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyAction {
    /// Wake the longest-waiting waiter
    One,
    /// Wake every waiter
    All,
}
