//! Identifier types
//!
//! Every participant in the lock and transaction protocol is named by one of
//! these value types:
//! - LockId: a distributed mutual-exclusion/sharing unit
//! - ThreadId: a requesting thread inside one client node
//! - ClientId / ServerId / NodeId: cluster members
//! - TransactionId, SequenceId, TxnBatchId: client-issued ordering tokens
//! - GlobalTransactionId: server-issued total order
//! - ServerTransactionId: cluster-wide key of one transaction
//!
//! Numeric ids reserve 0 as their null sentinel; sequences issue from 1.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Null sentinel (never issued by a sequence)
            pub const NULL: Self = Self(0);

            /// Wrap a raw value
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Raw numeric value
            #[inline]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }

            /// True for the null sentinel
            #[inline]
            pub const fn is_null(&self) -> bool {
                self.0 == 0
            }

            /// Deterministic successor
            #[inline]
            pub const fn next(&self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_null() {
                    write!(f, concat!($prefix, ":null"))
                } else {
                    write!(f, concat!($prefix, ":{}"), self.0)
                }
            }
        }
    };
}

numeric_id!(
    /// Per-client, strictly increasing id of a committed transaction
    TransactionId,
    "txn"
);

numeric_id!(
    /// Client-local commit order, assigned before the transaction id is known
    SequenceId,
    "seq"
);

numeric_id!(
    /// Identity of a batch of transactions sent together
    TxnBatchId,
    "batch"
);

numeric_id!(
    /// Server-assigned position in the cluster-wide apply order
    GlobalTransactionId,
    "gtx"
);

numeric_id!(
    /// Identity of one client connection epoch
    ///
    /// Acknowledgements carrying a session other than the current one belong
    /// to a previous connection and are ignored.
    SessionId,
    "session"
);

numeric_id!(
    /// Identity of a managed (shared) object
    ObjectId,
    "obj"
);

numeric_id!(
    /// Handle returned by a listener registry
    SubscriptionId,
    "sub"
);

// ============================================================================
// Locks and threads
// ============================================================================

/// Identity of a distributed lock
///
/// Lock ids are opaque names compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    /// Create a lock id from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The lock's name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{}", self.0)
    }
}

/// Identity of a requesting thread within a client node
///
/// `ThreadId::VM` stands for the client node as a whole. Greedy holds are
/// recorded against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The whole client node
    pub const VM: Self = Self(0);

    /// Wrap a raw thread number
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// True for the node-wide thread id
    pub const fn is_vm(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_vm() {
            write!(f, "thread:vm")
        } else {
            write!(f, "thread:{}", self.0)
        }
    }
}

// ============================================================================
// Cluster members
// ============================================================================

/// Identity of a client node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    /// Wrap a raw client number
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw numeric value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Identity of a server node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    /// Create a server id from its node name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The node name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server:{}", self.0)
    }
}

/// Identity of any cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeId {
    /// A client node
    Client(ClientId),
    /// A server node
    Server(ServerId),
}

impl NodeId {
    /// The client id, if this node is a client
    pub fn as_client(&self) -> Option<ClientId> {
        match self {
            NodeId::Client(id) => Some(*id),
            NodeId::Server(_) => None,
        }
    }
}

impl From<ClientId> for NodeId {
    fn from(id: ClientId) -> Self {
        NodeId::Client(id)
    }
}

impl From<ServerId> for NodeId {
    fn from(id: ServerId) -> Self {
        NodeId::Server(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Client(id) => id.fmt(f),
            NodeId::Server(id) => id.fmt(f),
        }
    }
}

/// Cluster-wide key of a transaction: its source node and client-local id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerTransactionId {
    /// Node that committed the transaction
    pub source: NodeId,
    /// Source-local transaction id
    pub transaction: TransactionId,
}

impl ServerTransactionId {
    /// Create a server transaction id
    pub fn new(source: impl Into<NodeId>, transaction: TransactionId) -> Self {
        Self {
            source: source.into(),
            transaction,
        }
    }
}

impl fmt::Display for ServerTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.transaction)
    }
}
