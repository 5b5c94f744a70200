//! Error types for tessera
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Errors fall into four classes:
//! - Protocol violations: desynchronized distributed state, always fatal
//! - Access violations: writing a shared object without the right lock
//! - Cooperative cancellation: a blocking wait observed its abort token
//! - Ambient failures: configuration, serialization, closed channels
//!
//! Lock timeouts are not errors. They are delivered as lock responses.

use crate::ids::{
    ClientId, GlobalTransactionId, LockId, ObjectId, ServerTransactionId, ThreadId, TransactionId,
    TxnBatchId,
};
use crate::lock_level::ServerLockLevel;
use thiserror::Error;

/// Result type alias for tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Conditions that mean cluster state is no longer consistent
///
/// A protocol violation must reach the process-level fault handler. Callers
/// propagate it and never retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// A transaction was committed twice
    #[error("transaction for {lock} committed twice")]
    DoubleCommit {
        /// Lock the transaction ran under
        lock: LockId,
    },

    /// A mutation was recorded on an already committed transaction
    #[error("mutation recorded on committed transaction for {lock}")]
    MutationAfterCommit {
        /// Lock the transaction ran under
        lock: LockId,
    },

    /// A sequence id was assigned to a transaction that already had one
    #[error("sequence id reassigned for transaction under {lock}")]
    SequenceIdReassigned {
        /// Lock the transaction ran under
        lock: LockId,
    },

    /// A transaction id was assigned to a transaction that already had one
    #[error("transaction id reassigned: had {existing}, got {attempted}")]
    TransactionIdReassigned {
        /// Id already assigned
        existing: TransactionId,
        /// Id of the second assignment
        attempted: TransactionId,
    },

    /// An acknowledgement named a batch that was never registered
    #[error("acknowledgement for unknown {0}")]
    UnknownBatch(TxnBatchId),

    /// A batch id was registered twice
    #[error("{0} registered twice")]
    DuplicateBatch(TxnBatchId),

    /// A transaction id was registered while already outstanding
    #[error("{0} is already outstanding")]
    DuplicateTransaction(TransactionId),

    /// A transaction was given a second global transaction id
    #[error("{transaction} already ordered as {existing}")]
    DuplicateGlobalTransactionId {
        /// Transaction being ordered
        transaction: ServerTransactionId,
        /// Id it already has
        existing: GlobalTransactionId,
    },

    /// A grant would break mutual exclusion
    #[error("{level} grant of {lock} to {client}/{thread} conflicts with existing holders")]
    DoubleWriteGrant {
        /// Lock being granted
        lock: LockId,
        /// Grantee client
        client: ClientId,
        /// Grantee thread
        thread: ThreadId,
        /// Level of the grant
        level: ServerLockLevel,
    },

    /// A thread asked for a lock it already holds, waits on, or requested
    #[error("duplicate request for {lock} from {client}/{thread}")]
    DuplicateLockRequest {
        /// Lock requested
        lock: LockId,
        /// Requesting client
        client: ClientId,
        /// Requesting thread
        thread: ThreadId,
    },

    /// An operation that requires holding a lock came from a non-holder
    #[error("{client}/{thread} does not hold {lock}")]
    LockNotHeld {
        /// Lock concerned
        lock: LockId,
        /// Client claiming the lock
        client: ClientId,
        /// Thread claiming the lock
        thread: ThreadId,
    },

    /// A recall commit came from a client without a greedy hold
    #[error("{client} holds no greedy lock on {lock}")]
    NotGreedyHolder {
        /// Lock concerned
        lock: LockId,
        /// Client that answered the recall
        client: ClientId,
    },

    /// A lock context of a kind not accepted by the operation
    #[error("unexpected {kind} context for {lock} in {operation}")]
    UnexpectedContext {
        /// Lock concerned
        lock: LockId,
        /// Context kind received
        kind: &'static str,
        /// Operation that rejected it
        operation: &'static str,
    },

    /// An operation only valid before start ran after it
    #[error("{0} is only valid before the lock manager starts")]
    AlreadyStarted(&'static str),

    /// An operation that cannot be deferred ran before start
    #[error("{0} needs a started lock manager")]
    NotStarted(&'static str),

    /// A read holder asked to upgrade while another reader's upgrade is queued
    #[error("{client}/{thread} cannot upgrade {lock}: another reader's upgrade is queued")]
    ConflictingUpgrade {
        /// Lock concerned
        lock: LockId,
        /// Client asking to upgrade
        client: ClientId,
        /// Thread asking to upgrade
        thread: ThreadId,
    },

    /// A commit named a lock other than the innermost open scope
    #[error("commit of {committed} does not match open scope {open}")]
    LockScopeMismatch {
        /// Innermost open lock scope
        open: LockId,
        /// Lock named by the commit
        committed: LockId,
    },

    /// A commit or notify arrived for a thread with no open transaction
    #[error("{0} has no open transaction")]
    NoOpenTransaction(ThreadId),
}

impl ProtocolViolation {
    /// Log the violation and convert it into a fatal error
    #[track_caller]
    pub fn raise(self) -> TesseraError {
        let location = std::panic::Location::caller();
        tracing::error!(
            target: "tessera::protocol",
            violation = %self,
            file = location.file(),
            line = location.line(),
            "Protocol violation"
        );
        TesseraError::Protocol(self)
    }
}

/// Error types for tessera
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Desynchronized protocol state (fatal)
    #[error("protocol violation: {0}")]
    Protocol(ProtocolViolation),

    /// A managed object was written without an open transaction
    #[error("{thread} wrote shared object {object:?} without holding a lock")]
    UnlockedSharedObject {
        /// Writing thread
        thread: ThreadId,
        /// Object written, when known
        object: Option<ObjectId>,
    },

    /// A managed object was written under a read lock
    #[error("{thread} wrote a shared object under read lock {lock}")]
    ReadOnlyAccess {
        /// Writing thread
        thread: ThreadId,
        /// Read lock in effect
        lock: LockId,
    },

    /// A blocking operation observed its abort token
    #[error("operation aborted")]
    Aborted,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An outbound channel is gone
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// I/O error (timer thread spawn, config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TesseraError {
    /// Whether this error must be escalated to the process fault handler
    pub fn is_fatal(&self) -> bool {
        matches!(self, TesseraError::Protocol(_))
    }

    /// The protocol violation, if this is one
    pub fn as_protocol(&self) -> Option<&ProtocolViolation> {
        match self {
            TesseraError::Protocol(v) => Some(v),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TesseraError::Config(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for TesseraError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TesseraError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}
