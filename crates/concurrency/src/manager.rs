//! Client transaction manager
//!
//! Maps every thread to its stack of open lock scopes and the transaction
//! recording writes for the innermost one. Acquiring a lock opens a scope;
//! releasing it commits the scope's transaction.
//!
//! ## Nesting
//!
//! ```text
//! begin(A)            scopes [A]     txn(A)
//!   begin(B)          scopes [A, B]  txn(A) committed, txn(B) opened
//!   commit(B)         scopes [A]     txn(B) committed, fresh txn(A) opened
//! commit(A)           scopes []      txn(A) committed, context removed
//! ```
//!
//! Entering a nested scope commits what the outer scope wrote so far, so each
//! transaction covers exactly one lock.
//!
//! ## Commit
//!
//! A transaction without changes or notifies is discarded. Others get their
//! [`SequenceId`], are sealed and handed to the [`RemoteTransactionManager`].
//! Atomic transactions and synchronous-write levels block until the server
//! acknowledges them before the commit callback runs.

use crate::remote::RemoteTransactionManager;
use crate::transaction::{ClientTransaction, FieldValue};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::Arc;
use tessera_core::{
    AbortToken, LockId, LockLevel, NotifyAction, ObjectId, ProtocolViolation, Result, Sequence,
    SequenceId, TesseraError, ThreadId, TransactionId,
};
use tracing::{debug, trace};

/// Callback run once a commit is complete
pub type OnCommit = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone)]
struct LockScope {
    lock: LockId,
    level: LockLevel,
    atomic: bool,
}

impl LockScope {
    fn open(&self, thread: ThreadId) -> ClientTransaction {
        ClientTransaction::new(thread, self.lock.clone(), self.level, self.atomic)
    }
}

#[derive(Debug, Default)]
struct ThreadContext {
    scopes: Vec<LockScope>,
    current: Option<ClientTransaction>,
}

/// Per-thread transaction scopes of one client
pub struct ClientTransactionManager {
    contexts: Mutex<FxHashMap<ThreadId, ThreadContext>>,
    sequence: Sequence,
    remote: Arc<RemoteTransactionManager>,
}

impl ClientTransactionManager {
    /// Create a manager committing through `remote`
    pub fn new(remote: Arc<RemoteTransactionManager>) -> Self {
        Self {
            contexts: Mutex::new(FxHashMap::default()),
            sequence: Sequence::new(),
            remote,
        }
    }

    /// The batching layer
    pub fn remote(&self) -> &Arc<RemoteTransactionManager> {
        &self.remote
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// Open a lock scope for `thread`
    ///
    /// Called once the lock is held. If the thread already has an open scope,
    /// what it recorded so far is committed first (without waiting for the
    /// server).
    pub fn begin(&self, thread: ThreadId, lock: LockId, level: LockLevel, atomic: bool, abort: &AbortToken) -> Result<()> {
        let scope = LockScope { lock, level, atomic };
        let outer = {
            let mut contexts = self.contexts.lock();
            let ctx = contexts.entry(thread).or_default();
            let outer = ctx.current.replace(scope.open(thread));
            ctx.scopes.push(scope);
            outer
        };
        trace!(target: "tessera::txn", %thread, nested = outer.is_some(), "Opened lock scope");

        if let Some(txn) = outer {
            self.dispatch(txn, false, abort)?;
        }
        Ok(())
    }

    /// Close the innermost scope of `thread` and commit its transaction
    ///
    /// `lock` must name the innermost open scope. Returns the transaction id
    /// when something was sent, `None` when the transaction was empty.
    ///
    /// # Errors
    ///
    /// - `NoOpenTransaction` / `LockScopeMismatch` protocol violations
    /// - `Aborted` if `abort` fired before the transaction was handed off, or
    ///   while waiting for the acknowledgement of a synchronous commit
    pub fn commit(
        &self,
        thread: ThreadId,
        lock: &LockId,
        on_commit: Option<OnCommit>,
        abort: &AbortToken,
    ) -> Result<Option<TransactionId>> {
        let (txn, wait) = {
            let mut contexts = self.contexts.lock();
            let Some(ctx) = contexts.get_mut(&thread) else {
                return Err(ProtocolViolation::NoOpenTransaction(thread).raise());
            };
            let innermost = ctx
                .scopes
                .last()
                .map(|s| s.lock.clone())
                .ok_or_else(|| ProtocolViolation::NoOpenTransaction(thread).raise())?;
            if &innermost != lock {
                return Err(ProtocolViolation::LockScopeMismatch {
                    open: innermost,
                    committed: lock.clone(),
                }
                .raise());
            }

            let scope = ctx.scopes.pop();
            let txn = ctx.current.take();
            match ctx.scopes.last() {
                Some(enclosing) => ctx.current = Some(enclosing.open(thread)),
                None => {
                    contexts.remove(&thread);
                }
            }
            let wait = scope.is_some_and(|s| s.atomic || s.level.is_synchronous());
            (txn, wait)
        };

        if abort.is_aborted() {
            debug!(target: "tessera::txn", %thread, %lock, "Commit aborted before hand-off");
            return Err(TesseraError::Aborted);
        }

        let id = match txn {
            Some(txn) => self.dispatch(txn, wait, abort)?,
            None => None,
        };
        if let Some(callback) = on_commit {
            callback();
        }
        Ok(id)
    }

    /// Seal and send one transaction; wait for its acknowledgement if asked
    fn dispatch(&self, mut txn: ClientTransaction, wait: bool, abort: &AbortToken) -> Result<Option<TransactionId>> {
        txn.set_sequence_id(SequenceId::new(self.sequence.next_value()))?;
        txn.mark_committed()?;
        if !txn.has_changes_or_notifies() {
            trace!(target: "tessera::txn", thread = %txn.thread(), lock = %txn.lock_id(), "Discarded empty transaction");
            return Ok(None);
        }

        let id = self.remote.commit(txn, abort)?;
        if wait {
            self.remote.flush()?;
            self.remote.wait_for_transaction(id, abort)?;
            debug!(target: "tessera::txn", txn = %id, "Synchronous commit acknowledged");
        }
        Ok(Some(id))
    }

    /// Drop the open scopes of `thread` without committing
    ///
    /// Returns whether the thread had any.
    pub fn abort_current(&self, thread: ThreadId) -> bool {
        let dropped = self.contexts.lock().remove(&thread);
        if let Some(ctx) = &dropped {
            debug!(target: "tessera::txn", %thread, scopes = ctx.scopes.len(), "Discarded open scopes");
        }
        dropped.is_some()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Fail unless `thread` may write shared objects
    ///
    /// # Errors
    ///
    /// `UnlockedSharedObject` without an open transaction, `ReadOnlyAccess`
    /// under a read lock.
    pub fn check_write_access(&self, thread: ThreadId) -> Result<()> {
        self.with_writable(thread, None, |_| Ok(()))
    }

    fn with_writable<T>(
        &self,
        thread: ThreadId,
        object: Option<ObjectId>,
        f: impl FnOnce(&mut ClientTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut contexts = self.contexts.lock();
        let Some(txn) = contexts.get_mut(&thread).and_then(|c| c.current.as_mut()) else {
            return Err(TesseraError::UnlockedSharedObject { thread, object });
        };
        if !txn.level().allows_writes() {
            return Err(TesseraError::ReadOnlyAccess {
                thread,
                lock: txn.lock_id().clone(),
            });
        }
        f(txn)
    }

    /// Record a field assignment
    pub fn field_changed(&self, thread: ThreadId, object: ObjectId, field: &str, value: FieldValue) -> Result<()> {
        self.with_writable(thread, Some(object), |t| t.field_changed(object, field, value))
    }

    /// Record the creation of a managed object
    pub fn create_object(&self, thread: ThreadId, object: ObjectId, class_name: &str) -> Result<()> {
        self.with_writable(thread, Some(object), |t| t.create_object(object, class_name))
    }

    /// Bind a root name
    pub fn create_root(&self, thread: ThreadId, name: &str, object: ObjectId) -> Result<()> {
        self.with_writable(thread, Some(object), |t| t.create_root(name, object))
    }

    /// Record a logical method invocation
    pub fn logical_invoke(&self, thread: ThreadId, object: ObjectId, method: &str, args: Vec<FieldValue>) -> Result<()> {
        self.with_writable(thread, Some(object), |t| t.logical_invoke(object, method, args))
    }

    /// Attach metadata to an object
    pub fn add_meta_data(&self, thread: ThreadId, object: ObjectId, name: &str, value: FieldValue) -> Result<()> {
        self.with_writable(thread, Some(object), |t| t.add_meta_data(object, name, value))
    }

    /// Keep a local object alive until the open transaction is acknowledged
    pub fn retain_reference(&self, thread: ThreadId, object: Arc<dyn Any + Send + Sync>) -> Result<()> {
        self.with_writable(thread, None, |t| t.retain_reference(object))
    }

    /// Record a notify on `lock`
    ///
    /// Read scopes may notify. The lock must be the thread's innermost scope.
    pub fn notify(&self, thread: ThreadId, lock: &LockId, action: NotifyAction) -> Result<()> {
        let mut contexts = self.contexts.lock();
        let Some(txn) = contexts.get_mut(&thread).and_then(|c| c.current.as_mut()) else {
            return Err(ProtocolViolation::NoOpenTransaction(thread).raise());
        };
        if txn.lock_id() != lock {
            return Err(ProtocolViolation::LockScopeMismatch {
                open: txn.lock_id().clone(),
                committed: lock.clone(),
            }
            .raise());
        }
        txn.add_notify(action)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Block until everything committed so far is acknowledged
    pub fn wait_for_all_current_transactions_to_complete(&self, abort: &AbortToken) -> Result<()> {
        self.remote
            .wait_for_all_current_transactions_to_complete(abort)
    }

    /// Innermost lock scope of `thread`
    pub fn current_lock(&self, thread: ThreadId) -> Option<LockId> {
        self.contexts
            .lock()
            .get(&thread)
            .and_then(|c| c.scopes.last())
            .map(|s| s.lock.clone())
    }

    /// Depth of the scope stack of `thread`
    pub fn scope_depth(&self, thread: ThreadId) -> usize {
        self.contexts
            .lock()
            .get(&thread)
            .map_or(0, |c| c.scopes.len())
    }

    /// Number of threads with open scopes
    pub fn open_thread_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

impl std::fmt::Debug for ClientTransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransactionManager")
            .field("open_threads", &self.open_thread_count())
            .field("remote", &self.remote)
            .finish()
    }
}
