//! Client transaction
//!
//! A `ClientTransaction` accumulates everything one thread does to managed
//! objects while it holds one lock scope: field changes, new objects, new
//! roots, logical method invocations, metadata and notify calls. It is owned
//! by its thread until commit; after commit it is immutable and shared with
//! the batching layer until the server acknowledges it.
//!
//! ## Lifecycle
//!
//! ```text
//! open ──(mutations)──> set_sequence_id ──> mark_committed ──> set_transaction_id
//! ```
//!
//! Each of the three assignments happens exactly once. Doing one twice, or
//! mutating a committed transaction, is a protocol violation.

use crate::record::{NotifyRecord, TransactionRecord};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{
    LockId, LockLevel, NotifyAction, ObjectId, ProtocolViolation, Result, SequenceId, ThreadId,
    TransactionId,
};

/// Value written to a field or passed to a logical invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Null reference
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text
    Str(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Reference to another managed object
    Ref(ObjectId),
}

/// One recorded change to a managed object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeAction {
    /// A field was assigned
    Physical {
        /// Field name
        field: String,
        /// New value
        value: FieldValue,
    },
    /// A method was invoked that the server replays instead of diffing state
    Logical {
        /// Method name
        method: String,
        /// Arguments
        args: Vec<FieldValue>,
    },
}

/// All changes to one object inside a transaction, in call order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBuffer {
    /// Changed object
    pub object: ObjectId,
    /// Class name for objects created in this transaction
    pub new_class: Option<String>,
    /// Changes in the order they were made
    pub actions: Vec<ChangeAction>,
}

impl ChangeBuffer {
    fn new(object: ObjectId) -> Self {
        Self {
            object,
            new_class: None,
            actions: Vec::new(),
        }
    }

    /// Whether the object was created in this transaction
    pub fn is_new(&self) -> bool {
        self.new_class.is_some()
    }
}

/// Metadata attached to an object, e.g. a search-index descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    /// Object described
    pub object: ObjectId,
    /// Descriptor name
    pub name: String,
    /// Descriptor value
    pub value: FieldValue,
}

/// Per-thread, per-lock-scope accumulator of object changes
pub struct ClientTransaction {
    thread: ThreadId,
    lock: LockId,
    level: LockLevel,
    atomic: bool,

    changes: Vec<ChangeBuffer>,
    change_index: FxHashMap<ObjectId, usize>,
    new_roots: BTreeMap<String, ObjectId>,
    notifies: Vec<NotifyRecord>,
    meta_data: Vec<MetaData>,

    /// Objects kept reachable until the transaction is acknowledged, keyed
    /// by identity
    retained: FxHashMap<usize, Arc<dyn Any + Send + Sync>>,

    sequence_id: SequenceId,
    transaction_id: TransactionId,
    committed: bool,
}

impl ClientTransaction {
    /// Open a transaction for `thread` under `lock`
    pub fn new(thread: ThreadId, lock: LockId, level: LockLevel, atomic: bool) -> Self {
        Self {
            thread,
            lock,
            level,
            atomic,
            changes: Vec::new(),
            change_index: Default::default(),
            new_roots: BTreeMap::new(),
            notifies: Vec::new(),
            meta_data: Vec::new(),
            retained: Default::default(),
            sequence_id: SequenceId::NULL,
            transaction_id: TransactionId::NULL,
            committed: false,
        }
    }

    /// Owning thread
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Lock scope the transaction belongs to
    pub fn lock_id(&self) -> &LockId {
        &self.lock
    }

    /// Lock level the transaction runs under
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Whether commit waits for the server acknowledgement
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Concurrent transactions may be reordered relative to each other
    pub fn is_concurrent(&self) -> bool {
        self.level.is_concurrent()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.committed {
            return Err(ProtocolViolation::MutationAfterCommit {
                lock: self.lock.clone(),
            }
            .raise());
        }
        Ok(())
    }

    fn buffer_for(&mut self, object: ObjectId) -> &mut ChangeBuffer {
        let idx = match self.change_index.get(&object) {
            Some(&idx) => idx,
            None => {
                self.changes.push(ChangeBuffer::new(object));
                let idx = self.changes.len() - 1;
                self.change_index.insert(object, idx);
                idx
            }
        };
        &mut self.changes[idx]
    }

    /// Record a field assignment
    pub fn field_changed(&mut self, object: ObjectId, field: impl Into<String>, value: FieldValue) -> Result<()> {
        self.ensure_open()?;
        self.buffer_for(object).actions.push(ChangeAction::Physical {
            field: field.into(),
            value,
        });
        Ok(())
    }

    /// Record the creation of a managed object
    pub fn create_object(&mut self, object: ObjectId, class_name: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.buffer_for(object).new_class = Some(class_name.into());
        Ok(())
    }

    /// Bind a root name to an object; a later bind in the same transaction wins
    pub fn create_root(&mut self, name: impl Into<String>, object: ObjectId) -> Result<()> {
        self.ensure_open()?;
        self.new_roots.insert(name.into(), object);
        Ok(())
    }

    /// Record a logical method invocation
    pub fn logical_invoke(
        &mut self,
        object: ObjectId,
        method: impl Into<String>,
        args: Vec<FieldValue>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.buffer_for(object).actions.push(ChangeAction::Logical {
            method: method.into(),
            args,
        });
        Ok(())
    }

    /// Attach metadata to an object
    pub fn add_meta_data(&mut self, object: ObjectId, name: impl Into<String>, value: FieldValue) -> Result<()> {
        self.ensure_open()?;
        self.meta_data.push(MetaData {
            object,
            name: name.into(),
            value,
        });
        Ok(())
    }

    /// Record a notify on this transaction's lock
    ///
    /// The server runs it when the transaction is applied.
    pub fn add_notify(&mut self, action: NotifyAction) -> Result<()> {
        self.ensure_open()?;
        self.notifies.push(NotifyRecord {
            lock: self.lock.clone(),
            thread: self.thread,
            action,
        });
        Ok(())
    }

    /// Keep `object` reachable until the transaction is acknowledged
    pub fn retain_reference(&mut self, object: Arc<dyn Any + Send + Sync>) -> Result<()> {
        self.ensure_open()?;
        let key = Arc::as_ptr(&object) as *const () as usize;
        self.retained.entry(key).or_insert(object);
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Whether there is anything to send
    pub fn has_changes_or_notifies(&self) -> bool {
        !self.changes.is_empty()
            || !self.new_roots.is_empty()
            || !self.notifies.is_empty()
            || !self.meta_data.is_empty()
    }

    /// Change buffers in first-touched order
    pub fn changes(&self) -> &[ChangeBuffer] {
        &self.changes
    }

    /// Root bindings made in this transaction
    pub fn new_roots(&self) -> &BTreeMap<String, ObjectId> {
        &self.new_roots
    }

    /// Recorded notifies
    pub fn notifies(&self) -> &[NotifyRecord] {
        &self.notifies
    }

    /// Recorded metadata
    pub fn meta_data(&self) -> &[MetaData] {
        &self.meta_data
    }

    /// Number of distinct retained objects
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    // ========================================================================
    // Sealing
    // ========================================================================

    /// Assign the client-local commit order
    pub fn set_sequence_id(&mut self, id: SequenceId) -> Result<()> {
        if !self.sequence_id.is_null() {
            return Err(ProtocolViolation::SequenceIdReassigned {
                lock: self.lock.clone(),
            }
            .raise());
        }
        self.sequence_id = id;
        Ok(())
    }

    /// Client-local commit order (`NULL` until assigned)
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Assign the transaction id used on the wire
    pub fn set_transaction_id(&mut self, id: TransactionId) -> Result<()> {
        if !self.transaction_id.is_null() {
            return Err(ProtocolViolation::TransactionIdReassigned {
                existing: self.transaction_id,
                attempted: id,
            }
            .raise());
        }
        self.transaction_id = id;
        Ok(())
    }

    /// Transaction id (`NULL` until assigned)
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Seal the transaction
    pub fn mark_committed(&mut self) -> Result<()> {
        if self.committed {
            return Err(ProtocolViolation::DoubleCommit {
                lock: self.lock.clone(),
            }
            .raise());
        }
        self.committed = true;
        Ok(())
    }

    /// Whether the transaction has been sealed
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Serializable form shipped to the server
    pub fn to_record(&self) -> TransactionRecord {
        TransactionRecord {
            transaction_id: self.transaction_id,
            sequence_id: self.sequence_id,
            thread: self.thread,
            lock: self.lock.clone(),
            level: self.level,
            changes: self.changes.clone(),
            new_roots: self.new_roots.clone(),
            notifies: self.notifies.clone(),
            meta_data: self.meta_data.clone(),
        }
    }
}

impl std::fmt::Debug for ClientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransaction")
            .field("thread", &self.thread)
            .field("lock", &self.lock)
            .field("level", &self.level)
            .field("transaction_id", &self.transaction_id)
            .field("changes", &self.changes.len())
            .field("committed", &self.committed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> ClientTransaction {
        ClientTransaction::new(ThreadId::new(1), LockId::new("l"), LockLevel::Write, false)
    }

    #[test]
    fn test_new_transaction_is_empty() {
        let t = txn();
        assert!(!t.has_changes_or_notifies());
        assert!(t.sequence_id().is_null());
        assert!(t.transaction_id().is_null());
        assert!(!t.is_committed());
    }

    #[test]
    fn test_changes_keep_first_touched_order() {
        let mut t = txn();
        t.field_changed(ObjectId::new(9), "a", FieldValue::Int(1)).unwrap();
        t.field_changed(ObjectId::new(2), "b", FieldValue::Int(2)).unwrap();
        t.logical_invoke(ObjectId::new(9), "put", vec![FieldValue::Str("k".into())])
            .unwrap();

        let objects: Vec<u64> = t.changes().iter().map(|c| c.object.as_u64()).collect();
        assert_eq!(objects, vec![9, 2]);
        assert_eq!(t.changes()[0].actions.len(), 2);
    }

    #[test]
    fn test_create_object_marks_new() {
        let mut t = txn();
        t.create_object(ObjectId::new(3), "Account").unwrap();
        assert!(t.changes()[0].is_new());
        assert!(t.has_changes_or_notifies());
    }

    #[test]
    fn test_notify_only_transaction_is_not_empty() {
        let mut t = txn();
        t.add_notify(NotifyAction::All).unwrap();
        assert!(t.has_changes_or_notifies());
        assert_eq!(t.notifies()[0].lock, LockId::new("l"));
    }

    #[test]
    fn test_mutation_after_commit_is_violation() {
        let mut t = txn();
        t.mark_committed().unwrap();
        let err = t.create_root("root", ObjectId::new(1)).unwrap_err();
        assert!(matches!(
            err.as_protocol(),
            Some(ProtocolViolation::MutationAfterCommit { .. })
        ));
        assert!(t.add_notify(NotifyAction::One).unwrap_err().is_fatal());
    }

    #[test]
    fn test_double_commit_is_violation() {
        let mut t = txn();
        t.mark_committed().unwrap();
        let err = t.mark_committed().unwrap_err();
        assert!(matches!(err.as_protocol(), Some(ProtocolViolation::DoubleCommit { .. })));
    }

    #[test]
    fn test_ids_assigned_once() {
        let mut t = txn();
        t.set_sequence_id(SequenceId::new(1)).unwrap();
        assert!(t.set_sequence_id(SequenceId::new(2)).unwrap_err().is_fatal());

        t.set_transaction_id(TransactionId::new(5)).unwrap();
        let err = t.set_transaction_id(TransactionId::new(6)).unwrap_err();
        assert_eq!(
            err.as_protocol(),
            Some(&ProtocolViolation::TransactionIdReassigned {
                existing: TransactionId::new(5),
                attempted: TransactionId::new(6),
            })
        );
        assert_eq!(t.transaction_id(), TransactionId::new(5));
    }

    #[test]
    fn test_retain_reference_by_identity() {
        let mut t = txn();
        let a: Arc<dyn Any + Send + Sync> = Arc::new(String::from("pojo"));
        let b: Arc<dyn Any + Send + Sync> = Arc::new(String::from("pojo"));
        t.retain_reference(Arc::clone(&a)).unwrap();
        t.retain_reference(a).unwrap();
        t.retain_reference(b).unwrap();
        assert_eq!(t.retained_count(), 2);
    }

    #[test]
    fn test_concurrent_derived_from_level() {
        let t = ClientTransaction::new(ThreadId::new(1), LockId::new("l"), LockLevel::Concurrent, false);
        assert!(t.is_concurrent());
        assert!(!txn().is_concurrent());
    }

    #[test]
    fn test_to_record_carries_ids() {
        let mut t = txn();
        t.create_root("root", ObjectId::new(4)).unwrap();
        t.set_sequence_id(SequenceId::new(3)).unwrap();
        t.mark_committed().unwrap();
        t.set_transaction_id(TransactionId::new(8)).unwrap();

        let record = t.to_record();
        assert_eq!(record.transaction_id, TransactionId::new(8));
        assert_eq!(record.sequence_id, SequenceId::new(3));
        assert_eq!(record.new_roots.get("root"), Some(&ObjectId::new(4)));
    }
}
