//! Commit → apply → acknowledge round trips

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn test_commit_is_applied_and_acknowledged() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    assert!(client.acquire(1, "account", LockLevel::Write));
    client.write(1, 10, "balance", 100);
    let id = client.release(1, "account");

    assert_eq!(id, Some(TransactionId::new(1)));
    assert_eq!(cluster.store.field(ObjectId::new(10), "balance"), Some(FieldValue::Int(100)));
    assert_eq!(client.remote.incomplete_count(), 0);
    assert_eq!(client.remote.low_water_mark(), TransactionId::new(2));
    assert!(client.send_errors().is_empty());
}

#[test]
fn test_four_transactions_advance_low_water_mark() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    for n in 1..=4 {
        assert!(client.acquire(1, "l", LockLevel::Write));
        client.write(1, 1, "n", n);
        client.release(1, "l");
        assert_eq!(client.remote.low_water_mark(), TransactionId::new(n as u64 + 1));
    }
    assert_eq!(cluster.store.field(ObjectId::new(1), "n"), Some(FieldValue::Int(4)));
    assert_eq!(cluster.server.client_low_water_mark(client.id), Some(TransactionId::new(4)));
}

#[test]
fn test_empty_scope_sends_nothing() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    assert!(client.acquire(1, "l", LockLevel::Read));
    assert_eq!(client.release(1, "l"), None);
    assert_eq!(cluster.server.metrics().batches_received, 0);
}

#[test]
fn test_write_under_read_lock_is_rejected() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    assert!(client.acquire(1, "l", LockLevel::Read));
    let err = client
        .txns
        .field_changed(ThreadId::new(1), ObjectId::new(1), "x", FieldValue::Int(1))
        .unwrap_err();
    assert!(matches!(err, TesseraError::ReadOnlyAccess { .. }));
    assert!(!err.is_fatal());
    client.release(1, "l");
}

#[test]
fn test_nested_scopes_apply_in_commit_order() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    assert!(client.acquire(1, "outer", LockLevel::Write));
    client.write(1, 1, "stage", 1);
    assert!(client.acquire(1, "inner", LockLevel::Write));
    client.write(1, 2, "stage", 2);
    client.release(1, "inner");
    client.write(1, 1, "stage", 3);
    client.release(1, "outer");

    let order: Vec<u64> = cluster
        .store
        .apply_order()
        .iter()
        .map(|(_, stxid)| stxid.transaction.as_u64())
        .collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(cluster.store.field(ObjectId::new(1), "stage"), Some(FieldValue::Int(3)));
}

#[test]
fn test_atomic_commit_callback_runs_after_ack() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());
    let thread = ThreadId::new(1);
    let lock = LockId::new("atomic");

    cluster
        .locks
        .lock(lock.clone(), client.id, thread, ServerLockLevel::Write)
        .unwrap();
    assert!(client
        .responses
        .wait_for(WAIT, |r| r.is_award_to(client.id, thread)));

    client
        .txns
        .begin(thread, lock.clone(), LockLevel::Write, true, &client.abort)
        .unwrap();
    client.write(1, 5, "v", 1);

    let acknowledged = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&acknowledged);
    let remote = Arc::clone(&client.remote);
    client
        .txns
        .commit(
            thread,
            &lock,
            Some(Box::new(move || flag.store(remote.incomplete_count() == 0, Ordering::SeqCst))),
            &client.abort,
        )
        .unwrap();

    assert!(acknowledged.load(Ordering::SeqCst));
    cluster.locks.unlock(lock, client.id, thread).unwrap();
}

#[test]
fn test_roots_and_new_objects_reach_the_store() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());
    let thread = ThreadId::new(1);

    assert!(client.acquire(1, "roots", LockLevel::Write));
    client
        .txns
        .create_object(thread, ObjectId::new(42), "Ledger")
        .unwrap();
    client
        .txns
        .create_root(thread, "ledger", ObjectId::new(42))
        .unwrap();
    client.release(1, "roots");

    assert_eq!(cluster.store.root("ledger"), Some(ObjectId::new(42)));
}
