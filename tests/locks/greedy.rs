//! Greedy holds between clients

use crate::common::*;

fn recalls_of(client: &ClientNode, lock: &LockId) -> usize {
    client
        .responses
        .snapshot()
        .iter()
        .filter(|r| matches!(r, LockResponse::Recall { lock: l, .. } if l == lock))
        .count()
}

#[test]
fn test_greedy_hold_survives_local_release() {
    let cluster = Cluster::new(LockPolicy::Greedy);
    let client = cluster.connect(1, TransactionConfig::default());
    let lock = LockId::new("g");

    assert!(client.acquire(1, "g", LockLevel::Write));
    assert!(client.holds_greedily(&lock));
    client.write(1, 1, "v", 1);
    client.release(1, "g");

    // released locally, still held by the node
    assert!(client.holds_greedily(&lock));
    assert_eq!(cluster.store.field(ObjectId::new(1), "v"), Some(FieldValue::Int(1)));
    assert_eq!(recalls_of(&client, &lock), 0);
}

#[test]
fn test_recall_hands_lock_to_second_client() {
    let cluster = Cluster::new(LockPolicy::Greedy);
    let first = cluster.connect(1, TransactionConfig::default());
    let second = cluster.connect(2, TransactionConfig::default());
    let lock = LockId::new("g");

    assert!(first.acquire(1, "g", LockLevel::Write));
    first.write(1, 1, "owner", 1);
    first.release(1, "g");

    cluster
        .locks
        .lock(lock.clone(), second.id, ThreadId::new(1), ServerLockLevel::Write)
        .unwrap();
    assert!(first
        .responses
        .wait_for(WAIT, |r| matches!(r, LockResponse::Recall { .. })));

    // a further blocked request does not produce a second recall
    cluster
        .locks
        .lock(lock.clone(), ClientId::new(3), ThreadId::new(1), ServerLockLevel::Read)
        .unwrap();
    assert_eq!(recalls_of(&first, &lock), 1);

    cluster
        .locks
        .recall_commit(lock.clone(), first.id, Vec::new())
        .unwrap();
    assert!(second.responses.wait_for(WAIT, |r| r.lock() == &lock
        && (r.is_award_to(second.id, ThreadId::new(1)) || r.is_award_to(second.id, ThreadId::VM))));
    assert!(!first.holds_greedily(&lock));

    second
        .txns
        .begin(ThreadId::new(1), lock.clone(), LockLevel::Write, false, &second.abort)
        .unwrap();
    second.write(1, 1, "owner", 2);
    second.release(1, "g");

    assert_eq!(cluster.store.field(ObjectId::new(1), "owner"), Some(FieldValue::Int(2)));
    assert!(first.send_errors().is_empty());
    assert!(second.send_errors().is_empty());
}
