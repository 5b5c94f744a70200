//! Wait / notify carried by transactions, try-lock, disconnect

use crate::common::*;
use std::time::Duration;

fn awards_to(client: &ClientNode, thread: ThreadId) -> usize {
    client
        .responses
        .snapshot()
        .iter()
        .filter(|r| r.is_award_to(client.id, thread))
        .count()
}

fn refusals(client: &ClientNode) -> usize {
    client
        .responses
        .snapshot()
        .iter()
        .filter(|r| matches!(r, LockResponse::Refused { .. }))
        .count()
}

#[test]
fn test_notify_in_transaction_wakes_remote_waiter() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let notifier = cluster.connect(1, TransactionConfig::default());
    let waiter = cluster.connect(2, TransactionConfig::default());
    let lock = LockId::new("cond");
    let t7 = ThreadId::new(7);

    cluster
        .locks
        .lock(lock.clone(), waiter.id, t7, ServerLockLevel::Write)
        .unwrap();
    assert!(waiter.responses.wait_for(WAIT, |r| r.is_award_to(waiter.id, t7)));
    cluster.locks.wait(lock.clone(), waiter.id, t7, None).unwrap();

    assert!(notifier.acquire(1, "cond", LockLevel::Write));
    notifier.write(1, 1, "ready", 1);
    notifier
        .txns
        .notify(ThreadId::new(1), &lock, NotifyAction::All)
        .unwrap();
    notifier.release(1, "cond");

    // the waiter was moved by the applied notify, then awarded on unlock
    let broadcasts = cluster.broadcasts.entries();
    assert_eq!(broadcasts.len(), 1);
    let woken = broadcasts[0].1.contexts_for(&NodeId::Client(waiter.id));
    assert_eq!(woken.len(), 1);
    assert_eq!(woken[0].thread, t7);
    assert_eq!(awards_to(&waiter, t7), 2);
}

#[test]
fn test_try_lock_refused_immediately_and_after_timeout() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let holder = cluster.connect(1, TransactionConfig::default());
    let other = cluster.connect(2, TransactionConfig::default());
    let lock = LockId::new("x");

    assert!(holder.acquire(1, "x", LockLevel::Write));
    cluster
        .locks
        .try_lock(lock.clone(), other.id, ThreadId::new(1), ServerLockLevel::Write, Duration::ZERO)
        .unwrap();
    assert_eq!(refusals(&other), 1);

    cluster
        .locks
        .try_lock(lock.clone(), other.id, ThreadId::new(1), ServerLockLevel::Write, Duration::from_millis(30))
        .unwrap();
    assert!(eventually(|| refusals(&other) == 2));
    holder.release(1, "x");
}

#[test]
fn test_disconnect_releases_locks_to_next_client() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let leaving = cluster.connect(1, TransactionConfig::default());
    let staying = cluster.connect(2, TransactionConfig::default());
    let lock = LockId::new("y");
    let t1 = ThreadId::new(1);

    assert!(leaving.acquire(1, "y", LockLevel::Write));
    cluster
        .locks
        .lock(lock.clone(), staying.id, t1, ServerLockLevel::Write)
        .unwrap();
    assert_eq!(awards_to(&staying, t1), 0);

    cluster.server.client_disconnected(leaving.id).unwrap();
    assert!(staying.responses.wait_for(WAIT, |r| r.is_award_to(staying.id, t1)));
    assert_eq!(cluster.server.connected_clients(), vec![staying.id]);
}
