//! Many clients incrementing one counter

use crate::common::*;
use std::sync::{Arc, Barrier};
use std::thread;

const CLIENTS: u64 = 4;
const ROUNDS: i64 = 20;

fn counter(cluster: &Cluster) -> i64 {
    match cluster.store.field(ObjectId::new(1), "count") {
        Some(FieldValue::Int(n)) => n,
        _ => 0,
    }
}

fn run_contention(policy: LockPolicy) -> Cluster {
    let cluster = Arc::new(Cluster::new(policy));
    let barrier = Arc::new(Barrier::new(CLIENTS as usize));

    let handles: Vec<_> = (1..=CLIENTS)
        .map(|id| {
            let cluster = Arc::clone(&cluster);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let client = cluster.connect(id, TransactionConfig::default());
                barrier.wait();
                for _ in 0..ROUNDS {
                    assert!(client.acquire(1, "counter", LockLevel::Write));
                    let next = counter(&cluster) + 1;
                    client.write(1, 1, "count", next);
                    client.release(1, "counter");
                }
                assert!(client.send_errors().is_empty());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    match Arc::try_unwrap(cluster) {
        Ok(cluster) => cluster,
        Err(_) => panic!("cluster still shared"),
    }
}

#[test]
fn test_counter_is_exact_under_contention() {
    let cluster = run_contention(LockPolicy::NonGreedy);
    assert_eq!(counter(&cluster), CLIENTS as i64 * ROUNDS);
    assert_eq!(cluster.server.metrics().transactions_applied, CLIENTS * ROUNDS as u64);
}

#[test]
fn test_apply_order_matches_global_ids() {
    let cluster = run_contention(LockPolicy::NonGreedy);
    let order = cluster.store.apply_order();
    assert_eq!(order.len(), (CLIENTS * ROUNDS as u64) as usize);
    for (i, (global_id, _)) in order.iter().enumerate() {
        assert_eq!(*global_id, GlobalTransactionId::new(i as u64 + 1));
    }
}
