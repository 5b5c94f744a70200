//! Resend of outstanding batches after a reconnect

use crate::common::*;
use std::sync::Arc;

/// Channel that loses every acknowledgement
struct LostAcks;

impl ClientChannel for LostAcks {
    fn transaction_acknowledged(&self, _: SessionId, _: TransactionId, _: &NodeId) -> Result<()> {
        Ok(())
    }

    fn batch_acknowledged(&self, _: SessionId, _: TxnBatchId, _: &NodeId) -> Result<()> {
        Ok(())
    }
}

fn concurrent_write(client: &ClientNode, object: u64, value: i64) {
    let thread = ThreadId::new(1);
    let lock = LockId::new("counters");
    client
        .txns
        .begin(thread, lock.clone(), LockLevel::Concurrent, false, &client.abort)
        .unwrap();
    client.write(1, object, "v", value);
    client.txns.commit(thread, &lock, None, &client.abort).unwrap();
}

#[test]
fn test_batch_sent_to_stale_session_is_resent() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    // the server moved on to session 2 before the client noticed
    cluster
        .server
        .client_connected(client.id, SessionId::new(2), Arc::new(LostAcks));
    concurrent_write(&client, 1, 7);
    assert_eq!(cluster.server.metrics().stale_batches, 1);
    assert_eq!(client.remote.incomplete_count(), 1);

    client.reconnect(2);
    assert_eq!(client.remote.session(), SessionId::new(2));
    assert_eq!(client.remote.incomplete_count(), 0);
    assert_eq!(cluster.store.field(ObjectId::new(1), "v"), Some(FieldValue::Int(7)));
}

#[test]
fn test_resent_transaction_is_not_applied_twice() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());
    cluster
        .server
        .client_connected(client.id, SessionId::new(1), Arc::new(LostAcks));

    concurrent_write(&client, 1, 1);
    concurrent_write(&client, 2, 2);
    client.remote.flush().unwrap();
    assert_eq!(cluster.store.apply_order().len(), 2);
    assert_eq!(client.remote.incomplete_count(), 2);

    client.reconnect(2);
    let metrics = cluster.server.metrics();
    assert_eq!(metrics.transactions_applied, 2);
    assert_eq!(metrics.duplicates_skipped, 2);
    assert_eq!(cluster.store.apply_order().len(), 2);
    assert_eq!(client.remote.incomplete_count(), 0);
    assert_eq!(client.remote.low_water_mark(), TransactionId::new(3));
}

#[test]
fn test_commits_during_pause_wait_for_resend() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    client.remote.pause();
    concurrent_write(&client, 1, 1);
    assert_eq!(cluster.server.metrics().batches_received, 0);
    assert_eq!(client.remote.open_batch_len(), 1);

    client.reconnect(2);
    assert_eq!(client.remote.incomplete_count(), 0);
    assert_eq!(cluster.store.field(ObjectId::new(1), "v"), Some(FieldValue::Int(1)));
}

#[test]
fn test_failed_apply_mid_batch_is_completed_by_resend() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());
    cluster
        .store
        .fail_once(ServerTransactionId::new(client.id, TransactionId::new(2)));

    // one batch [T1, T2, T3]; the store fails T2
    client.remote.pause();
    for n in 1..=3 {
        concurrent_write(&client, n, n as i64);
    }
    client.reconnect(1);

    assert_eq!(client.send_errors().len(), 1);
    assert_eq!(cluster.server.metrics().apply_failures, 1);
    assert_eq!(cluster.store.field(ObjectId::new(1), "v"), Some(FieldValue::Int(1)));
    assert_eq!(cluster.store.field(ObjectId::new(2), "v"), None);
    assert_eq!(cluster.store.field(ObjectId::new(3), "v"), None);
    // T1 was acknowledged; T2 and T3 stay outstanding in the same batch
    assert_eq!(client.remote.incomplete_count(), 2);
    assert_eq!(client.remote.outstanding_batches(), 1);
    assert_eq!(client.remote.low_water_mark(), TransactionId::new(2));

    client.reconnect(2);
    assert_eq!(client.remote.incomplete_count(), 0);
    assert_eq!(client.remote.outstanding_batches(), 0);
    assert_eq!(client.remote.low_water_mark(), TransactionId::new(4));
    assert_eq!(cluster.server.outstanding_batches(client.id), 0);
    for n in 1..=3 {
        assert_eq!(cluster.store.field(ObjectId::new(n), "v"), Some(FieldValue::Int(n as i64)));
    }

    let metrics = cluster.server.metrics();
    assert_eq!(metrics.transactions_applied, 3);
    assert_eq!(metrics.duplicates_skipped, 0);
    let order: Vec<u64> = cluster
        .store
        .apply_order()
        .iter()
        .map(|(_, stxid)| stxid.transaction.as_u64())
        .collect();
    assert_eq!(order, vec![1, 2, 3]);
    assert_eq!(cluster.server.global().global_low_water_mark(), GlobalTransactionId::new(5));
}
