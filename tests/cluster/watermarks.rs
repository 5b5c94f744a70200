//! Watermark publication and history retirement

use crate::common::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tessera::engine::PublishedWatermark;
use tessera::LowWaterMarkListener;

#[derive(Default)]
struct Published(Mutex<Vec<PublishedWatermark>>);

impl LowWaterMarkListener for Published {
    fn watermark_published(&self, watermark: &PublishedWatermark) {
        self.0.lock().push(watermark.clone());
    }
}

#[test]
fn test_watermarks_advance_with_commits() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let published = Arc::new(Published::default());
    cluster.server.add_watermark_listener(published.clone());
    let client = cluster.connect(1, TransactionConfig::default());

    for n in 1..=5 {
        assert!(client.acquire(1, "l", LockLevel::Write));
        client.write(1, 1, "n", n);
        client.release(1, "l");
    }

    let marks = published.0.lock().clone();
    assert_eq!(marks.len(), 5);
    assert!(marks
        .windows(2)
        .all(|w| w[0].global_low_water_mark < w[1].global_low_water_mark));
    let last = marks.last().unwrap();
    assert_eq!(last.client, client.id);
    assert_eq!(last.global_low_water_mark, GlobalTransactionId::new(6));
    assert_eq!(last.transaction_low_water_mark, TransactionId::new(5));
}

#[test]
fn test_acknowledged_history_is_retired() {
    let cluster = Cluster::new(LockPolicy::NonGreedy);
    let client = cluster.connect(1, TransactionConfig::default());

    for n in 1..=6 {
        assert!(client.acquire(1, "l", LockLevel::Write));
        client.write(1, 1, "n", n);
        client.release(1, "l");
    }
    // each batch retires what its low-water-mark says the client has seen acked
    assert_eq!(cluster.server.global().record_count(), 1);
    assert_eq!(cluster.server.global().last_issued(), GlobalTransactionId::new(6));
}
