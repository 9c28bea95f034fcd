//! Event bus behavior at the mailbox boundary.

use agentgate::bus::{EventBus, EventFilter};
use agentgate::types::EventKind;

#[tokio::test]
async fn test_slow_subscriber_overflow_is_isolated() {
    let capacity = 8_usize;
    let bus = EventBus::with_capacity(capacity);
    let slow = bus.subscribe(EventFilter::all());
    let fast = bus.subscribe(EventFilter::all());

    // Publish twice the queue size without letting `slow` read anything,
    // draining `fast` as we go.
    let total = capacity.saturating_mul(2);
    let mut fast_seen = 0_usize;
    for n in 0..total {
        bus.publish(
            EventKind::RunProgress,
            None,
            None,
            serde_json::json!({ "n": n }),
        );
        if fast.try_recv().is_some() {
            fast_seen = fast_seen.saturating_add(1);
        }
    }

    // The overflow counter moved, and the fast subscriber missed nothing.
    assert!(bus.lag_count() >= 1);
    assert_eq!(fast_seen, total);

    // The slow subscriber lost a contiguous prefix: what remains is exactly
    // the newest `capacity` events, in order, strictly increasing.
    let mut seqs = Vec::new();
    while let Some(event) = slow.try_recv() {
        seqs.push(event.seq);
    }
    assert_eq!(seqs.len(), capacity);
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0].saturating_add(1));
    }
}

#[tokio::test]
async fn test_seq_is_globally_monotonic_across_publishers() {
    let bus = EventBus::new();
    let sub = bus.subscribe(EventFilter::all());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..50 {
                bus.publish(EventKind::RunProgress, None, None, serde_json::json!({}));
            }
        }));
    }
    for handle in handles {
        handle.await.expect("publisher task");
    }

    let mut last = 0_u64;
    let mut count = 0_u32;
    while let Some(event) = sub.try_recv() {
        assert!(event.seq > last, "seq must strictly increase per subscriber");
        last = event.seq;
        count = count.saturating_add(1);
    }
    assert_eq!(count, 200);
}
