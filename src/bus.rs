//! In-process sequenced event bus.
//!
//! The bus is the single writer of the process-wide `seq` counter: every
//! published event gets the next sequence number under one critical section,
//! so the global order is total even across threads. Each subscriber owns a
//! bounded mailbox (default 1024); a slow subscriber loses its *oldest*
//! undelivered events, never reordered ones, and never slows the publisher
//! or its peers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::types::{Event, EventKind};

/// Default mailbox depth per subscriber.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1_024;

/// Subscriber-side event selection.
///
/// Both criteria must match when present. The kind prefix matches against the
/// dotted form, so `"run."` selects every run-scoped event.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Dotted-kind prefix, e.g. `"run."` or `"security.blocked"`.
    pub kind_prefix: Option<String>,
    /// Only events correlated to this run.
    pub run_id: Option<Uuid>,
}

impl EventFilter {
    /// Filter that matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter that matches a single run's events.
    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            kind_prefix: None,
            run_id: Some(run_id),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(prefix) = &self.kind_prefix {
            if !event.kind.as_str().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(run_id) = self.run_id {
            if event.run_id != Some(run_id) {
                return false;
            }
        }
        true
    }
}

/// Bounded per-subscriber queue. Pushes never block: on overflow the oldest
/// entry is dropped and the bus lag counter incremented.
struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` if an old event had to be dropped to make room.
    fn push(&self, event: Event, capacity: usize) -> bool {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut dropped = false;
        while queue.len() >= capacity {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Event> {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct SubscriberEntry {
    filter: EventFilter,
    mailbox: Arc<Mailbox>,
}

struct BusState {
    next_seq: u64,
    next_sub_id: u64,
    subscribers: HashMap<u64, SubscriberEntry>,
}

struct BusInner {
    state: Mutex<BusState>,
    capacity: usize,
    lagged: AtomicU64,
}

/// Handle to the process-wide event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Bus with the default mailbox capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX_CAPACITY)
    }

    /// Bus with an explicit per-subscriber mailbox capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    next_seq: 1,
                    next_sub_id: 1,
                    subscribers: HashMap::new(),
                }),
                capacity: capacity.max(1),
                lagged: AtomicU64::new(0),
            }),
        }
    }

    /// Assign the next sequence number, stamp the timestamp, and deliver to
    /// every live subscriber whose filter matches. Returns the full event so
    /// the caller can persist it.
    ///
    /// Delivery happens under the sequencing critical section; mailbox pushes
    /// are non-blocking, so a slow subscriber cannot backpressure this call.
    pub fn publish(
        &self,
        kind: EventKind,
        run_id: Option<Uuid>,
        channel_id: Option<String>,
        payload: serde_json::Value,
    ) -> Event {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let event = Event {
            seq: state.next_seq,
            kind,
            ts: Utc::now(),
            run_id,
            channel_id,
            payload,
        };
        state.next_seq = state.next_seq.saturating_add(1);

        // Prune subscribers whose handle was dropped without unsubscribing.
        state
            .subscribers
            .retain(|_, entry| Arc::strong_count(&entry.mailbox) > 1);

        for (sub_id, entry) in &state.subscribers {
            if entry.filter.matches(&event)
                && entry.mailbox.push(event.clone(), self.inner.capacity)
            {
                self.inner.lagged.fetch_add(1, Ordering::Relaxed);
                debug!(sub_id = *sub_id, seq = event.seq, "subscriber mailbox overflow");
            }
        }

        event
    }

    /// Register a subscriber and return its mailbox handle.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = state.next_sub_id;
        state.next_sub_id = state.next_sub_id.saturating_add(1);
        let mailbox = Arc::new(Mailbox::new());
        state.subscribers.insert(
            id,
            SubscriberEntry {
                filter,
                mailbox: Arc::clone(&mailbox),
            },
        );
        Subscription { id, mailbox }
    }

    /// Remove a subscriber. Its pending mailbox contents are discarded and
    /// any blocked `recv` returns `None`.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut state = match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = state.subscribers.remove(&subscription.id) {
            entry.mailbox.close();
        }
    }

    /// The sequence number the *next* publish will be assigned.
    pub fn next_seq(&self) -> u64 {
        match self.inner.state.lock() {
            Ok(guard) => guard.next_seq,
            Err(poisoned) => poisoned.into_inner().next_seq,
        }
    }

    /// Total events dropped across all subscriber mailboxes.
    pub fn lag_count(&self) -> u64 {
        self.inner.lagged.load(Ordering::Relaxed)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        match self.inner.state.lock() {
            Ok(guard) => guard.subscribers.len(),
            Err(poisoned) => poisoned.into_inner().subscribers.len(),
        }
    }
}

/// Opaque subscriber handle. Dropping it lazily deregisters the subscriber;
/// call [`EventBus::unsubscribe`] for prompt removal.
pub struct Subscription {
    id: u64,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Await the next matching event. Returns `None` once unsubscribed.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.mailbox.pop() {
                return Some(event);
            }
            if self.mailbox.closed.load(Ordering::Acquire) {
                return None;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<Event> {
        self.mailbox.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u64) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[tokio::test]
    async fn test_publish_assigns_monotonic_seq() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all());

        let first = bus.publish(EventKind::RunProgress, None, None, payload(1));
        let second = bus.publish(EventKind::RunProgress, None, None, payload(2));
        assert!(second.seq > first.seq);

        let got = sub.recv().await.expect("event");
        assert_eq!(got.seq, first.seq);
        let got = sub.recv().await.expect("event");
        assert_eq!(got.seq, second.seq);
    }

    #[tokio::test]
    async fn test_filter_by_kind_prefix() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter {
            kind_prefix: Some("run.".to_owned()),
            run_id: None,
        });

        bus.publish(EventKind::ChannelStatus, None, Some("wc".to_owned()), payload(1));
        bus.publish(EventKind::RunOutput, None, None, payload(2));

        let got = sub.recv().await.expect("event");
        assert_eq!(got.kind, EventKind::RunOutput);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filter_by_run_id() {
        let bus = EventBus::new();
        let run = Uuid::new_v4();
        let other = Uuid::new_v4();
        let sub = bus.subscribe(EventFilter::for_run(run));

        bus.publish(EventKind::RunProgress, Some(other), None, payload(1));
        bus.publish(EventKind::RunProgress, Some(run), None, payload(2));

        let got = sub.recv().await.expect("event");
        assert_eq!(got.run_id, Some(run));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_contiguous() {
        let bus = EventBus::with_capacity(4);
        let sub = bus.subscribe(EventFilter::all());

        for n in 0..10 {
            bus.publish(EventKind::RunProgress, None, None, payload(n));
        }

        // The four newest survive; the drop is a contiguous prefix.
        let mut seqs = Vec::new();
        while let Some(event) = sub.try_recv() {
            seqs.push(event.seq);
        }
        assert_eq!(seqs.len(), 4);
        for pair in seqs.windows(2) {
            assert_eq!(pair[1], pair[0].saturating_add(1));
        }
        assert_eq!(bus.lag_count(), 6);
    }

    #[tokio::test]
    async fn test_overflow_does_not_affect_other_subscribers() {
        let bus = EventBus::with_capacity(4);
        let slow = bus.subscribe(EventFilter::all());
        let fast = bus.subscribe(EventFilter::all());

        let mut received = 0_u32;
        for n in 0..8 {
            bus.publish(EventKind::RunProgress, None, None, payload(n));
            if fast.try_recv().is_some() {
                received = received.saturating_add(1);
            }
        }
        assert_eq!(received, 8, "fast subscriber must see every event");

        let mut slow_count = 0_u32;
        while slow.try_recv().is_some() {
            slow_count = slow_count.saturating_add(1);
        }
        assert_eq!(slow_count, 4);
    }

    #[tokio::test]
    async fn test_unsubscribe_wakes_receiver() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all());

        let bus2 = bus.clone();
        let handle = tokio::spawn(async move {
            // Give recv a moment to park.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            bus2.publish(EventKind::RunProgress, None, None, payload(1));
        });

        assert!(sub.recv().await.is_some());
        handle.await.expect("task");

        bus.unsubscribe(&sub);
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(EventFilter::all());
        drop(sub);
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(EventKind::RunProgress, None, None, payload(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_returns_event_for_persistence() {
        let bus = EventBus::new();
        let run = Uuid::new_v4();
        let event = bus.publish(
            EventKind::RunCompleted,
            Some(run),
            None,
            serde_json::json!({ "status": "completed" }),
        );
        assert_eq!(event.run_id, Some(run));
        assert_eq!(event.kind, EventKind::RunCompleted);
        assert_eq!(event.payload["status"], "completed");
    }
}
