//! Publish/subscribe event bus.
//!
//! A closed set of channel names, pattern subscriptions (`*`, exact, or
//! `prefix:*`), and one bounded inbox per subscriber. Publishing never
//! blocks: a saturated inbox drops its oldest event and counts the drop.
//! Events are ephemeral; late subscribers see only what is published after
//! they subscribe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

/// The channel catalog. Publishers use these constants; arbitrary channel
/// strings are not part of the contract.
pub mod channels {
    pub const SESSION_STARTED: &str = "session:started";
    pub const SESSION_ENDED: &str = "session:ended";
    pub const TASK_QUEUED: &str = "task:queued";
    pub const TASK_ASSIGNED: &str = "task:assigned";
    pub const TASK_PROGRESS: &str = "task:progress";
    pub const TASK_COMPLETED: &str = "task:completed";
    pub const TASK_FAILED: &str = "task:failed";
    pub const TASK_CANCELLED: &str = "task:cancelled";
    pub const WORKER_CONNECTED: &str = "worker:connected";
    pub const WORKER_DISCONNECTED: &str = "worker:disconnected";
    pub const WRITER_PAUSE: &str = "writer:pause";
    pub const WRITER_RESUME: &str = "writer:resume";
    pub const DOC_READY: &str = "doc:ready";
}

/// One published event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub channel: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Monotonic publish sequence number, bus-wide.
    pub seq: u64,
}

/// Does `pattern` match `channel`?
///
/// `*` matches everything; `prefix:*` matches channels beginning with
/// `prefix:`; anything else is an exact match. No other globbing.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("*") {
        if prefix.ends_with(':') {
            return channel.starts_with(prefix);
        }
    }
    pattern == channel
}

struct Inbox {
    queue: Mutex<InboxState>,
    notify: Notify,
    capacity: usize,
}

struct InboxState {
    events: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

struct SubscriberEntry {
    id: u64,
    patterns: Vec<String>,
    inbox: Arc<Inbox>,
}

/// The bus. Cheap to clone behind an `Arc`; one per process.
pub struct EventBus {
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
    seq: AtomicU64,
    inbox_capacity: usize,
}

impl EventBus {
    /// Default per-subscriber inbox bound.
    pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

    pub fn new(inbox_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
            inbox_capacity,
        })
    }

    /// Publish an event to every subscriber whose patterns match.
    /// Never blocks; a full inbox drops its oldest event.
    pub fn publish(&self, channel: &str, payload: serde_json::Value) {
        let event = Event {
            channel: channel.to_owned(),
            payload,
            timestamp: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        for sub in subscribers.iter() {
            if !sub.patterns.iter().any(|p| pattern_matches(p, channel)) {
                continue;
            }
            let mut state = sub.inbox.queue.lock().expect("inbox lock poisoned");
            if state.closed {
                continue;
            }
            if state.events.len() >= sub.inbox.capacity {
                state.events.pop_front();
                state.dropped += 1;
            }
            state.events.push_back(event.clone());
            drop(state);
            sub.inbox.notify.notify_one();
        }
    }

    /// Subscribe with a set of patterns. The returned handle unsubscribes
    /// on drop.
    pub fn subscribe(self: &Arc<Self>, patterns: Vec<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox {
            queue: Mutex::new(InboxState {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: self.inbox_capacity,
        });
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(SubscriberEntry {
                id,
                patterns,
                inbox: Arc::clone(&inbox),
            });
        Subscription {
            id,
            bus: Arc::clone(self),
            inbox,
        }
    }

    /// Current number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus lock poisoned").len()
    }

    fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            let entry = subscribers.swap_remove(pos);
            let mut state = entry.inbox.queue.lock().expect("inbox lock poisoned");
            state.closed = true;
            state.events.clear();
            drop(state);
            entry.inbox.notify.notify_waiters();
        }
    }
}

/// A live subscription. Dropping it detaches from the bus.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBus>,
    inbox: Arc<Inbox>,
}

impl Subscription {
    /// Receive the next matching event, waiting if the inbox is empty.
    /// Returns `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut state = self.inbox.queue.lock().expect("inbox lock poisoned");
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.inbox.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.inbox
            .queue
            .lock()
            .expect("inbox lock poisoned")
            .events
            .pop_front()
    }

    /// How many events this subscriber has lost to inbox overflow.
    pub fn dropped(&self) -> u64 {
        self.inbox.queue.lock().expect("inbox lock poisoned").dropped
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_matching() {
        assert!(pattern_matches("*", "task:completed"));
        assert!(pattern_matches("task:completed", "task:completed"));
        assert!(pattern_matches("task:*", "task:completed"));
        assert!(pattern_matches("task:*", "task:queued"));
        assert!(!pattern_matches("task:*", "worker:connected"));
        assert!(!pattern_matches("task:completed", "task:queued"));
        // Only the `prefix:*` glob form is supported.
        assert!(!pattern_matches("task*", "task:queued"));
        assert!(!pattern_matches("ta*:queued", "task:queued"));
    }

    #[tokio::test]
    async fn fan_out_respects_patterns() {
        let bus = EventBus::new(16);
        let mut task_sub = bus.subscribe(vec!["task:*".into()]);
        let mut worker_sub = bus.subscribe(vec!["worker:*".into()]);

        bus.publish(channels::TASK_COMPLETED, json!({"task_id": "t1"}));
        bus.publish(channels::WORKER_CONNECTED, json!({"worker_id": "w1"}));

        let e = task_sub.recv().await.unwrap();
        assert_eq!(e.channel, "task:completed");
        assert!(task_sub.try_recv().is_none());

        let e = worker_sub.recv().await.unwrap();
        assert_eq!(e.channel, "worker:connected");
        assert!(worker_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn delivery_is_exactly_once_per_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(vec!["*".into()]);
        bus.publish(channels::TASK_QUEUED, json!({"n": 1}));
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(vec!["*".into()]);
        for n in 0..5 {
            bus.publish(channels::TASK_QUEUED, json!({ "n": n }));
        }
        assert_eq!(sub.dropped(), 3);
        // The two newest survive.
        assert_eq!(sub.recv().await.unwrap().payload["n"], 3);
        assert_eq!(sub.recv().await.unwrap().payload["n"], 4);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn late_subscriber_sees_nothing_old() {
        let bus = EventBus::new(16);
        bus.publish(channels::DOC_READY, json!({}));
        let mut sub = bus.subscribe(vec!["*".into()]);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(vec!["*".into()]);
        bus.publish(channels::TASK_QUEUED, json!({}));
        bus.publish(channels::TASK_QUEUED, json!({}));
        let a = sub.recv().await.unwrap();
        let b = sub.recv().await.unwrap();
        assert!(b.seq > a.seq);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(vec!["*".into()]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
