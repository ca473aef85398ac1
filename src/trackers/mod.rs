//! Per-session event trackers
//!
//! Three trackers of identical shape record console, network, and exception
//! events into bounded rings with monotonic sequence numbers. Consumers
//! either poll with a cursor or subscribe for fan-out delivery; the two paths
//! are independent, so a live subscriber never advances anyone's poll cursor.

mod console;
mod exception;
mod network;
pub mod redact;

pub use console::{ConsoleCategory, ConsoleEvent, console_event_from_cdp};
pub use exception::{ExceptionEvent, exception_event_from_cdp};
pub use network::{NetworkEvent, NetworkPhase, request_event_from_cdp, response_event_from_cdp};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::request_id::now_ms;

/// One recorded event with its tracker-scoped sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedEvent<T> {
    pub seq: u64,
    pub ts: u64,
    pub payload: T,
}

/// Result of a cursor poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollResult<T> {
    pub events: Vec<TrackedEvent<T>>,
    /// Cursor to pass on the next poll.
    pub next_seq: u64,
    /// More events were pending beyond `max`.
    pub truncated: bool,
}

type Listener<T> = Arc<dyn Fn(&TrackedEvent<T>) + Send + Sync>;

struct TrackerInner<T> {
    ring: VecDeque<Arc<TrackedEvent<T>>>,
    capacity: usize,
    next_seq: u64,
    listeners: Vec<(u64, Listener<T>)>,
    next_listener_id: u64,
}

/// Bounded ring of events with poll + subscribe access.
pub struct EventTracker<T> {
    name: &'static str,
    inner: Mutex<TrackerInner<T>>,
}

impl<T: Clone> EventTracker<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(TrackerInner {
                ring: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                next_seq: 0,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an event, dropping the oldest on overflow, then fan out to
    /// subscribers in insertion order.
    ///
    /// Listeners run under the ring lock so concurrent producers cannot
    /// reorder deliveries; a listener must not call back into this tracker.
    pub fn push(&self, payload: T) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let event = Arc::new(TrackedEvent { seq: inner.next_seq, ts: now_ms(), payload });
        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(Arc::clone(&event));
        for (_, listener) in &inner.listeners {
            listener(&event);
        }
        event.seq
    }

    /// Events with `seq > since_seq`, oldest first, at most `max`.
    pub fn poll(&self, since_seq: u64, max: usize) -> PollResult<T> {
        let inner = self.inner.lock();
        let pending: Vec<&Arc<TrackedEvent<T>>> =
            inner.ring.iter().filter(|e| e.seq > since_seq).collect();
        let truncated = pending.len() > max;
        let events: Vec<TrackedEvent<T>> =
            pending.into_iter().take(max).map(|e| (**e).clone()).collect();
        let next_seq = events.last().map(|e| e.seq).unwrap_or(since_seq);
        PollResult { events, next_seq, truncated }
    }

    /// Latest assigned sequence number.
    pub fn latest_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }

    /// Register a listener invoked once per new event, in insertion order.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&TrackedEvent<T>) + Send + Sync + 'static,
    ) -> Subscription<T> {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            inner.listeners.push((id, Arc::new(listener)));
            id
        };
        Subscription { tracker: Arc::downgrade(self), id }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().listeners.retain(|(lid, _)| *lid != id);
    }
}

/// Handle owning a tracker subscription; dropping it unsubscribes.
pub struct Subscription<T> {
    tracker: std::sync::Weak<EventTracker<T>>,
    id: u64,
}

impl<T: Clone> Subscription<T> {
    pub fn unsubscribe(self) {
        // Drop impl does the work.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.inner.lock().listeners.retain(|(lid, _)| *lid != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn seqs_are_strictly_increasing_and_poll_respects_cursor() {
        let tracker = EventTracker::new("test", 10);
        for i in 0..5 {
            tracker.push(i);
        }
        let poll = tracker.poll(2, 100);
        let seqs: Vec<u64> = poll.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(poll.next_seq, 5);
        assert!(!poll.truncated);
    }

    #[test]
    fn poll_reports_truncation() {
        let tracker = EventTracker::new("test", 10);
        for i in 0..6 {
            tracker.push(i);
        }
        let poll = tracker.poll(0, 4);
        assert_eq!(poll.events.len(), 4);
        assert!(poll.truncated);
        assert_eq!(poll.next_seq, 4);

        let rest = tracker.poll(poll.next_seq, 4);
        assert_eq!(rest.events.len(), 2);
        assert!(!rest.truncated);
    }

    #[test]
    fn overflow_drops_oldest() {
        let tracker = EventTracker::new("test", 3);
        for i in 0..5 {
            tracker.push(i);
        }
        let poll = tracker.poll(0, 100);
        let payloads: Vec<i32> = poll.events.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
        // Seqs keep counting even though early events were dropped.
        assert_eq!(poll.events[0].seq, 3);
    }

    #[test]
    fn subscribers_see_each_event_once_in_order() {
        let tracker = Arc::new(EventTracker::new("test", 10));
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = tracker.subscribe(move |e| seen_clone.lock().push(e.payload));

        tracker.push("a");
        tracker.push("b");
        sub.unsubscribe();
        tracker.push("c");

        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn subscribe_does_not_disturb_poll_cursor() {
        let tracker = Arc::new(EventTracker::new("test", 10));
        let _sub = tracker.subscribe(|_| {});
        tracker.push(1);
        tracker.push(2);
        let poll = tracker.poll(0, 100);
        assert_eq!(poll.events.len(), 2);
    }
}
