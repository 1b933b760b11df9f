//! Event bus for lifecycle transitions.
//!
//! Every committed state transition is published as an [`Event`]. Each
//! subscriber owns a bounded buffer; publishing never waits. When a buffer is
//! full the event is dropped for that subscriber only and counted.

use crate::state::{TransitionEvent, UnitId, UnitState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

/// Default per-subscriber buffer size.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// A committed lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub unit_id: UnitId,
    pub event: TransitionEvent,
    pub from: UnitState,
    pub to: UnitState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Stream handed to subscribers. Ends when the bus is closed.
pub type EventStream = ReceiverStream<Event>;

struct BusInner {
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
    buffer: usize,
    dropped: AtomicU64,
}

/// Cloneable handle to one run's event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                buffer: buffer.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new subscriber. Only events published afterwards are seen.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.subscribers().push(tx);
        ReceiverStream::new(rx)
    }

    /// Deliver an event to every live subscriber without blocking.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    unit = %event.unit_id,
                    dropped_total = total,
                    "Event subscriber buffer full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Number of events dropped because a subscriber was too slow.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    /// Detach all subscribers; their streams end once drained.
    pub fn close(&self) {
        self.subscribers().clear();
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<Event>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffer", &self.inner.buffer)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn event(unit: &str, from: UnitState, to: UnitState) -> Event {
        Event {
            unit_id: UnitId::from(unit),
            event: TransitionEvent::Unblock,
            from,
            to,
            timestamp: Utc::now(),
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();

        bus.publish(event("a", UnitState::Pending, UnitState::Ready));
        bus.publish(event("a", UnitState::Ready, UnitState::Running));
        bus.close();

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.to, UnitState::Ready);
        assert_eq!(second.to, UnitState::Running);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_others() {
        let bus = EventBus::new(1);
        let _slow = bus.subscribe();
        let mut fast = bus.subscribe();

        bus.publish(event("a", UnitState::Pending, UnitState::Ready));
        assert_eq!(fast.next().await.unwrap().unit_id.as_str(), "a");

        bus.publish(event("b", UnitState::Pending, UnitState::Ready));
        assert_eq!(fast.next().await.unwrap().unit_id.as_str(), "b");

        // The slow subscriber's single slot was taken by "a"
        assert_eq!(bus.dropped(), 1);
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let stream = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(stream);
        bus.publish(event("a", UnitState::Pending, UnitState::Ready));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(event("a", UnitState::Pending, UnitState::Ready));
        assert_eq!(bus.dropped(), 0);
    }

    #[test]
    fn test_event_serializes_states() {
        let json = serde_json::to_value(event("01", UnitState::Ready, UnitState::Running)).unwrap();
        assert_eq!(json["from"], "ready");
        assert_eq!(json["to"], "running");
        assert_eq!(json["event"], "unblock");
        assert!(json.get("payload").is_none());
    }
}
