use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Metadata carried by every event: when it happened, a monotonically increasing
/// id local to this bus, and an optional correlation id for tying events from
/// different components back to one run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    pub id: u64,
    pub correlation_id: Option<String>,
}

/// A tagged-union event. `kind` is the stable type tag consumers dispatch on;
/// `payload` carries the type-specific data as JSON so the bus stays decoupled
/// from any one component's internal structs (mirrors the design note's
/// "tagged union" guidance for what would otherwise be an event class hierarchy).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub kind: String,
    pub payload: Value,
    pub metadata: EventMetadata,
}

impl Event {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// In-process publish/subscribe bus. Delivery is ordered per publisher (events
/// from one `Publisher` handle arrive to every subscriber in the order they were
/// published) but no ordering is guaranteed across distinct publishers.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(EventBus {
            sender,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Construct a `Publisher` bound to a correlation id (typically a run id),
    /// so every event it emits can be traced back to one execution.
    pub fn publisher(self: &Arc<Self>, correlation_id: impl Into<String>) -> Publisher {
        Publisher {
            bus: Arc::clone(self),
            correlation_id: correlation_id.into(),
        }
    }

    fn publish(&self, kind: &str, payload: Value, correlation_id: &str) {
        let event = Event {
            kind: kind.to_string(),
            payload,
            metadata: EventMetadata {
                timestamp: Utc::now(),
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                correlation_id: Some(correlation_id.to_string()),
            },
        };
        // A broadcast channel with no live receivers returns an error; that's
        // expected (nobody is listening yet) and not a failure of the publish.
        let _ = self.sender.send(event);
    }
}

/// The capability a component depends on to emit events, rather than depending
/// on a concrete `EventBus` or reaching for a module-level singleton.
pub trait EventPublisher {
    fn emit(&self, kind: &str, payload: Value);
}

#[derive(Clone)]
pub struct Publisher {
    bus: Arc<EventBus>,
    correlation_id: String,
}

impl EventPublisher for Publisher {
    fn emit(&self, kind: &str, payload: Value) {
        self.bus.publish(kind, payload, &self.correlation_id);
    }
}
