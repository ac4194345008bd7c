// appinapp-core/src/event.rs
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::{read, write};

/// Topic of the full instance-list broadcast.
pub const WIDGETS_UPDATE: &str = "widgets.update";

/// Topic of hot-reload notices, one per changed bundle type.
pub const WIDGETS_RELOAD: &str = "widgets.reload";

/// Event payload - can be any type
#[derive(Clone)]
pub struct EventPayload(Arc<dyn Any + Send + Sync>);

impl EventPayload {
    pub fn new<T: Any + Send + Sync>(data: T) -> Self {
        Self(Arc::new(data))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::downcast(self.0.clone()).ok()
    }
}

/// Event with topic and payload
#[derive(Clone)]
pub struct Event {
    pub topic: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new<T: Any + Send + Sync>(topic: impl Into<String>, data: T) -> Self {
        Self {
            topic: topic.into(),
            payload: EventPayload::new(data),
        }
    }
}

/// Subscription handle - dropping this unsubscribes
pub struct Subscription {
    id: usize,
    bus: Arc<EventBusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        write(&self.bus.subscriptions).remove(&self.id);
    }
}

struct EventBusInner {
    subscriptions: std::sync::RwLock<HashMap<usize, (String, Sender<Event>)>>,
    next_id: AtomicUsize,
}

/// Topic-based pub/sub between the registry and every listening window
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscriptions: std::sync::RwLock::new(HashMap::new()),
                next_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Publish an event to all matching subscribers
    pub fn publish(&self, event: Event) {
        let subs = read(&self.inner.subscriptions);

        for (pattern, tx) in subs.values() {
            if Self::topic_matches(&event.topic, pattern) {
                // Ignore send errors (subscriber dropped)
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Subscribe to topics with wildcard support
    /// Returns (Subscription, Receiver) - drop Subscription to unsubscribe
    pub fn subscribe(&self, pattern: impl Into<String>) -> (Subscription, Receiver<Event>) {
        let (tx, rx) = unbounded();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        write(&self.inner.subscriptions).insert(id, (pattern.into(), tx));

        let sub = Subscription {
            id,
            bus: self.inner.clone(),
        };

        (sub, rx)
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        read(&self.inner.subscriptions).len()
    }

    /// Check if topic matches pattern (supports * wildcard)
    fn topic_matches(topic: &str, pattern: &str) -> bool {
        if topic == pattern {
            return true;
        }

        let topic_parts: Vec<&str> = topic.split('.').collect();
        let pattern_parts: Vec<&str> = pattern.split('.').collect();

        if pattern_parts.len() > topic_parts.len() {
            return false;
        }

        for (i, pattern_part) in pattern_parts.iter().enumerate() {
            if *pattern_part == "*" {
                // Wildcard at end matches everything remaining
                if i == pattern_parts.len() - 1 {
                    return true;
                }
                continue;
            }

            if topic_parts[i] != *pattern_part {
                return false;
            }
        }

        pattern_parts.len() == topic_parts.len()
    }
}

/// Payload of [`WIDGETS_RELOAD`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleChanged {
    pub widget_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(EventBus::topic_matches(WIDGETS_UPDATE, "widgets.update"));
        assert!(EventBus::topic_matches(WIDGETS_UPDATE, "widgets.*"));
        assert!(EventBus::topic_matches("widgets.reload.clock", "widgets.*"));
        assert!(EventBus::topic_matches("widgets.update", "*.update"));
        assert!(!EventBus::topic_matches("control.stats", "widgets.*"));
        assert!(EventBus::topic_matches("any.thing.here", "*"));
    }

    #[test]
    fn test_pubsub() {
        let bus = EventBus::new();
        let (_sub, rx) = bus.subscribe("widgets.*");

        bus.publish(Event::new(
            WIDGETS_RELOAD,
            BundleChanged {
                widget_type: "Clock".into(),
            },
        ));

        let event = rx.recv().unwrap();
        assert_eq!(event.topic, WIDGETS_RELOAD);

        let received: Arc<BundleChanged> = event.payload.downcast().unwrap();
        assert_eq!(received.widget_type, "Clock");
        assert!(event.payload.downcast::<String>().is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (sub, rx) = bus.subscribe("test");
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(Event::new("test", 42));
        assert!(rx.recv().is_ok());

        drop(sub); // Unsubscribe
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(Event::new("test", 43));
        assert!(rx.recv().is_err()); // Channel closed
    }
}
