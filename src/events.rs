//! In-process event bus
//!
//! The backends publish container lifecycle events here. Publishing never
//! blocks: each subscriber owns a bounded queue and events for a full queue
//! are dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

pub const CONTAINER_STARTED: &str = "container.started";
pub const CONTAINER_STOPPED: &str = "container.stopped";

/// Queue length of a subscriber created through [`EventBus::subscribe`]
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub fields: BTreeMap<String, String>,
}

impl Event {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver an event to every subscriber that has room for it
    pub fn publish(&self, event_type: &str, fields: BTreeMap<String, String>) {
        let event = Event {
            event_type: event_type.to_string(),
            fields,
        };
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(event_type, "Subscriber queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Publish a container lifecycle event for `app_id`
    pub fn publish_container_event(&self, running: bool, app_id: &str) {
        let event_type = if running {
            CONTAINER_STARTED
        } else {
            CONTAINER_STOPPED
        };
        self.publish(
            event_type,
            BTreeMap::from([("app_id".to_string(), app_id.to_string())]),
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish_container_event(true, "app1");

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, CONTAINER_STARTED);
            assert_eq!(event.field("app_id"), Some("app1"));
        }
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_with_capacity(1);
        bus.publish_container_event(true, "first");
        bus.publish_container_event(false, "second");

        assert_eq!(rx.recv().await.unwrap().field("app_id"), Some("first"));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_subscribers_are_removed() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(CONTAINER_STOPPED, BTreeMap::new());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
