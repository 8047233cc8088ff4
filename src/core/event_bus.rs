//! In-process broadcast of content events.
//!
//! Publishing never blocks and never fails: with no subscribers the event is
//! dropped. Each subscriber sees events in publish order.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::{ContentEvent, ContentEventKind};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out channel for [`ContentEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ContentEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Bus buffering up to `capacity` events per slow subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, operation_id: Uuid, kind: ContentEventKind) {
        // Err only means nobody is listening
        let _ = self.sender.send(ContentEvent::new(operation_id, kind));
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let op = Uuid::new_v4();

        for current in 0..=2 {
            bus.publish(op, ContentEventKind::ImportProgress { current, total: 2 });
        }

        for expected in 0..=2 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.operation_id, op);
            assert_eq!(
                event.kind,
                ContentEventKind::ImportProgress {
                    current: expected,
                    total: 2
                }
            );
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::with_capacity(0);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(
            Uuid::new_v4(),
            ContentEventKind::ContentDeleted {
                identifier: "do_1".to_string(),
            },
        );
    }
}
