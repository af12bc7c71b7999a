//! In-process message bus.
//!
//! Commands published over HTTP and status events emitted by the scheduler
//! share one broadcast channel. Slow subscribers lag and lose messages rather
//! than stall the publisher.

use serde::Serialize;
use skill_core::messages::{Message, StatusEvent};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Default number of buffered messages per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a message to every current subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, msg: Message) -> usize {
        debug!(event = %msg.msg_type, "bus emit");
        // No subscribers is not an error.
        self.tx.send(msg).unwrap_or(0)
    }

    /// Publish a status event with a serialized payload.
    pub fn emit_status<T: Serialize>(&self, event: StatusEvent, payload: &T) -> usize {
        match Message::with_payload(event.as_str(), payload) {
            Ok(msg) => self.emit(msg),
            Err(e) => {
                error!(event = event.as_str(), error = %e, "failed to serialize payload");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skill_core::messages::LocksRemovedPayload;

    #[tokio::test]
    async fn subscribers_receive_emitted_messages() {
        let bus = MessageBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let delivered = bus.emit(Message::new("skillmanager.update", json!({})));
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap().msg_type, "skillmanager.update");
        assert_eq!(rx2.recv().await.unwrap().msg_type, "skillmanager.update");
    }

    #[test]
    fn emit_without_subscribers_is_not_an_error() {
        let bus = MessageBus::default();
        assert_eq!(bus.emit(Message::new("skillmanager.list", json!(null))), 0);
    }

    #[tokio::test]
    async fn emit_status_serializes_payload() {
        let bus = MessageBus::default();
        let mut rx = bus.subscribe();

        bus.emit_status(
            StatusEvent::LocksRemoved,
            &LocksRemovedPayload {
                paths: vec!["/skills/a/.git/index.lock".to_string()],
            },
        );

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.msg_type, "skillmanager.locks.removed");
        assert_eq!(msg.data["paths"][0], "/skills/a/.git/index.lock");
    }
}
