// ABOUTME: In-process broadcast bus notifying HTTP SSE subscribers of state changes
// ABOUTME: Best-effort fan-out; lagged subscribers are reset by the SSE layer, never replayed

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Per-subscriber buffer. A subscriber that falls further behind than
/// this observes `RecvError::Lagged` and must resubscribe.
pub const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Connected,
    RequestCreated,
    RequestApproved,
    RequestDenied,
    RequestExpired,
    RequestAutoApproved,
    StatsUpdated,
    AppConnected,
    AppRevoked,
    KeyCreated,
    KeyUnlocked,
    KeyDeleted,
    RelaysUpdated,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Connected => "connected",
            Topic::RequestCreated => "request:created",
            Topic::RequestApproved => "request:approved",
            Topic::RequestDenied => "request:denied",
            Topic::RequestExpired => "request:expired",
            Topic::RequestAutoApproved => "request:auto_approved",
            Topic::StatsUpdated => "stats:updated",
            Topic::AppConnected => "app:connected",
            Topic::AppRevoked => "app:revoked",
            Topic::KeyCreated => "key:created",
            Topic::KeyUnlocked => "key:unlocked",
            Topic::KeyDeleted => "key:deleted",
            Topic::RelaysUpdated => "relays:updated",
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: Value,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. A send with no subscribers is
    /// not an error; nobody was listening.
    pub fn publish(&self, topic: Topic, payload: Value) {
        let receivers = self.tx.receiver_count();
        if let Err(e) = self.tx.send(BusMessage { topic, payload }) {
            tracing::trace!("Bus publish with no subscribers: {}", e);
        } else {
            tracing::trace!("Published {} to {} subscriber(s)", topic, receivers);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Topic::KeyCreated, serde_json::json!({"name": "alice"}));

        let m1 = rx1.recv().await.unwrap();
        let m2 = rx2.recv().await.unwrap();
        assert_eq!(m1.topic, Topic::KeyCreated);
        assert_eq!(m2.payload["name"], "alice");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(Topic::StatsUpdated, Value::Null);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..(BUS_CAPACITY + 10) {
            bus.publish(Topic::StatsUpdated, serde_json::json!(i));
        }

        match rx.recv().await {
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::RequestAutoApproved.as_str(), "request:auto_approved");
        assert_eq!(Topic::AppConnected.as_str(), "app:connected");
    }
}
