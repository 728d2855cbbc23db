//! WebSocket fan-out for dashboard and CLI observers.
//!
//! Every state-store write publishes a `{type, data, timestamp}` message on a
//! tokio broadcast channel; each WebSocket connection forwards from its own
//! receiver. A client that lags or disconnects just drops its receiver; the
//! daemon never blocks on a slow consumer.

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use ve_core::WorkUnit;

/// Buffered messages per subscriber before a slow client starts losing them.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Broadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, event_type: &str, data: serde_json::Value) {
        let message = json!({
            "type": event_type,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        // Errors only mean there are currently no subscribers.
        let _ = self.tx.send(message.to_string());
    }

    /// Push a work-unit state change.
    pub fn work_unit_update(&self, unit: &WorkUnit) {
        self.publish(
            "work_unit_update",
            json!({
                "chunk": unit.chunk,
                "status": unit.status.as_str(),
                "phase": unit.phase.as_str(),
                "attention_reason": unit.attention_reason,
            }),
        );
    }

    /// Push an attention-queue change.
    pub fn attention_update(&self, action: &str, chunk: &str, reason: Option<&str>) {
        self.publish(
            "attention_update",
            json!({
                "action": action,
                "chunk": chunk,
                "attention_reason": reason,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        let unit = WorkUnit::new("feature");
        broadcaster.work_unit_update(&unit);

        let raw = rx.recv().await.unwrap();
        let message: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(message["type"], "work_unit_update");
        assert_eq!(message["data"]["chunk"], "feature");
        assert_eq!(message["data"]["status"], "READY");
        assert!(message["timestamp"].is_string());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let broadcaster = Broadcaster::new();
        broadcaster.attention_update("added", "feature", Some("question"));
        assert_eq!(broadcaster.receiver_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_publisher() {
        let broadcaster = Broadcaster::new();
        let rx = broadcaster.subscribe();
        drop(rx);
        for _ in 0..CHANNEL_CAPACITY * 2 {
            broadcaster.attention_update("added", "x", None);
        }
    }
}
