use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::db::devices::Device;
use crate::db::flows::NetworkFlow;
use crate::db::threats::Threat;
use crate::error::Error;

/// Typed events published by the core services.
///
/// Delivery is best-effort and unordered across kinds; a subscriber that
/// cannot keep up lags and loses events rather than stalling a publisher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FlowUpdate { flow: NetworkFlow },
    DeviceUpdate { device: Device },
    ThreatUpdate { threat: Threat },
}

/// Broadcast hub connecting the core to outward-facing consumers.
///
/// Components publish typed events; the (out-of-scope) WebSocket layer and
/// tests subscribe. Nothing in the core holds a pointer back to a subscriber.
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self { tx })
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event to every current subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            // No receivers connected; the event is dropped by design.
            trace!("{}", Error::Subscriber(e.to_string()));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::threats::{Severity, Threat, ThreatType};

    fn test_threat() -> Threat {
        Threat {
            id: "t-1".into(),
            timestamp: 1_700_000_000_000,
            threat_type: ThreatType::Scan,
            severity: Severity::Medium,
            device_id: "d-1".into(),
            flow_id: "f-1".into(),
            description: "test".into(),
            recommendation: "test".into(),
            dismissed: false,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.publish(Event::ThreatUpdate {
            threat: test_threat(),
        });

        match rx.recv().await.unwrap() {
            Event::ThreatUpdate { threat } => assert_eq!(threat.id, "t-1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let hub = EventHub::new();
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(Event::ThreatUpdate {
            threat: test_threat(),
        });
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_publisher() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        drop(rx);
        for _ in 0..1000 {
            hub.publish(Event::ThreatUpdate {
                threat: test_threat(),
            });
        }
    }
}
