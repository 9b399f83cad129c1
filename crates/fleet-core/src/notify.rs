use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::SessionId;

/// Observer notifications. Serialized with a `type` tag for presentation layers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    NewSession { bot_id: SessionId },
    SessionRemoved { bot_id: SessionId },
    Stats { active_bots: usize },
}

/// Fire-and-forget broadcast to observers.
///
/// No replay and no acknowledgment; slow receivers lag and lose events.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<FleetEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: FleetEvent) {
        if self.tx.send(event).is_err() {
            trace!("no observers subscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = FleetEvent::NewSession {
            bot_id: SessionId("923001234567".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            serde_json::json!({"type": "new_session", "bot_id": "923001234567"})
        );
        assert_eq!(
            serde_json::to_value(FleetEvent::Stats { active_bots: 3 }).unwrap(),
            serde_json::json!({"type": "stats", "active_bots": 3})
        );
    }

    #[tokio::test]
    async fn publish_without_observers_is_a_noop() {
        let n = Notifier::new(4);
        n.publish(FleetEvent::Stats { active_bots: 0 });

        let mut rx = n.subscribe();
        n.publish(FleetEvent::Stats { active_bots: 1 });
        assert_eq!(rx.recv().await.unwrap(), FleetEvent::Stats { active_bots: 1 });
    }
}
