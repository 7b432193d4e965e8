//! Live broadcaster interface: the engine calls a fixed trio of callbacks
//! so an external consumer (the REST/WebSocket layer) can observe traffic
//! as it happens. Delivery is best-effort; a slow subscriber must never
//! stall the proxy.

use crate::model::{DropReason, DropLogEntry, Event, Flow};
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Implemented by whatever wants to observe live traffic. The engine holds
/// one `Arc<dyn Broadcaster>` and calls it from the hot path, so every
/// method must return immediately.
pub trait Broadcaster: Send + Sync {
    fn on_flow_started(&self, flow: &Flow);
    fn on_flow_updated(&self, flow: &Flow);
    fn on_event(&self, event: &Event);
}

/// A [`Broadcaster`] that does nothing; used when no subscriber layer is
/// attached (e.g. running the proxy headless with persistence only).
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn on_flow_started(&self, _flow: &Flow) {}
    fn on_flow_updated(&self, _flow: &Flow) {}
    fn on_event(&self, _event: &Event) {}
}

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    FlowStarted(Flow),
    FlowUpdated(Flow),
    Event(Event),
}

/// Wraps a bounded channel so `on_*` calls never block the caller: a full
/// queue drops the new message and logs a `drop_log` entry with
/// `reason = subscriber_slow`, per §4.9. The store write for the drop
/// itself is fire-and-forget from a spawned task, since the broadcaster's
/// own contract ("non-blocking from the engine's perspective") forbids
/// waiting on it inline.
pub struct QueuedBroadcaster {
    tx: mpsc::Sender<BroadcastMessage>,
    store: Arc<Store>,
}

impl QueuedBroadcaster {
    pub fn new(capacity: usize, store: Arc<Store>) -> (Self, mpsc::Receiver<BroadcastMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, store }, rx)
    }

    fn offer(&self, message: BroadcastMessage) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(message) {
            let store = self.store.clone();
            tokio::spawn(async move {
                let entry = DropLogEntry {
                    flow_id: None,
                    event_type: None,
                    priority: None,
                    reason: DropReason::SubscriberSlow,
                    timestamp: chrono::Utc::now(),
                };
                if let Err(e) = store.log_drop(entry).await {
                    tracing::warn!("failed to record subscriber_slow drop: {e}");
                }
            });
        }
    }
}

impl Broadcaster for QueuedBroadcaster {
    fn on_flow_started(&self, flow: &Flow) {
        self.offer(BroadcastMessage::FlowStarted(flow.clone()));
    }

    fn on_flow_updated(&self, flow: &Flow) {
        self.offer(BroadcastMessage::FlowUpdated(flow.clone()));
    }

    fn on_event(&self, event: &Event) {
        self.offer(BroadcastMessage::Event(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Flow;

    async fn temp_store() -> Store {
        let dir = std::env::temp_dir().join(format!("langley-broadcast-test-{}", uuid::Uuid::new_v4()));
        Store::open(&dir.join("langley.db")).unwrap()
    }

    #[tokio::test]
    async fn overflow_drops_message_and_logs_subscriber_slow() {
        let store = Arc::new(temp_store().await);
        let (broadcaster, mut rx) = QueuedBroadcaster::new(1, store.clone());

        let flow = Flow::new("api.anthropic.com".into(), "POST".into(), "/v1/messages".into(), "url".into(), 1);
        broadcaster.on_flow_started(&flow);
        broadcaster.on_flow_started(&flow); // channel now full, this one overflows

        assert!(matches!(rx.recv().await, Some(BroadcastMessage::FlowStarted(_))));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[test]
    fn null_broadcaster_does_nothing() {
        let flow = Flow::new("h".into(), "GET".into(), "/".into(), "url".into(), 0);
        NullBroadcaster.on_flow_started(&flow);
        NullBroadcaster.on_flow_updated(&flow);
    }
}
