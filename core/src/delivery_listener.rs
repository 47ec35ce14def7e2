//! Delivery Listener
//!
//! Re-attached as a `ConnectionHook` on every `OnConnected` so it survives
//! reconnects. Subscribes to delivery acks from the live socket and
//! promotes the matching Intent `sent -> delivered`; a second ack for the
//! same provider message id is a no-op because the status guard rejects
//! it. Errors are swallowed — this is best-effort tracking, not the
//! authoritative status path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::connection::{ChatClient, ConnectionHook, ConnectionStream, StreamEvent};
use crate::event_bus::{Event, EventBus, IntentStatusEvent};
use crate::model::IntentStatus;
use crate::store::{IntentStatusUpdate, StateStore};

pub struct DeliveryListener {
    store: StateStore,
    events: EventBus,
}

impl DeliveryListener {
    pub fn new(store: StateStore, events: EventBus) -> Self {
        Self { store, events }
    }

    async fn handle_ack(&self, provider_message_id: &str) {
        let intents = match self.store.list_by_provider_message_id(provider_message_id).await {
            Ok(intents) => intents,
            Err(e) => {
                tracing::debug!(error = %e, "delivery ack lookup failed");
                return;
            }
        };

        for intent in intents {
            if intent.status != IntentStatus::Sent {
                continue;
            }
            let at = Utc::now();
            let result = self
                .store
                .update_intent_status(
                    &intent.id,
                    Some(IntentStatus::Sent),
                    IntentStatusUpdate {
                        status: IntentStatus::Delivered,
                        delivered_at: Some(at),
                        ..Default::default()
                    },
                )
                .await;

            if let Ok(Some(updated)) = result {
                self.events.publish(Event::IntentStatus(IntentStatusEvent {
                    intent_id: updated.id,
                    status: "delivered".into(),
                    at,
                    failure_reason: None,
                }));
            }
        }
    }

    /// Wraps a stream that also carries non-ack events (pairing, connect,
    /// disconnect) and forwards only delivery acks to this listener; used
    /// in tests that drive a `ConnectionStream` directly rather than
    /// through a registered `ConnectionManager`.
    pub async fn observe(self: Arc<Self>, mut stream: Box<dyn ConnectionStream>) {
        while let Some(event) = stream.next().await {
            if let StreamEvent::DeliveryAck { provider_message_id } = event {
                self.handle_ack(&provider_message_id).await;
            }
        }
    }
}

#[async_trait]
impl ConnectionHook for DeliveryListener {
    async fn on_connected(&self, _client: Arc<dyn ChatClient>) {
        // Nothing to do on (re)connect; this hook only cares about acks.
    }

    async fn on_delivery_ack(&self, provider_message_id: &str) {
        self.handle_ack(provider_message_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Intent, Recipient};

    #[tokio::test]
    async fn promotes_sent_to_delivered_on_ack() {
        let store = StateStore::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let listener = DeliveryListener::new(store.clone(), events.clone());

        let mut intent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        intent.status = IntentStatus::Sent;
        intent.provider_message_id = Some("wamid-1".into());
        intent.sent_at = Some(Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        listener.handle_ack("wamid-1").await;

        let updated = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(updated.status, IntentStatus::Delivered);
    }

    #[tokio::test]
    async fn second_ack_is_a_no_op() {
        let store = StateStore::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let listener = DeliveryListener::new(store.clone(), events);

        let mut intent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        intent.status = IntentStatus::Sent;
        intent.provider_message_id = Some("wamid-2".into());
        intent.sent_at = Some(Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        listener.handle_ack("wamid-2").await;
        listener.handle_ack("wamid-2").await;

        let updated = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(updated.status, IntentStatus::Delivered);
    }
}
