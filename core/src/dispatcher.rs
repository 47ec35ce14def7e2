//! Dispatcher
//!
//! The single-worker consumer of the Job Runtime. Implements the ten-step
//! flow verbatim: load the authoritative Intent, honor cancellation, check
//! the Rate Limiter, resolve the address, require a connected socket,
//! build the provider payload by media kind, send, record the outcome,
//! emit events, then pace. The Job Runtime's own concurrency=1 and 2s
//! floor are what make the pacing sleep here produce human-like cadence.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use crate::connection::{ChatClient, ConnectionManager, SendPayload};
use crate::contacts::ContactStore;
use crate::error::{EngineError, Result};
use crate::event_bus::{Event, EventBus, IntentStatusEvent};
use crate::job_runtime::model::JobKind;
use crate::job_runtime::JobHandler;
use crate::model::{IntentStatus, MediaKind, Recipient};
use crate::rate_limiter::RateLimiter;
use crate::retention::RetentionSweeper;
use crate::store::{IntentStatusUpdate, StateStore};

/// Mirrors the Job Runtime's own `Job::max_attempts` default (3, see
/// `job_runtime/model.rs`) so the Intent and its backing Job go terminal on
/// the same attempt rather than drifting apart.
const MAX_SEND_ATTEMPTS: u32 = 3;

pub struct Dispatcher {
    store: StateStore,
    rate_limiter: Arc<RateLimiter>,
    connection: Arc<ConnectionManager>,
    contacts: Arc<dyn ContactStore>,
    events: EventBus,
    retention: Arc<RetentionSweeper>,
    min_delay_ms: u64,
    max_delay_ms: u64,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        rate_limiter: Arc<RateLimiter>,
        connection: Arc<ConnectionManager>,
        contacts: Arc<dyn ContactStore>,
        events: EventBus,
        retention: Arc<RetentionSweeper>,
        min_delay_ms: u64,
        max_delay_ms: u64,
    ) -> Self {
        Self { store, rate_limiter, connection, contacts, events, retention, min_delay_ms, max_delay_ms }
    }

    async fn dispatch_intent(&self, intent_id: &str) -> Result<()> {
        // 1. Load the authoritative Intent. Absent means tombstoned.
        let Some(intent) = self.store.find_intent(intent_id).await? else {
            return Ok(());
        };

        // 2. Cancelled intents are a no-op.
        if intent.status == IntentStatus::Cancelled {
            return Ok(());
        }

        // 3. Rate Limiter check.
        let can_send = self.rate_limiter.can_send().await?;
        if !can_send.allowed {
            let reason = format!(
                "Daily message cap reached ({}/{})",
                can_send.sent_today, can_send.daily_cap
            );
            let at = Utc::now();
            let updated = self
                .store
                .update_intent_status(
                    intent_id,
                    Some(IntentStatus::Pending),
                    IntentStatusUpdate {
                        status: IntentStatus::Failed,
                        failed_at: Some(at),
                        failure_reason: Some(reason.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            if updated.is_some() {
                self.events.publish(Event::IntentStatus(IntentStatusEvent {
                    intent_id: intent_id.to_string(),
                    status: "failed".into(),
                    at,
                    failure_reason: Some(reason),
                }));
            }
            self.rate_limiter.check_and_warn().await?;
            return Ok(());
        }

        // 4. Resolve the send address.
        let address = match &intent.recipient {
            Recipient::Group(group_id) => self.contacts.group_address(group_id),
            Recipient::Contact(contact_id) => {
                let resolved = self
                    .contacts
                    .resolve_by_id(contact_id)
                    .await?
                    .ok_or_else(|| EngineError::ContactNotFound { reference: contact_id.clone() })?;
                resolved.address
            }
        };

        // 5. Require a connected socket, else a transient error the Job
        // Runtime retries.
        let client = self
            .connection
            .current_client()
            .await
            .ok_or_else(|| EngineError::ProviderTransient { message: "not connected".into() })?;

        // 6. Build the provider payload by media kind.
        let payload = build_payload(&intent.content, intent.media.as_ref());

        // 7. Send. A failure here must still land the Intent somewhere
        // other than `Pending` before propagating, or an exhausted retry
        // budget (or a fatal error) leaves it stuck forever with no
        // failed-status event ever emitted.
        let provider_message_id = match client.send(&address, payload).await {
            Ok(id) => id,
            Err(e) => {
                let exhausted = intent.attempts + 1 >= MAX_SEND_ATTEMPTS;
                let terminal = !e.is_retryable() || exhausted;
                let at = Utc::now();
                let reason = e.to_string();
                let updated = self
                    .store
                    .update_intent_status(
                        intent_id,
                        Some(IntentStatus::Pending),
                        IntentStatusUpdate {
                            status: if terminal { IntentStatus::Failed } else { IntentStatus::Pending },
                            failed_at: terminal.then_some(at),
                            failure_reason: Some(reason.clone()),
                            increment_attempts: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                if terminal && updated.is_some() {
                    self.events.publish(Event::IntentStatus(IntentStatusEvent {
                        intent_id: intent_id.to_string(),
                        status: "failed".into(),
                        at,
                        failure_reason: Some(reason),
                    }));
                }
                return Err(e);
            }
        };

        // 8. Record the outcome atomically.
        let sent_at = Utc::now();
        let updated = self
            .store
            .update_intent_status(
                intent_id,
                Some(IntentStatus::Pending),
                IntentStatusUpdate {
                    status: IntentStatus::Sent,
                    provider_message_id: Some(provider_message_id),
                    sent_at: Some(sent_at),
                    increment_attempts: true,
                    ..Default::default()
                },
            )
            .await?;

        // 9. Emit and warn.
        if updated.is_some() {
            self.events.publish(Event::IntentStatus(IntentStatusEvent {
                intent_id: intent_id.to_string(),
                status: "sent".into(),
                at: sent_at,
                failure_reason: None,
            }));
        }
        self.rate_limiter.check_and_warn().await?;

        // 10. Pace.
        self.pace().await;
        Ok(())
    }

    async fn fire_recurrence(&self, rule_id: &str) -> Result<()> {
        let Some(rule) = self.store.find_rule(rule_id).await? else { return Ok(()) };
        if !rule.is_active(Utc::now()) {
            return Ok(());
        }

        let recipient = Recipient::Contact(rule.recipient_contact_id.clone());
        let mut intent =
            crate::model::Intent::new_pending(recipient, rule.content.clone(), rule.media.clone(), Utc::now());
        intent.recurrence_rule_id = Some(rule.id.clone());

        let auto_disable = rule
            .max_occurrences
            .map(|max| rule.occurrence_count + 1 >= max)
            .unwrap_or(false);

        let intent = self
            .store
            .create_intent_and_mark_rule_fired(intent, &rule.id, Utc::now(), auto_disable)
            .await?;

        self.dispatch_intent(&intent.id).await
    }

    async fn pace(&self) {
        let delay_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.min_delay_ms..self.max_delay_ms.max(self.min_delay_ms + 1))
        };
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
    }
}

fn build_payload(content: &str, media: Option<&crate::model::Media>) -> SendPayload {
    match media {
        None => SendPayload::Text { text: content.to_string() },
        Some(m) => match m.kind {
            MediaKind::Image | MediaKind::Video => SendPayload::Media {
                kind: m.kind,
                url: m.url.clone(),
                caption: Some(content.to_string()),
                file_name: None,
            },
            MediaKind::Audio => SendPayload::Media {
                kind: m.kind,
                url: m.url.clone(),
                caption: None,
                file_name: None,
            },
            MediaKind::Document => SendPayload::Media {
                kind: m.kind,
                url: m.url.clone(),
                caption: Some(content.to_string()),
                file_name: derive_file_name(&m.url),
            },
        },
    }
}

fn derive_file_name(url: &str) -> Option<String> {
    url.rsplit('/').next().map(|s| s.to_string())
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, kind: &JobKind) -> Result<()> {
        match kind {
            JobKind::SendIntent { intent_id } => self.dispatch_intent(intent_id).await,
            JobKind::FireRecurrence { rule_id } => self.fire_recurrence(rule_id).await,
            JobKind::Cleanup => self.retention.sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::contacts::ResolvedContact;
    use crate::model::{Intent, Recipient};
    use crate::vault::CredentialVault;

    struct StubContacts;

    #[async_trait]
    impl ContactStore for StubContacts {
        async fn resolve_by_id(&self, contact_id: &str) -> Result<Option<ResolvedContact>> {
            Ok(Some(ResolvedContact {
                contact_id: contact_id.to_string(),
                address: format!("91{contact_id}@s.whatsapp.net"),
                name: None,
            }))
        }
        async fn resolve_or_create_by_phone(&self, phone: &str, name: Option<&str>) -> Result<ResolvedContact> {
            Ok(ResolvedContact {
                contact_id: phone.to_string(),
                address: format!("91{phone}@s.whatsapp.net"),
                name: name.map(|s| s.to_string()),
            })
        }
    }

    async fn harness_with_cap(daily_cap: u32) -> (Dispatcher, StateStore) {
        let store = StateStore::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let mut config = EngineConfig::default();
        config.daily_cap = daily_cap;
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), events.clone(), &config));
        let connection = Arc::new(ConnectionManager::new(
            CredentialVault::new("pw"),
            events.clone(),
            config.clone(),
        ));
        let retention = Arc::new(RetentionSweeper::new(store.clone(), config.clone()));
        let dispatcher = Dispatcher::new(
            store.clone(),
            rate_limiter,
            connection,
            Arc::new(StubContacts),
            events,
            retention,
            0,
            1,
        );
        (dispatcher, store)
    }

    #[tokio::test]
    async fn cancelled_intent_is_a_no_op() {
        let (dispatcher, store) = harness_with_cap(30).await;
        let mut intent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        intent.status = IntentStatus::Cancelled;
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        dispatcher.dispatch_intent(&id).await.unwrap();

        let after = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(after.status, IntentStatus::Cancelled);
    }

    #[tokio::test]
    async fn missing_intent_is_tombstoned_silently() {
        let (dispatcher, _store) = harness_with_cap(30).await;
        dispatcher.dispatch_intent("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn cap_reached_fails_intent_with_reason() {
        let (dispatcher, store) = harness_with_cap(1).await;

        let mut already_sent =
            Intent::new_pending(Recipient::Contact("c0".into()), "hi".into(), None, Utc::now());
        already_sent.status = IntentStatus::Sent;
        already_sent.sent_at = Some(Utc::now());
        store.create_intent(already_sent).await.unwrap();

        let intent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        dispatcher.dispatch_intent(&id).await.unwrap();

        let after = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(after.status, IntentStatus::Failed);
        assert!(after.failure_reason.as_deref().unwrap().contains("Daily message cap reached"));
    }

    struct FailingChatClient;

    #[async_trait]
    impl ChatClient for FailingChatClient {
        async fn send(&self, _address: &str, _payload: SendPayload) -> Result<String> {
            Err(EngineError::ProviderTransient { message: "socket reset".into() })
        }
        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn exhausting_retries_fails_the_intent() {
        let (dispatcher, store) = harness_with_cap(30).await;
        dispatcher.connection.set_connected_for_test(Arc::new(FailingChatClient)).await;

        let intent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let err = dispatcher.dispatch_intent(&id).await.unwrap_err();
            assert!(err.is_retryable());

            let after = store.find_intent(&id).await.unwrap().unwrap();
            assert_eq!(after.attempts, attempt);
            if attempt < MAX_SEND_ATTEMPTS {
                assert_eq!(after.status, IntentStatus::Pending);
            } else {
                assert_eq!(after.status, IntentStatus::Failed);
                assert!(after.failure_reason.as_deref().unwrap().contains("socket reset"));
            }
        }
    }

    #[tokio::test]
    async fn requires_connected_socket() {
        let (dispatcher, store) = harness_with_cap(30).await;
        let intent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        let err = dispatcher.dispatch_intent(&id).await.unwrap_err();
        assert!(err.is_retryable());

        let after = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(after.status, IntentStatus::Pending);
    }

    #[test]
    fn payload_for_text_has_no_media() {
        let payload = build_payload("hello", None);
        assert!(matches!(payload, SendPayload::Text { .. }));
    }

    #[test]
    fn payload_for_document_derives_file_name() {
        let media = crate::model::Media { url: "https://cdn/x/invoice.pdf".into(), kind: MediaKind::Document };
        let payload = build_payload("here's the invoice", Some(&media));
        match payload {
            SendPayload::Media { file_name, .. } => assert_eq!(file_name.as_deref(), Some("invoice.pdf")),
            _ => panic!("expected media payload"),
        }
    }

    #[test]
    fn payload_for_audio_has_no_caption() {
        let media = crate::model::Media { url: "https://cdn/clip.ogg".into(), kind: MediaKind::Audio };
        let payload = build_payload("ignored", Some(&media));
        match payload {
            SendPayload::Media { caption, .. } => assert!(caption.is_none()),
            _ => panic!("expected media payload"),
        }
    }
}
