//! Scheduling Service
//!
//! The public entry point: translates caller requests into State Store
//! writes and Job Runtime registrations. Grounded on the constructor-once,
//! explicit-interface pattern the design notes call for in place of the
//! source's per-request factory closures — one `SchedulingService` is
//! built at boot and shared behind an `Arc`.

pub mod cron;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::contacts::{ContactRef, ContactStore};
use crate::error::{EngineError, Result};
use crate::event_bus::EventBus;
use crate::job_runtime::model::JobKind;
use crate::job_runtime::JobRuntime;
use crate::model::{
    Intent, IntentStatus, Media, RateLimitStatus, Recipient, RecurrenceKind, RecurrenceRule,
    RecurrenceSchedule,
};
use crate::rate_limiter::RateLimiter;
use crate::store::{IntentFilter, IntentStatusUpdate, StateStore};

const MAX_BULK_BATCH: usize = 500;
const MAX_LIST_LIMIT: u32 = 200;

/// One item of a `Schedule` call.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub recipient: ContactRef,
    pub content: String,
    pub media: Option<Media>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct IntentPatch {
    pub content: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub media: Option<Option<Media>>,
}

#[derive(Debug)]
pub struct ScheduleOutcome {
    pub intent: Intent,
    pub rate_limit: RateLimitStatus,
}

pub struct BulkFailure {
    pub index: usize,
    pub error: EngineError,
}

pub struct BulkOutcome {
    pub scheduled: Vec<Intent>,
    pub failed: Vec<BulkFailure>,
    pub rate_limit: RateLimitStatus,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub status: Option<IntentStatus>,
    pub contact_ref: Option<String>,
    pub phone_mode_exclude: bool,
    pub limit: u32,
    pub offset: u32,
}

/// Request to create a recurrence rule; the cron/interval fields it needs
/// are kind-dependent (see [`cron::build`]).
#[derive(Debug, Clone)]
pub struct CreateRuleRequest {
    pub recipient_contact_id: String,
    pub kind: RecurrenceKind,
    pub content: String,
    pub media: Option<Media>,
    pub hour: u8,
    pub minute: u8,
    pub day_of_week: Option<u8>,
    pub day_of_month: Option<u8>,
    pub month: Option<u8>,
    pub every_n_days: Option<u32>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub content: Option<String>,
    pub media: Option<Option<Media>>,
    pub enabled: Option<bool>,
    pub end_date: Option<Option<DateTime<Utc>>>,
    pub max_occurrences: Option<Option<u32>>,
}

pub struct SchedulingService {
    store: StateStore,
    rate_limiter: Arc<RateLimiter>,
    jobs: Arc<JobRuntime>,
    contacts: Arc<dyn ContactStore>,
    events: EventBus,
    default_send_hour: u8,
    birthday_template: String,
}

impl SchedulingService {
    pub fn new(
        store: StateStore,
        rate_limiter: Arc<RateLimiter>,
        jobs: Arc<JobRuntime>,
        contacts: Arc<dyn ContactStore>,
        events: EventBus,
        default_send_hour: u8,
        birthday_template: String,
    ) -> Self {
        Self { store, rate_limiter, jobs, contacts, events, default_send_hour, birthday_template }
    }

    async fn resolve_recipient(&self, recipient: &ContactRef) -> Result<Recipient> {
        match recipient {
            ContactRef::Id(id) => {
                self.contacts
                    .resolve_by_id(id)
                    .await?
                    .ok_or_else(|| EngineError::ContactNotFound { reference: id.clone() })?;
                Ok(Recipient::Contact(id.clone()))
            }
            ContactRef::Phone { phone, name } => {
                let resolved = self.contacts.resolve_or_create_by_phone(phone, name.as_deref()).await?;
                Ok(Recipient::Contact(resolved.contact_id))
            }
        }
    }

    pub async fn schedule(&self, req: ScheduleRequest) -> Result<ScheduleOutcome> {
        if req.content.is_empty() && req.media.is_none() {
            return Err(EngineError::validation("content or media is required"));
        }
        let recipient = self.resolve_recipient(&req.recipient).await?;
        let now = Utc::now();
        let scheduled_at = req.scheduled_at.unwrap_or(now);
        let is_immediate = scheduled_at <= now;

        if is_immediate {
            let can_send = self.rate_limiter.can_send().await?;
            if !can_send.allowed {
                return Err(EngineError::DailyCapReached {
                    sent_today: can_send.sent_today,
                    daily_cap: can_send.daily_cap,
                });
            }
        }

        let intent = Intent::new_pending(recipient, req.content, req.media, scheduled_at);
        let intent = self.store.create_intent(intent).await?;

        let delay_ms = (scheduled_at - now).num_milliseconds().max(0) as u64;
        self.jobs
            .add_delayed(
                format!("intent-{}", intent.id),
                JobKind::SendIntent { intent_id: intent.id.clone() },
                delay_ms,
            )
            .await?;

        let rate_limit = self.rate_limiter.status().await?;
        Ok(ScheduleOutcome { intent, rate_limit })
    }

    /// Pre-checks the count of immediate items against remaining capacity
    /// before doing any per-item work, failing the whole batch fast on
    /// insufficiency; individual item errors after that point do not fail
    /// the batch.
    pub async fn schedule_bulk(&self, items: Vec<ScheduleRequest>) -> Result<BulkOutcome> {
        if items.len() > MAX_BULK_BATCH {
            return Err(EngineError::validation(format!(
                "batch of {} exceeds max batch size {MAX_BULK_BATCH}",
                items.len()
            )));
        }

        let now = Utc::now();
        let immediate_count =
            items.iter().filter(|i| i.scheduled_at.map(|at| at <= now).unwrap_or(true)).count() as u32;
        let can_send = self.rate_limiter.can_send().await?;
        if immediate_count > can_send.remaining {
            return Err(EngineError::DailyCapReached {
                sent_today: can_send.sent_today,
                daily_cap: can_send.daily_cap,
            });
        }

        let mut scheduled = Vec::new();
        let mut failed = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            match self.schedule(item).await {
                Ok(outcome) => scheduled.push(outcome.intent),
                Err(error) => failed.push(BulkFailure { index, error }),
            }
        }

        let rate_limit = self.rate_limiter.status().await?;
        Ok(BulkOutcome { scheduled, failed, rate_limit })
    }

    pub async fn edit(&self, id: &str, patch: IntentPatch) -> Result<Intent> {
        let reschedule = patch.scheduled_at;
        let intent = self.store.edit_intent(id, patch.content, patch.scheduled_at, patch.media).await?;

        if let Some(new_scheduled_at) = reschedule {
            let delay_ms = (new_scheduled_at - Utc::now()).num_milliseconds().max(0) as u64;
            self.jobs
                .reschedule(&format!("intent-{id}"), JobKind::SendIntent { intent_id: id.to_string() }, delay_ms)
                .await?;
        }
        Ok(intent)
    }

    /// Idempotent: returns `Ok(None)` when the intent was not `pending`.
    pub async fn cancel(&self, id: &str) -> Result<Option<Intent>> {
        let updated = self
            .store
            .update_intent_status(
                id,
                Some(IntentStatus::Pending),
                IntentStatusUpdate::to(IntentStatus::Cancelled),
            )
            .await?;
        if updated.is_some() {
            self.jobs.cancel(&format!("intent-{id}")).await?;
        }
        Ok(updated)
    }

    pub async fn retry(&self, id: &str) -> Result<Intent> {
        let updated = self
            .store
            .update_intent_status(
                id,
                Some(IntentStatus::Failed),
                IntentStatusUpdate {
                    status: IntentStatus::Pending,
                    scheduled_at: Some(Utc::now()),
                    clear_failure: true,
                    reset_attempts: true,
                    ..Default::default()
                },
            )
            .await?
            .ok_or_else(|| EngineError::conflict("intent is not in a failed state"))?;

        self.jobs
            .add_delayed(format!("intent-{id}"), JobKind::SendIntent { intent_id: id.to_string() }, 0)
            .await?;
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Result<Intent> {
        self.store.find_intent(id).await?.ok_or_else(|| EngineError::not_found(format!("intent {id}")))
    }

    pub async fn list(&self, filters: ListFilters) -> Result<Vec<Intent>> {
        self.store
            .list_intents(IntentFilter {
                status: filters.status,
                contact_ref: filters.contact_ref,
                phone_mode_exclude: filters.phone_mode_exclude,
                limit: filters.limit.min(MAX_LIST_LIMIT),
                offset: filters.offset,
            })
            .await
    }

    pub async fn create_rule(&self, req: CreateRuleRequest) -> Result<RecurrenceRule> {
        if req.kind == RecurrenceKind::Birthday {
            if self.store.find_birthday_rule(&req.recipient_contact_id).await?.is_some() {
                return Err(EngineError::conflict("a birthday rule already exists for this contact"));
            }
        }

        let schedule = build_schedule(&req)?;
        let now = Utc::now();
        let rule = RecurrenceRule {
            id: uuid::Uuid::new_v4().to_string(),
            recipient_contact_id: req.recipient_contact_id,
            kind: req.kind,
            content: req.content,
            media: req.media,
            schedule,
            end_date: req.end_date,
            max_occurrences: req.max_occurrences,
            occurrence_count: 0,
            enabled: true,
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        };
        let rule = self.store.create_rule(rule).await?;
        self.register_schedule(&rule).await?;
        Ok(rule)
    }

    pub async fn update_rule(&self, id: &str, patch: RulePatch) -> Result<RecurrenceRule> {
        let mut rule = self.store.find_rule(id).await?.ok_or_else(|| EngineError::not_found(format!("rule {id}")))?;

        if let Some(content) = patch.content {
            rule.content = content;
        }
        if let Some(media) = patch.media {
            rule.media = media;
        }
        if let Some(enabled) = patch.enabled {
            rule.enabled = enabled;
        }
        if let Some(end_date) = patch.end_date {
            rule.end_date = end_date;
        }
        if let Some(max_occurrences) = patch.max_occurrences {
            rule.max_occurrences = max_occurrences;
        }
        rule.updated_at = Utc::now();

        let rule = self.store.update_rule(rule).await?;
        if rule.enabled {
            self.register_schedule(&rule).await?;
        } else {
            self.jobs.remove_schedule(&rule.id).await?;
        }
        Ok(rule)
    }

    pub async fn disable_rule(&self, id: &str) -> Result<RecurrenceRule> {
        self.update_rule(id, RulePatch { enabled: Some(false), ..Default::default() }).await
    }

    pub async fn get_rule(&self, id: &str) -> Result<RecurrenceRule> {
        self.store.find_rule(id).await?.ok_or_else(|| EngineError::not_found(format!("rule {id}")))
    }

    pub async fn list_rules(&self, contact_id: Option<&str>) -> Result<Vec<RecurrenceRule>> {
        self.store.list_rules(contact_id).await
    }

    /// Keeps a contact's birthday rule in sync with its birthday field.
    pub async fn sync_birthday_reminder(
        &self,
        contact_id: &str,
        birthday_mmdd: Option<(u8, u8)>,
        enabled: Option<bool>,
        contact_name: Option<&str>,
    ) -> Result<()> {
        let existing = self.store.find_birthday_rule(contact_id).await?;

        let should_enable = birthday_mmdd.is_some() && enabled != Some(false);
        if !should_enable {
            if let Some(mut rule) = existing {
                rule.enabled = false;
                rule.updated_at = Utc::now();
                self.store.update_rule(rule.clone()).await?;
                self.jobs.remove_schedule(&rule.id).await?;
            }
            return Ok(());
        }

        let (month, day) = birthday_mmdd.unwrap();
        let name = contact_name.unwrap_or("there");
        let content = self.birthday_template.replace("{{name}}", name).replace("{name}", name);

        match existing {
            Some(mut rule) => {
                rule.content = content;
                rule.enabled = true;
                rule.schedule = RecurrenceSchedule::Cron(
                    cron::build(RecurrenceKind::Birthday, self.default_send_hour, 0, None, Some(day), Some(month))
                        .expect("birthday kind always yields a cron expression"),
                );
                rule.updated_at = Utc::now();
                let rule = self.store.update_rule(rule).await?;
                self.register_schedule(&rule).await?;
            }
            None => {
                let req = CreateRuleRequest {
                    recipient_contact_id: contact_id.to_string(),
                    kind: RecurrenceKind::Birthday,
                    content,
                    media: None,
                    hour: self.default_send_hour,
                    minute: 0,
                    day_of_week: None,
                    day_of_month: Some(day),
                    month: Some(month),
                    every_n_days: None,
                    end_date: None,
                    max_occurrences: None,
                };
                self.create_rule(req).await?;
            }
        }
        Ok(())
    }

    async fn register_schedule(&self, rule: &RecurrenceRule) -> Result<()> {
        let pattern = match &rule.schedule {
            RecurrenceSchedule::Cron(expr) => crate::job_runtime::model::SchedulePattern::Cron(expr.clone()),
            RecurrenceSchedule::EveryNDays(n) => {
                crate::job_runtime::model::SchedulePattern::EveryMs(*n as u64 * 24 * 60 * 60 * 1000)
            }
        };
        self.jobs
            .upsert_schedule(crate::job_runtime::model::Schedule {
                id: rule.id.clone(),
                pattern,
                end_date: rule.end_date,
                max_occurrences: rule.max_occurrences,
                occurrence_count: rule.occurrence_count,
                job_template: JobKind::FireRecurrence { rule_id: rule.id.clone() },
                last_fired_at: rule.last_fired_at,
            })
            .await
    }
}

fn build_schedule(req: &CreateRuleRequest) -> Result<RecurrenceSchedule> {
    if req.kind == RecurrenceKind::Custom {
        let days = req
            .every_n_days
            .ok_or_else(|| EngineError::validation("custom recurrence requires every_n_days"))?;
        return Ok(RecurrenceSchedule::EveryNDays(days));
    }
    let expr = cron::build(req.kind, req.hour, req.minute, req.day_of_week, req.day_of_month, req.month)
        .ok_or_else(|| EngineError::validation("this recurrence kind requires a cron schedule"))?;
    Ok(RecurrenceSchedule::Cron(expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::contacts::ResolvedContact;
    use async_trait::async_trait;

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

    async fn harness(daily_cap: u32) -> (SchedulingService, StateStore) {
        let store = StateStore::open_in_memory().await.unwrap();
        let events = EventBus::new();
        let mut config = EngineConfig::default();
        config.daily_cap = daily_cap;
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), events.clone(), &config));
        let dir = tempfile::tempdir().unwrap();
        let jobs = JobRuntime::open(dir.path()).await.unwrap();
        let service = SchedulingService::new(
            store.clone(),
            rate_limiter,
            jobs,
            Arc::new(StubContacts),
            events,
            9,
            "Happy birthday, {name}!".to_string(),
        );
        (service, store)
    }

    #[tokio::test]
    async fn schedule_creates_pending_intent_and_job() {
        let (service, store) = harness(30).await;
        let outcome = service
            .schedule(ScheduleRequest {
                recipient: ContactRef::Phone { phone: "9876543210".into(), name: None },
                content: "Hi".into(),
                media: None,
                scheduled_at: None,
            })
            .await
            .unwrap();

        assert_eq!(outcome.intent.status, IntentStatus::Pending);
        assert_eq!(outcome.rate_limit.sent_today, 0);
        assert!(store.find_intent(&outcome.intent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn schedule_rejects_immediate_send_over_cap() {
        let (service, _store) = harness(0).await;
        let err = service
            .schedule(ScheduleRequest {
                recipient: ContactRef::Phone { phone: "1".into(), name: None },
                content: "Hi".into(),
                media: None,
                scheduled_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DailyCapReached { .. }));
    }

    #[tokio::test]
    async fn future_schedule_never_fails_the_cap() {
        let (service, _store) = harness(0).await;
        let future = Utc::now() + chrono::Duration::hours(1);
        let outcome = service
            .schedule(ScheduleRequest {
                recipient: ContactRef::Phone { phone: "1".into(), name: None },
                content: "Hi".into(),
                media: None,
                scheduled_at: Some(future),
            })
            .await
            .unwrap();
        assert_eq!(outcome.intent.status, IntentStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_non_pending_intent() {
        let (service, store) = harness(30).await;
        let outcome = service
            .schedule(ScheduleRequest {
                recipient: ContactRef::Phone { phone: "1".into(), name: None },
                content: "Hi".into(),
                media: None,
                scheduled_at: None,
            })
            .await
            .unwrap();

        let first = service.cancel(&outcome.intent.id).await.unwrap();
        assert!(first.is_some());

        let second = service.cancel(&outcome.intent.id).await.unwrap();
        assert!(second.is_none());
        let _ = store;
    }

    #[tokio::test]
    async fn retry_resets_failed_intent_to_pending() {
        let (service, store) = harness(30).await;
        let outcome = service
            .schedule(ScheduleRequest {
                recipient: ContactRef::Phone { phone: "1".into(), name: None },
                content: "Hi".into(),
                media: None,
                scheduled_at: None,
            })
            .await
            .unwrap();

        store
            .update_intent_status(
                &outcome.intent.id,
                None,
                IntentStatusUpdate {
                    status: IntentStatus::Failed,
                    failure_reason: Some("boom".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retried = service.retry(&outcome.intent.id).await.unwrap();
        assert_eq!(retried.status, IntentStatus::Pending);
        assert!(retried.failure_reason.is_none());
        assert_eq!(retried.attempts, 0);
    }

    #[tokio::test]
    async fn sync_birthday_reminder_creates_then_disables() {
        let (service, store) = harness(30).await;
        service
            .sync_birthday_reminder("c1", Some((3, 15)), Some(true), Some("Asha"))
            .await
            .unwrap();

        let rule = store.find_birthday_rule("c1").await.unwrap().unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.schedule, RecurrenceSchedule::Cron("0 0 9 15 3 *".to_string()));

        service.sync_birthday_reminder("c1", None, None, None).await.unwrap();
        let rule = store.find_birthday_rule("c1").await.unwrap().unwrap();
        assert!(!rule.enabled);
    }

    #[tokio::test]
    async fn create_rule_rejects_duplicate_birthday_rule() {
        let (service, _store) = harness(30).await;
        let req = CreateRuleRequest {
            recipient_contact_id: "c1".into(),
            kind: RecurrenceKind::Birthday,
            content: "hi".into(),
            media: None,
            hour: 9,
            minute: 0,
            day_of_week: None,
            day_of_month: Some(15),
            month: Some(3),
            every_n_days: None,
            end_date: None,
            max_occurrences: None,
        };
        service.create_rule(req.clone()).await.unwrap();
        let err = service.create_rule(req).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }
}
