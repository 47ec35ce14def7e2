//! Retention Sweeper
//!
//! A daily (03:00 local) cleanup of terminal intents older than the
//! configured retention window. `pending` and `cancelled` intents are
//! never swept; `retention_days = 0` disables sweeping entirely. Driven by
//! the Job Runtime's own schedule emitter rather than a second timer loop:
//! `Engine::boot` upserts a `Cleanup`-kind [`Schedule`](crate::job_runtime::model::Schedule)
//! at [`cron_expression`](Self::cron_expression), so the sweep runs through
//! the same single-consumer queue as every other job.

use chrono::{Duration as ChronoDuration, Utc};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::IntentStatus;
use crate::store::StateStore;

const SWEPT_STATUSES: [IntentStatus; 3] =
    [IntentStatus::Sent, IntentStatus::Delivered, IntentStatus::Failed];

pub struct RetentionSweeper {
    store: StateStore,
    retention_days: u32,
    sweep_hour: u32,
    sweep_minute: u32,
}

impl RetentionSweeper {
    pub fn new(store: StateStore, config: EngineConfig) -> Self {
        let (hour, minute) = parse_hhmm(&config.retention_sweep_time).unwrap_or((3, 0));
        Self { store, retention_days: config.retention_days, sweep_hour: hour, sweep_minute: minute }
    }

    /// Deletes terminal intents whose `sent_at` is older than the
    /// retention window. A no-op when retention is disabled.
    pub async fn sweep(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Ok(());
        }
        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days as i64);
        let deleted = self.store.delete_terminal_older_than(cutoff, &SWEPT_STATUSES).await?;
        if deleted > 0 {
            tracing::info!(count = deleted, "retention sweeper deleted terminal intents");
        }
        Ok(())
    }

    /// The six-field cron expression for the configured local sweep time,
    /// for registration as the `Cleanup` job's [`Schedule`](crate::job_runtime::model::Schedule).
    pub fn cron_expression(&self) -> String {
        format!("0 {} {} * * *", self.sweep_minute, self.sweep_hour)
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Intent, Recipient};

    #[tokio::test]
    async fn sweeps_only_old_terminal_intents() {
        let store = StateStore::open_in_memory().await.unwrap();
        let mut config = EngineConfig::default();
        config.retention_days = 30;
        let sweeper = RetentionSweeper::new(store.clone(), config);

        let mut old_sent =
            Intent::new_pending(Recipient::Contact("c1".into()), "old".into(), None, Utc::now());
        old_sent.status = IntentStatus::Sent;
        old_sent.sent_at = Some(Utc::now() - ChronoDuration::days(60));
        let old_id = old_sent.id.clone();
        store.create_intent(old_sent).await.unwrap();

        let mut recent_sent =
            Intent::new_pending(Recipient::Contact("c1".into()), "recent".into(), None, Utc::now());
        recent_sent.status = IntentStatus::Sent;
        recent_sent.sent_at = Some(Utc::now());
        let recent_id = recent_sent.id.clone();
        store.create_intent(recent_sent).await.unwrap();

        let pending =
            Intent::new_pending(Recipient::Contact("c1".into()), "pending".into(), None, Utc::now());
        let pending_id = pending.id.clone();
        store.create_intent(pending).await.unwrap();

        sweeper.sweep().await.unwrap();

        assert!(store.find_intent(&old_id).await.unwrap().is_none());
        assert!(store.find_intent(&recent_id).await.unwrap().is_some());
        assert!(store.find_intent(&pending_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_retention_days_disables_sweeping() {
        let store = StateStore::open_in_memory().await.unwrap();
        let mut config = EngineConfig::default();
        config.retention_days = 0;
        let sweeper = RetentionSweeper::new(store.clone(), config);

        let mut old_sent =
            Intent::new_pending(Recipient::Contact("c1".into()), "old".into(), None, Utc::now());
        old_sent.status = IntentStatus::Sent;
        old_sent.sent_at = Some(Utc::now() - ChronoDuration::days(365));
        let id = old_sent.id.clone();
        store.create_intent(old_sent).await.unwrap();

        sweeper.sweep().await.unwrap();
        assert!(store.find_intent(&id).await.unwrap().is_some());
    }
}
