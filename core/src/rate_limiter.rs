//! Rate Limiter
//!
//! Counts terminal-success intents within the current IST day from the
//! State Store on every call — there is no in-memory counter to contend
//! on, matching the design's "stateless beyond the configured constants"
//! requirement. Warnings are broadcast at a configurable threshold.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::config::EngineConfig;
use crate::event_bus::{Event, EventBus, RateLimitReached, RateLimitWarning};
use crate::model::RateLimitStatus;
use crate::store::StateStore;

pub struct CanSend {
    pub allowed: bool,
    pub sent_today: u32,
    pub daily_cap: u32,
    pub remaining: u32,
}

pub struct RateLimiter {
    store: StateStore,
    events: EventBus,
    daily_cap: u32,
    warn_pct: u8,
    offset_minutes: i32,
}

impl RateLimiter {
    pub fn new(store: StateStore, events: EventBus, config: &EngineConfig) -> Self {
        Self {
            store,
            events,
            daily_cap: config.daily_cap,
            warn_pct: config.warn_pct,
            offset_minutes: config.local_offset_minutes,
        }
    }

    /// The instant range `[today-start-local, today-start-local + 24h)`,
    /// derived by shifting the wall clock by the local offset, truncating
    /// to a day, then shifting back — so the boundary always lands on
    /// local midnight regardless of the process's own timezone.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let offset = ChronoDuration::minutes(self.offset_minutes as i64);
        let shifted = now + offset;
        let day_start_shifted = shifted.date_naive().and_hms_opt(0, 0, 0).unwrap();
        let day_start = Utc.from_utc_datetime(&day_start_shifted) - offset;
        (day_start, day_start + ChronoDuration::hours(24))
    }

    async fn sent_today(&self, now: DateTime<Utc>) -> crate::error::Result<u32> {
        let (start, end) = self.window(now);
        self.store.count_terminal_success_in(start, end).await
    }

    pub async fn can_send(&self) -> crate::error::Result<CanSend> {
        let now = Utc::now();
        let sent_today = self.sent_today(now).await?;
        let allowed = sent_today < self.daily_cap;
        Ok(CanSend {
            allowed,
            sent_today,
            daily_cap: self.daily_cap,
            remaining: self.daily_cap.saturating_sub(sent_today),
        })
    }

    pub async fn status(&self) -> crate::error::Result<RateLimitStatus> {
        let now = Utc::now();
        let sent_today = self.sent_today(now).await?;
        let (_, reset_at) = self.window(now);
        let threshold = self.warn_threshold();
        Ok(RateLimitStatus {
            sent_today,
            daily_cap: self.daily_cap,
            remaining: self.daily_cap.saturating_sub(sent_today),
            reset_at,
            warning: sent_today >= threshold,
        })
    }

    fn warn_threshold(&self) -> u32 {
        (self.daily_cap as u64 * self.warn_pct as u64 / 100) as u32
    }

    /// Called after each dispatch attempt. Per the design's Open Question
    /// (b), this fires on every qualifying send rather than de-duplicating
    /// at first crossing — the safer interpretation absent product
    /// guidance.
    pub async fn check_and_warn(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let sent_today = self.sent_today(now).await?;
        let threshold = self.warn_threshold();

        if sent_today >= self.daily_cap {
            let (_, reset_at) = self.window(now);
            self.events.publish(Event::RateLimitReached(RateLimitReached {
                sent_today,
                daily_cap: self.daily_cap,
                reset_at,
            }));
        } else if sent_today >= threshold {
            self.events.publish(Event::RateLimitWarning(RateLimitWarning {
                sent_today,
                daily_cap: self.daily_cap,
                remaining: self.daily_cap.saturating_sub(sent_today),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Intent, IntentStatus, Recipient};

    async fn limiter_with_cap(cap: u32) -> (RateLimiter, StateStore) {
        let store = StateStore::open_in_memory().await.unwrap();
        let mut config = EngineConfig::default();
        config.daily_cap = cap;
        let events = EventBus::new();
        (RateLimiter::new(store.clone(), events, &config), store)
    }

    #[tokio::test]
    async fn allows_when_under_cap() {
        let (limiter, _store) = limiter_with_cap(30).await;
        let result = limiter.can_send().await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 30);
    }

    #[tokio::test]
    async fn denies_when_at_cap() {
        let (limiter, store) = limiter_with_cap(1).await;

        let mut sent = Intent::new_pending(Recipient::Contact("c1".into()), "hi".into(), None, Utc::now());
        sent.status = IntentStatus::Sent;
        sent.sent_at = Some(Utc::now());
        store.create_intent(sent).await.unwrap();

        let result = limiter.can_send().await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn window_is_a_full_local_day() {
        let (limiter, _store) = limiter_with_cap(30).await;
        let now = Utc::now();
        let (start, end) = limiter.window(now);
        assert_eq!(end - start, ChronoDuration::hours(24));
        assert!(start <= now && now < end);
    }
}
