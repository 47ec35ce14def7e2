//! Job Runtime
//!
//! A delayed-job queue plus a cron/interval scheduler, consumed by a
//! single-concurrency worker with a 2s minimum inter-dequeue gap. Jobs
//! persist to disk (see [`store`]) so they survive process restarts;
//! `JobRuntime::start` replays any unresolved jobs and active schedules
//! at boot.

pub mod model;
pub mod store;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};
use model::{Job, JobKind, JobState, Schedule, SchedulePattern};
use store::{JobStore, JobsFile};

const MIN_DEQUEUE_GAP: StdDuration = StdDuration::from_secs(2);
const RETRY_BACKOFFS_SECS: [i64; 3] = [5, 10, 20];
const COMPLETED_EVICT_AFTER: chrono::Duration = chrono::Duration::hours(24);
const FAILED_EVICT_AFTER: chrono::Duration = chrono::Duration::days(7);

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one job. Errors for which `EngineError::is_retryable()` is
    /// true are retried per the backoff schedule; anything else fails the
    /// job permanently after this attempt.
    async fn handle(&self, kind: &JobKind) -> Result<()>;
}

pub struct JobRuntime {
    store: JobStore,
    state: Mutex<JobsFile>,
    stopping: AtomicBool,
    wake: Notify,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobRuntime {
    pub async fn open(root_dir: impl AsRef<std::path::Path>) -> Result<Arc<Self>> {
        let store = JobStore::new(root_dir);
        let state = store.load().await?;
        Ok(Arc::new(Self {
            store,
            state: Mutex::new(state),
            stopping: AtomicBool::new(false),
            wake: Notify::new(),
            handles: Mutex::new(Vec::new()),
        }))
    }

    async fn persist(&self, state: &JobsFile) -> Result<()> {
        self.store.save(state).await
    }

    /// Register a delayed job, runnable `delay_ms` from now. Deduplicates
    /// against an existing pending job with the same id.
    pub async fn add_delayed(&self, id: impl Into<String>, kind: JobKind, delay_ms: u64) -> Result<()> {
        let id = id.into();
        let mut state = self.state.lock().await;
        if state.jobs.iter().any(|j| j.id == id && j.state == JobState::Pending) {
            return Ok(());
        }
        let run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        state.jobs.push(Job::new_delayed(id, kind, run_at));
        self.persist(&state).await
    }

    /// No-op if the job is already running or complete.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.retain(|j| !(j.id == id && j.state == JobState::Pending));
        self.persist(&state).await
    }

    pub async fn reschedule(&self, id: &str, kind: JobKind, new_delay_ms: u64) -> Result<()> {
        self.cancel(id).await?;
        self.add_delayed(id.to_string(), kind, new_delay_ms).await
    }

    pub async fn upsert_schedule(&self, schedule: Schedule) -> Result<()> {
        let mut state = self.state.lock().await;
        state.schedules.retain(|s| s.id != schedule.id);
        state.schedules.push(schedule);
        self.persist(&state).await
    }

    pub async fn remove_schedule(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.schedules.retain(|s| s.id != id);
        self.persist(&state).await
    }

    /// Spawns the consumer loop (concurrency 1, 2s floor, retry with
    /// backoff, eviction) and the schedule-emitter loop.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn JobHandler>) {
        let runtime = Arc::clone(self);
        let consumer = tokio::spawn(async move { runtime.consume_loop(handler).await });

        let runtime = Arc::clone(self);
        let scheduler = tokio::spawn(async move { runtime.schedule_loop().await });

        if let Ok(mut handles) = self.handles.try_lock() {
            handles.push(consumer);
            handles.push(scheduler);
        }
    }

    /// Stops accepting new job dequeues, letting an in-flight job finish,
    /// then stops the schedule emitter — "job consumer first, then
    /// producer" per the drain order the Connection Manager and State
    /// Store teardown also follow.
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn consume_loop(&self, handler: Arc<dyn JobHandler>) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(MIN_DEQUEUE_GAP) => {}
                _ = self.wake.notified() => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            let due = {
                let mut state = self.state.lock().await;
                let now = Utc::now();
                let idx = state
                    .jobs
                    .iter()
                    .enumerate()
                    .filter(|(_, j)| j.is_due(now))
                    .min_by_key(|(_, j)| j.run_at)
                    .map(|(i, _)| i);

                match idx {
                    Some(i) => {
                        state.jobs[i].state = JobState::Running;
                        let job = state.jobs[i].clone();
                        let _ = self.persist(&state).await;
                        Some(job)
                    }
                    None => None,
                }
            };

            let Some(job) = due else { continue };
            let outcome = handler.handle(&job.kind).await;
            self.finish_job(job, outcome).await;
            self.evict_old_jobs().await;
        }
    }

    async fn finish_job(&self, mut job: Job, outcome: Result<()>) {
        let mut state = self.state.lock().await;
        let Some(slot) = state.jobs.iter_mut().find(|j| j.id == job.id) else { return };

        match outcome {
            Ok(()) => {
                slot.state = JobState::Completed;
                slot.finished_at = Some(Utc::now());
            }
            Err(e) => {
                job.attempts += 1;
                slot.attempts = job.attempts;
                slot.last_error = Some(e.to_string());

                if e.is_retryable() && job.attempts < job.max_attempts {
                    let backoff = RETRY_BACKOFFS_SECS
                        .get((job.attempts - 1) as usize)
                        .copied()
                        .unwrap_or(*RETRY_BACKOFFS_SECS.last().unwrap());
                    slot.run_at = Utc::now() + chrono::Duration::seconds(backoff);
                    slot.state = JobState::Pending;
                } else {
                    slot.state = JobState::Failed;
                    slot.finished_at = Some(Utc::now());
                }
            }
        }
        let _ = self.persist(&state).await;
    }

    async fn evict_old_jobs(&self) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.jobs.retain(|j| match (&j.state, j.finished_at) {
            (JobState::Completed, Some(at)) => now - at < COMPLETED_EVICT_AFTER,
            (JobState::Failed, Some(at)) => now - at < FAILED_EVICT_AFTER,
            _ => true,
        });
        let _ = self.persist(&state).await;
    }

    async fn schedule_loop(&self) {
        let mut last_checked: HashMap<String, DateTime<Utc>> = HashMap::new();
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_secs(30)) => {}
                _ = self.wake.notified() => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }

            let mut state = self.state.lock().await;
            let now = Utc::now();
            let mut to_remove = Vec::new();
            let mut new_jobs = Vec::new();

            for schedule in state.schedules.iter_mut() {
                if let Some(end) = schedule.end_date {
                    if now > end {
                        to_remove.push(schedule.id.clone());
                        continue;
                    }
                }
                if let Some(max) = schedule.max_occurrences {
                    if schedule.occurrence_count >= max {
                        to_remove.push(schedule.id.clone());
                        continue;
                    }
                }

                let last = last_checked.get(&schedule.id).copied().unwrap_or(schedule.last_fired_at.unwrap_or(now - chrono::Duration::days(1)));
                let due = match &schedule.pattern {
                    SchedulePattern::EveryMs(ms) => now - last >= chrono::Duration::milliseconds(*ms as i64),
                    SchedulePattern::Cron(expr) => cron_due_since(expr, last, now),
                };

                if due {
                    last_checked.insert(schedule.id.clone(), now);
                    schedule.occurrence_count += 1;
                    schedule.last_fired_at = Some(now);

                    let job_id = format!("{}-{}", schedule.id, schedule.occurrence_count);
                    new_jobs.push(Job::new_delayed(job_id, schedule.job_template.clone(), now));
                }
            }

            state.jobs.extend(new_jobs);
            state.schedules.retain(|s| !to_remove.contains(&s.id));
            let _ = self.persist(&state).await;
        }
    }
}

/// Whether a cron-matching moment exists in `(last, now]`.
///
/// The `cron` crate has no notion of an `L` (last-day-of-month) sentinel,
/// so a monthly rule built with day > 28 carries a literal `"L"` in its
/// day-of-month field (see [`crate::scheduling::cron::build`]). Resolve it
/// to the actual last day of `now`'s month before handing the expression
/// to the cron parser, per the documented "compute the last day
/// explicitly" option.
fn cron_due_since(expr: &str, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let resolved = resolve_last_day_sentinel(expr, now);
    match cron::Schedule::from_str(&resolved) {
        Ok(schedule) => schedule.after(&last).next().map(|t| t <= now).unwrap_or(false),
        Err(e) => {
            tracing::warn!(expr, error = %e, "invalid cron expression, schedule never fires");
            false
        }
    }
}

fn resolve_last_day_sentinel(expr: &str, now: DateTime<Utc>) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 6 || fields[3] != "L" {
        return expr.to_string();
    }
    let last_day = last_day_of_month(now.year(), now.month());
    format!("{} {} {} {} {} {}", fields[0], fields[1], fields[2], last_day, fields[4], fields[5])
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
        .day()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_day_sentinel_resolves_to_february_in_a_non_leap_year() {
        let now = DateTime::parse_from_rfc3339("2025-02-10T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(resolve_last_day_sentinel("0 0 9 L * *", now), "0 0 9 28 * *");
    }

    #[test]
    fn last_day_sentinel_resolves_to_february_in_a_leap_year() {
        let now = DateTime::parse_from_rfc3339("2024-02-10T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(resolve_last_day_sentinel("0 0 9 L * *", now), "0 0 9 29 * *");
    }

    #[test]
    fn non_sentinel_expressions_pass_through_unchanged() {
        let now = Utc::now();
        assert_eq!(resolve_last_day_sentinel("0 0 9 15 * *", now), "0 0 9 15 * *");
    }

    #[tokio::test]
    async fn add_delayed_dedupes_pending_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = JobRuntime::open(dir.path()).await.unwrap();

        runtime
            .add_delayed("intent-1", JobKind::SendIntent { intent_id: "1".into() }, 1_000)
            .await
            .unwrap();
        runtime
            .add_delayed("intent-1", JobKind::SendIntent { intent_id: "1".into() }, 5_000)
            .await
            .unwrap();

        let state = runtime.state.lock().await;
        assert_eq!(state.jobs.len(), 1);
    }

    #[tokio::test]
    async fn cancel_removes_pending_job() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = JobRuntime::open(dir.path()).await.unwrap();
        runtime
            .add_delayed("intent-1", JobKind::SendIntent { intent_id: "1".into() }, 1_000)
            .await
            .unwrap();
        runtime.cancel("intent-1").await.unwrap();

        let state = runtime.state.lock().await;
        assert!(state.jobs.is_empty());
    }

    #[tokio::test]
    async fn finish_job_marks_retryable_failure_pending_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = JobRuntime::open(dir.path()).await.unwrap();
        let job = Job::new_delayed(
            "intent-1",
            JobKind::SendIntent { intent_id: "1".into() },
            Utc::now(),
        );
        {
            let mut state = runtime.state.lock().await;
            state.jobs.push(job.clone());
        }

        runtime
            .finish_job(job, Err(EngineError::ProviderTransient { message: "boom".into() }))
            .await;

        let state = runtime.state.lock().await;
        let stored = &state.jobs[0];
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.run_at > Utc::now());
    }

    #[tokio::test]
    async fn finish_job_marks_fatal_failure_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = JobRuntime::open(dir.path()).await.unwrap();
        let job = Job::new_delayed(
            "intent-1",
            JobKind::SendIntent { intent_id: "1".into() },
            Utc::now(),
        );
        {
            let mut state = runtime.state.lock().await;
            state.jobs.push(job.clone());
        }

        runtime
            .finish_job(job, Err(EngineError::ProviderFatal { message: "rejected".into() }))
            .await;

        let state = runtime.state.lock().await;
        assert_eq!(state.jobs[0].state, JobState::Failed);
    }
}
