//! Typed job payloads and persisted queue records.
//!
//! Replaces the teacher's dynamic, `any`-typed job payload with a typed
//! sum over job kinds; payloads carry only ids, per the design note that
//! flags "dynamic `any`-typed job payloads" for re-architecture.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    SendIntent { intent_id: String },
    FireRecurrence { rule_id: String },
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A delayed job: becomes runnable at `run_at`. `id` is client-chosen
/// (the Scheduling Service uses `intent-<intentID>`) and deduplicates
/// against other pending jobs with the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_delayed(id: impl Into<String>, kind: JobKind, run_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind,
            run_at,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at <= now
    }
}

/// `{pattern | everyMS}` recurring emitter installed via `UpsertSchedule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulePattern {
    Cron(String),
    EveryMs(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub pattern: SchedulePattern,
    pub end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<u32>,
    pub occurrence_count: u32,
    pub job_template: JobKind,
    pub last_fired_at: Option<DateTime<Utc>>,
}
