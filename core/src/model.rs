//! Core data model: Intent, RecurrenceRule, and the small value types they
//! share. Mirrors the fields the State Store persists; every status
//! transition is driven by the Dispatcher, Delivery Listener, or an
//! explicit Scheduling Service call, never by ad hoc mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Either half of an exactly-one-of recipient reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Contact(String),
    Group(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl IntentStatus {
    /// Terminal statuses are sticky except `Failed -> Pending` via Retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Sent | IntentStatus::Delivered | IntentStatus::Failed | IntentStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Sent => "sent",
            IntentStatus::Delivered => "delivered",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "sent" => Ok(IntentStatus::Sent),
            "delivered" => Ok(IntentStatus::Delivered),
            "failed" => Ok(IntentStatus::Failed),
            "cancelled" => Ok(IntentStatus::Cancelled),
            other => Err(format!("unknown intent status: {other}")),
        }
    }
}

/// One scheduled or immediate send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub recipient: Recipient,
    pub content: String,
    pub media: Option<Media>,
    pub scheduled_at: DateTime<Utc>,
    pub status: IntentStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub recurrence_rule_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    pub fn new_pending(recipient: Recipient, content: String, media: Option<Media>, scheduled_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            recipient,
            content,
            media,
            scheduled_at,
            status: IntentStatus::Pending,
            provider_message_id: None,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            failure_reason: None,
            attempts: 0,
            recurrence_rule_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An intent is dispatched immediately when its schedule is absent or
    /// already due.
    pub fn is_immediate(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Custom,
    Birthday,
}

/// Either a cron expression or a plain interval, mutually exclusive per
/// `RecurrenceKind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceSchedule {
    Cron(String),
    EveryNDays(u32),
}

/// Template producing intents on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub id: String,
    pub recipient_contact_id: String,
    pub kind: RecurrenceKind,
    pub content: String,
    pub media: Option<Media>,
    pub schedule: RecurrenceSchedule,
    pub end_date: Option<DateTime<Utc>>,
    pub max_occurrences: Option<u32>,
    pub occurrence_count: u32,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurrenceRule {
    /// Whether the rule should still produce firings: enabled, under its
    /// occurrence cap, and not past its end date.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(max) = self.max_occurrences {
            if self.occurrence_count >= max {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if now > end {
                return false;
            }
        }
        true
    }
}

/// Rate-limiter snapshot returned alongside scheduling responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub sent_today: u32,
    pub daily_cap: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub warning: bool,
}
