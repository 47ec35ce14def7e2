//! State Store
//!
//! A transactional relational store over `rusqlite`, the single source of
//! truth for Intents, RecurrenceRules, and the credential vault's
//! ciphertext rows. Writers serialize through one connection guarded by a
//! mutex (single-writer semantics); every multi-row mutation runs inside a
//! `rusqlite` transaction so partial writes are never observable. Blocking
//! SQLite calls are dispatched via `spawn_blocking` so they never stall the
//! async runtime.

mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, OptionExt, Result};
use crate::model::{
    Intent, IntentStatus, Media, MediaKind, Recipient, RecurrenceKind, RecurrenceRule,
    RecurrenceSchedule,
};

#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (creating if absent) a SQLite database at `path` and run all
    /// pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::internal(e.to_string()))?;
            }
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            Ok(conn)
        })
        .await
        .map_err(|e| EngineError::internal(e.to_string()))??;

        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate().await?;
        Ok(store)
    }

    /// Idempotent schema creation/upgrade, run once at boot.
    pub async fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            for stmt in schema::MIGRATIONS {
                conn.execute_batch(stmt)?;
            }
            Ok(())
        })
        .await
    }

    fn with_conn<T, F>(&self, f: F) -> impl std::future::Future<Output = Result<T>>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        async move {
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock();
                f(&guard)
            })
            .await
            .map_err(|e| EngineError::internal(e.to_string()))?
        }
    }

    // ---- Intents ------------------------------------------------------

    pub async fn create_intent(&self, intent: Intent) -> Result<Intent> {
        self.with_conn(move |conn| {
            insert_intent(conn, &intent)?;
            Ok(intent)
        })
        .await
    }

    pub async fn find_intent(&self, id: &str) -> Result<Option<Intent>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(SELECT_INTENT, params![id], row_to_intent)
                .optional()
                .map_err(EngineError::from)
        })
        .await
    }

    /// Atomically update one intent row's status plus any accompanying
    /// fields, but only when the row is still in `expected_status` (or
    /// `expected_status` is `None` to skip the guard). Returns the updated
    /// row, or `Ok(None)` if the guard didn't match (no-op, per the
    /// "first committer wins" rule).
    pub async fn update_intent_status(
        &self,
        id: &str,
        expected_status: Option<IntentStatus>,
        update: IntentStatusUpdate,
    ) -> Result<Option<Intent>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let current: Option<Intent> = tx
                .query_row(SELECT_INTENT, params![id], row_to_intent)
                .optional()?;
            let Some(mut intent) = current else { return Ok(None) };

            if let Some(expected) = expected_status {
                if intent.status != expected {
                    return Ok(None);
                }
            }

            intent.status = update.status;
            intent.updated_at = Utc::now();
            if let Some(v) = update.provider_message_id {
                intent.provider_message_id = Some(v);
            }
            if let Some(v) = update.sent_at {
                intent.sent_at = Some(v);
            }
            if let Some(v) = update.delivered_at {
                intent.delivered_at = Some(v);
            }
            if let Some(v) = update.failed_at {
                intent.failed_at = Some(v);
            }
            if update.clear_failure {
                intent.failure_reason = None;
                intent.failed_at = None;
            }
            if let Some(v) = update.failure_reason {
                intent.failure_reason = Some(v);
            }
            if let Some(v) = update.scheduled_at {
                intent.scheduled_at = v;
            }
            if update.increment_attempts {
                intent.attempts += 1;
            }
            if update.reset_attempts {
                intent.attempts = 0;
            }

            update_intent_row(&tx, &intent)?;
            tx.commit()?;
            Ok(Some(intent))
        })
        .await
    }

    pub async fn edit_intent(
        &self,
        id: &str,
        content: Option<String>,
        scheduled_at: Option<DateTime<Utc>>,
        media: Option<Option<Media>>,
    ) -> Result<Intent> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let mut intent: Intent = tx
                .query_row(SELECT_INTENT, params![id], row_to_intent)
                .optional()?
                .ok_or_not_found(format!("intent {id}"))?;

            if intent.status != IntentStatus::Pending {
                return Err(EngineError::conflict("only pending intents can be edited"));
            }

            if let Some(content) = content {
                intent.content = content;
            }
            if let Some(scheduled_at) = scheduled_at {
                intent.scheduled_at = scheduled_at;
            }
            if let Some(media) = media {
                intent.media = media;
            }
            intent.updated_at = Utc::now();

            update_intent_row(&tx, &intent)?;
            tx.commit()?;
            Ok(intent)
        })
        .await
    }

    /// Count intents sent or delivered with `sent_at` in `[window_start,
    /// window_end)`, used by the Rate Limiter.
    pub async fn count_terminal_success_in(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<u32> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM intents
                 WHERE status IN ('sent', 'delivered')
                   AND sent_at >= ?1 AND sent_at < ?2",
                params![window_start.to_rfc3339(), window_end.to_rfc3339()],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
        .await
    }

    pub async fn list_by_provider_message_id(&self, provider_message_id: &str) -> Result<Vec<Intent>> {
        let id = provider_message_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM intents WHERE provider_message_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![id], row_to_intent)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_intents(&self, filter: IntentFilter) -> Result<Vec<Intent>> {
        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT * FROM intents WHERE 1=1");
            let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                binds.push(Box::new(status.as_str().to_string()));
            }
            if let Some(contact_ref) = &filter.contact_ref {
                if filter.phone_mode_exclude {
                    sql.push_str(" AND recipient_ref != ?");
                } else {
                    sql.push_str(" AND recipient_ref = ?");
                }
                binds.push(Box::new(contact_ref.clone()));
            }
            sql.push_str(" ORDER BY scheduled_at ASC LIMIT ? OFFSET ?");
            binds.push(Box::new(filter.limit.min(200) as i64));
            binds.push(Box::new(filter.offset as i64));

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                binds.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(params_refs.as_slice(), row_to_intent)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn delete_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[IntentStatus],
    ) -> Result<u32> {
        let cutoff = cutoff.to_rfc3339();
        let statuses: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.with_conn(move |conn| {
            let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "DELETE FROM intents WHERE sent_at < ? AND status IN ({placeholders})"
            );
            let mut stmt_params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(cutoff)];
            stmt_params.extend(statuses.iter().map(|s| -> Box<dyn rusqlite::ToSql> { Box::new(s.to_string()) }));
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                stmt_params.iter().map(|b| b.as_ref()).collect();
            let n = conn.execute(&sql, params_refs.as_slice())?;
            Ok(n as u32)
        })
        .await
    }

    /// Create a fresh Intent from a firing rule and mark the rule fired, in
    /// a single transaction (spec's "creating an Intent and marking a
    /// RecurrenceRule as fired must be atomic").
    pub async fn create_intent_and_mark_rule_fired(
        &self,
        intent: Intent,
        rule_id: &str,
        fired_at: DateTime<Utc>,
        auto_disable: bool,
    ) -> Result<Intent> {
        let rule_id = rule_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            insert_intent(&tx, &intent)?;
            tx.execute(
                "UPDATE recurrence_rules
                 SET occurrence_count = occurrence_count + 1,
                     last_fired_at = ?1,
                     enabled = CASE WHEN ?2 THEN 0 ELSE enabled END,
                     updated_at = ?1
                 WHERE id = ?3",
                params![fired_at.to_rfc3339(), auto_disable, rule_id],
            )?;
            tx.commit()?;
            Ok(intent)
        })
        .await
    }

    // ---- Recurrence rules ----------------------------------------------

    pub async fn create_rule(&self, rule: RecurrenceRule) -> Result<RecurrenceRule> {
        self.with_conn(move |conn| {
            insert_rule(conn, &rule)?;
            Ok(rule)
        })
        .await
    }

    pub async fn find_rule(&self, id: &str) -> Result<Option<RecurrenceRule>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(SELECT_RULE, params![id], row_to_rule)
                .optional()
                .map_err(EngineError::from)
        })
        .await
    }

    /// The single active birthday rule for a contact, if any (enforces the
    /// "at most one birthday rule per contact" invariant at the call site).
    pub async fn find_birthday_rule(&self, contact_id: &str) -> Result<Option<RecurrenceRule>> {
        let contact_id = contact_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM recurrence_rules WHERE contact_id = ?1 AND kind = 'birthday'",
                params![contact_id],
                row_to_rule,
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    pub async fn update_rule(&self, rule: RecurrenceRule) -> Result<RecurrenceRule> {
        self.with_conn(move |conn| {
            update_rule_row(conn, &rule)?;
            Ok(rule)
        })
        .await
    }

    pub async fn list_rules(&self, contact_id: Option<&str>) -> Result<Vec<RecurrenceRule>> {
        let contact_id = contact_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let rows = match contact_id {
                Some(cid) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM recurrence_rules WHERE contact_id = ?1 ORDER BY created_at ASC",
                    )?;
                    let result = stmt
                        .query_map(params![cid], row_to_rule)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
                None => {
                    let mut stmt =
                        conn.prepare("SELECT * FROM recurrence_rules ORDER BY created_at ASC")?;
                    let result = stmt
                        .query_map([], row_to_rule)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    result
                }
            };
            Ok(rows)
        })
        .await
    }

    /// Hard-delete a rule, nulling the back-reference on any intents it
    /// produced (historical records are preserved).
    pub async fn delete_rule(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM recurrence_rules WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// Cascades a contact's removal to its intents and rules, per the
    /// design's foreign-key semantics.
    pub async fn delete_by_contact(&self, contact_id: &str) -> Result<()> {
        let contact_id = contact_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM intents WHERE recipient_ref = ?1",
                params![contact_id],
            )?;
            tx.execute(
                "DELETE FROM recurrence_rules WHERE contact_id = ?1",
                params![contact_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // ---- Credential vault table -----------------------------------------

    pub async fn get_credential(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT ciphertext FROM credential_vault WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(EngineError::from)
        })
        .await
    }

    pub async fn set_credential(&self, key: &str, ciphertext: &str) -> Result<()> {
        let key = key.to_string();
        let ciphertext = ciphertext.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO credential_vault (key, ciphertext, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET ciphertext = excluded.ciphertext, updated_at = excluded.updated_at",
                params![key, ciphertext, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_credentials(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM credential_vault", [])?;
            Ok(())
        })
        .await
    }
}

/// Fields an [`StateStore::update_intent_status`] caller wants applied
/// alongside the status change.
#[derive(Debug, Default)]
pub struct IntentStatusUpdate {
    pub status: IntentStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub clear_failure: bool,
    pub increment_attempts: bool,
    pub reset_attempts: bool,
}

impl IntentStatusUpdate {
    pub fn to(status: IntentStatus) -> Self {
        Self { status, ..Default::default() }
    }
}

impl Default for IntentStatus {
    fn default() -> Self {
        IntentStatus::Pending
    }
}

#[derive(Debug, Default, Clone)]
pub struct IntentFilter {
    pub status: Option<IntentStatus>,
    pub contact_ref: Option<String>,
    pub phone_mode_exclude: bool,
    pub limit: u32,
    pub offset: u32,
}

const SELECT_INTENT: &str = "SELECT * FROM intents WHERE id = ?1";
const SELECT_RULE: &str = "SELECT * FROM recurrence_rules WHERE id = ?1";

fn insert_intent(conn: &Connection, intent: &Intent) -> rusqlite::Result<()> {
    let (recipient_kind, recipient_ref) = recipient_columns(&intent.recipient);
    let (media_url, media_kind) = media_columns(&intent.media);
    conn.execute(
        "INSERT INTO intents (
            id, recipient_kind, recipient_ref, content, media_url, media_kind,
            scheduled_at, status, provider_message_id, sent_at, delivered_at,
            failed_at, failure_reason, attempts, recurrence_rule_id,
            created_at, updated_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
        params![
            intent.id,
            recipient_kind,
            recipient_ref,
            intent.content,
            media_url,
            media_kind,
            intent.scheduled_at.to_rfc3339(),
            intent.status.as_str(),
            intent.provider_message_id,
            intent.sent_at.map(|t| t.to_rfc3339()),
            intent.delivered_at.map(|t| t.to_rfc3339()),
            intent.failed_at.map(|t| t.to_rfc3339()),
            intent.failure_reason,
            intent.attempts,
            intent.recurrence_rule_id,
            intent.created_at.to_rfc3339(),
            intent.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn update_intent_row(conn: &Connection, intent: &Intent) -> rusqlite::Result<()> {
    let (media_url, media_kind) = media_columns(&intent.media);
    conn.execute(
        "UPDATE intents SET
            content = ?1, media_url = ?2, media_kind = ?3, scheduled_at = ?4,
            status = ?5, provider_message_id = ?6, sent_at = ?7, delivered_at = ?8,
            failed_at = ?9, failure_reason = ?10, attempts = ?11, updated_at = ?12
         WHERE id = ?13",
        params![
            intent.content,
            media_url,
            media_kind,
            intent.scheduled_at.to_rfc3339(),
            intent.status.as_str(),
            intent.provider_message_id,
            intent.sent_at.map(|t| t.to_rfc3339()),
            intent.delivered_at.map(|t| t.to_rfc3339()),
            intent.failed_at.map(|t| t.to_rfc3339()),
            intent.failure_reason,
            intent.attempts,
            intent.updated_at.to_rfc3339(),
            intent.id,
        ],
    )?;
    Ok(())
}

fn insert_rule(conn: &Connection, rule: &RecurrenceRule) -> rusqlite::Result<()> {
    let (media_url, media_kind) = media_columns(&rule.media);
    let (cron, every_n) = schedule_columns(&rule.schedule);
    conn.execute(
        "INSERT INTO recurrence_rules (
            id, contact_id, kind, content, media_url, media_kind, cron_expression,
            every_n_days, end_date, max_occurrences, occurrence_count, enabled,
            last_fired_at, created_at, updated_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        params![
            rule.id,
            rule.recipient_contact_id,
            kind_str(rule.kind),
            rule.content,
            media_url,
            media_kind,
            cron,
            every_n,
            rule.end_date.map(|t| t.to_rfc3339()),
            rule.max_occurrences,
            rule.occurrence_count,
            rule.enabled,
            rule.last_fired_at.map(|t| t.to_rfc3339()),
            rule.created_at.to_rfc3339(),
            rule.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn update_rule_row(conn: &Connection, rule: &RecurrenceRule) -> rusqlite::Result<()> {
    let (media_url, media_kind) = media_columns(&rule.media);
    let (cron, every_n) = schedule_columns(&rule.schedule);
    conn.execute(
        "UPDATE recurrence_rules SET
            content = ?1, media_url = ?2, media_kind = ?3, cron_expression = ?4,
            every_n_days = ?5, end_date = ?6, max_occurrences = ?7,
            occurrence_count = ?8, enabled = ?9, last_fired_at = ?10, updated_at = ?11
         WHERE id = ?12",
        params![
            rule.content,
            media_url,
            media_kind,
            cron,
            every_n,
            rule.end_date.map(|t| t.to_rfc3339()),
            rule.max_occurrences,
            rule.occurrence_count,
            rule.enabled,
            rule.last_fired_at.map(|t| t.to_rfc3339()),
            rule.updated_at.to_rfc3339(),
            rule.id,
        ],
    )?;
    Ok(())
}

fn recipient_columns(recipient: &Recipient) -> (&'static str, String) {
    match recipient {
        Recipient::Contact(id) => ("contact", id.clone()),
        Recipient::Group(id) => ("group", id.clone()),
    }
}

fn media_columns(media: &Option<Media>) -> (Option<String>, Option<&'static str>) {
    match media {
        Some(m) => (Some(m.url.clone()), Some(m.kind.as_str())),
        None => (None, None),
    }
}

fn kind_str(kind: RecurrenceKind) -> &'static str {
    match kind {
        RecurrenceKind::Daily => "daily",
        RecurrenceKind::Weekly => "weekly",
        RecurrenceKind::Monthly => "monthly",
        RecurrenceKind::Yearly => "yearly",
        RecurrenceKind::Custom => "custom",
        RecurrenceKind::Birthday => "birthday",
    }
}

fn parse_kind(s: &str) -> rusqlite::Result<RecurrenceKind> {
    Ok(match s {
        "daily" => RecurrenceKind::Daily,
        "weekly" => RecurrenceKind::Weekly,
        "monthly" => RecurrenceKind::Monthly,
        "yearly" => RecurrenceKind::Yearly,
        "custom" => RecurrenceKind::Custom,
        "birthday" => RecurrenceKind::Birthday,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown recurrence kind: {other}"),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn schedule_columns(schedule: &RecurrenceSchedule) -> (Option<String>, Option<u32>) {
    match schedule {
        RecurrenceSchedule::Cron(expr) => (Some(expr.clone()), None),
        RecurrenceSchedule::EveryNDays(n) => (None, Some(*n)),
    }
}

fn parse_media(url: Option<String>, kind: Option<String>) -> rusqlite::Result<Option<Media>> {
    match (url, kind) {
        (Some(url), Some(kind)) => {
            let kind = match kind.as_str() {
                "image" => MediaKind::Image,
                "video" => MediaKind::Video,
                "audio" => MediaKind::Audio,
                "document" => MediaKind::Document,
                other => {
                    return Err(rusqlite::Error::InvalidColumnType(
                        0,
                        format!("unknown media kind: {other}"),
                        rusqlite::types::Type::Text,
                    ))
                }
            };
            Ok(Some(Media { url, kind }))
        }
        _ => Ok(None),
    }
}

fn parse_datetime(col: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match col {
        Some(s) => parse_datetime_required(&s).map(Some),
        None => Ok(None),
    }
}

/// Parses a NOT NULL timestamp column; `created_at`/`updated_at` and
/// `scheduled_at` never stored `NULL`, but a row written by a future schema
/// version could still hold malformed text, so this propagates rather than
/// panics.
fn parse_datetime_required(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn row_to_intent(row: &rusqlite::Row) -> rusqlite::Result<Intent> {
    let recipient_kind: String = row.get("recipient_kind")?;
    let recipient_ref: String = row.get("recipient_ref")?;
    let recipient = match recipient_kind.as_str() {
        "contact" => Recipient::Contact(recipient_ref),
        "group" => Recipient::Group(recipient_ref),
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("unknown recipient kind: {other}"),
                rusqlite::types::Type::Text,
            ))
        }
    };

    let status_str: String = row.get("status")?;
    let status = status_str
        .parse::<IntentStatus>()
        .map_err(|e| rusqlite::Error::InvalidColumnType(0, e, rusqlite::types::Type::Text))?;

    let scheduled_at: String = row.get("scheduled_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Intent {
        id: row.get("id")?,
        recipient,
        content: row.get("content")?,
        media: parse_media(row.get("media_url")?, row.get("media_kind")?)?,
        scheduled_at: parse_datetime_required(&scheduled_at)?,
        status,
        provider_message_id: row.get("provider_message_id")?,
        sent_at: parse_datetime(row.get("sent_at")?)?,
        delivered_at: parse_datetime(row.get("delivered_at")?)?,
        failed_at: parse_datetime(row.get("failed_at")?)?,
        failure_reason: row.get("failure_reason")?,
        attempts: row.get("attempts")?,
        recurrence_rule_id: row.get("recurrence_rule_id")?,
        created_at: parse_datetime_required(&created_at)?,
        updated_at: parse_datetime_required(&updated_at)?,
    })
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<RecurrenceRule> {
    let kind_str: String = row.get("kind")?;
    let kind = parse_kind(&kind_str)?;

    let cron: Option<String> = row.get("cron_expression")?;
    let every_n: Option<u32> = row.get("every_n_days")?;
    let schedule = match (cron, every_n) {
        (Some(expr), _) => RecurrenceSchedule::Cron(expr),
        (None, Some(n)) => RecurrenceSchedule::EveryNDays(n),
        (None, None) => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                "rule has neither cron_expression nor every_n_days".into(),
                rusqlite::types::Type::Text,
            ))
        }
    };

    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(RecurrenceRule {
        id: row.get("id")?,
        recipient_contact_id: row.get("contact_id")?,
        kind,
        content: row.get("content")?,
        media: parse_media(row.get("media_url")?, row.get("media_kind")?)?,
        schedule,
        end_date: parse_datetime(row.get("end_date")?)?,
        max_occurrences: row.get("max_occurrences")?,
        occurrence_count: row.get("occurrence_count")?,
        enabled: row.get("enabled")?,
        last_fired_at: parse_datetime(row.get("last_fired_at")?)?,
        created_at: parse_datetime_required(&created_at)?,
        updated_at: parse_datetime_required(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Intent;

    #[tokio::test]
    async fn intent_round_trips_through_store() {
        let store = StateStore::open_in_memory().await.unwrap();
        let intent = Intent::new_pending(
            Recipient::Contact("c1".into()),
            "hello".into(),
            None,
            Utc::now(),
        );
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        let found = store.find_intent(&id).await.unwrap().unwrap();
        assert_eq!(found.content, "hello");
        assert_eq!(found.status, IntentStatus::Pending);
    }

    #[tokio::test]
    async fn update_intent_status_respects_expected_guard() {
        let store = StateStore::open_in_memory().await.unwrap();
        let intent = Intent::new_pending(Recipient::Group("g1".into()), "hi".into(), None, Utc::now());
        let id = intent.id.clone();
        store.create_intent(intent).await.unwrap();

        let updated = store
            .update_intent_status(
                &id,
                Some(IntentStatus::Pending),
                IntentStatusUpdate {
                    status: IntentStatus::Cancelled,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.is_some());

        // Second attempt to cancel observes the terminal state already
        // committed and is a no-op.
        let second = store
            .update_intent_status(
                &id,
                Some(IntentStatus::Pending),
                IntentStatusUpdate::to(IntentStatus::Cancelled),
            )
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn count_terminal_success_counts_only_window() {
        let store = StateStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        let mut sent = Intent::new_pending(Recipient::Contact("c1".into()), "a".into(), None, now);
        sent.status = IntentStatus::Sent;
        sent.sent_at = Some(now);
        store.create_intent(sent).await.unwrap();

        let mut outside = Intent::new_pending(Recipient::Contact("c1".into()), "b".into(), None, now);
        outside.status = IntentStatus::Sent;
        outside.sent_at = Some(now - chrono::Duration::days(2));
        store.create_intent(outside).await.unwrap();

        let count = store
            .count_terminal_success_in(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn credential_upsert_round_trips() {
        let store = StateStore::open_in_memory().await.unwrap();
        store.set_credential("creds", "ciphertext-blob").await.unwrap();
        assert_eq!(
            store.get_credential("creds").await.unwrap(),
            Some("ciphertext-blob".to_string())
        );

        store.set_credential("creds", "new-blob").await.unwrap();
        assert_eq!(store.get_credential("creds").await.unwrap(), Some("new-blob".to_string()));
    }
}
