//! Schema DDL for the State Store. Indexes mirror the ones the design
//! calls out explicitly: `(status)`, `(scheduled_at)`,
//! `(provider_message_id)`, `(contact_id)` on intents; `(contact_id)`,
//! `(kind)` on recurrence rules.

pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS credential_vault (
        key TEXT PRIMARY KEY,
        ciphertext TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS recurrence_rules (
        id TEXT PRIMARY KEY,
        contact_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        media_url TEXT,
        media_kind TEXT,
        cron_expression TEXT,
        every_n_days INTEGER,
        end_date TEXT,
        max_occurrences INTEGER,
        occurrence_count INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_fired_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rules_contact ON recurrence_rules (contact_id);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_rules_kind ON recurrence_rules (kind);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS intents (
        id TEXT PRIMARY KEY,
        recipient_kind TEXT NOT NULL,
        recipient_ref TEXT NOT NULL,
        content TEXT NOT NULL,
        media_url TEXT,
        media_kind TEXT,
        scheduled_at TEXT NOT NULL,
        status TEXT NOT NULL,
        provider_message_id TEXT,
        sent_at TEXT,
        delivered_at TEXT,
        failed_at TEXT,
        failure_reason TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        recurrence_rule_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (recurrence_rule_id) REFERENCES recurrence_rules (id) ON DELETE SET NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_intents_status ON intents (status);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_intents_scheduled_at ON intents (scheduled_at);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_intents_provider_message_id ON intents (provider_message_id);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_intents_contact ON intents (recipient_ref);
    "#,
];
