//! SQLite store backend. One database file holds channels, conversations,
//! messages, and the processed-message window.

use super::{
    ChannelKind, ChannelRecord, ConversationDetail, ConversationSummary, CycleJournal,
    GatewayStore, Sender, StoredMessage,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    processed_cap: usize,
}

impl SqliteStore {
    pub fn open(path: &Path, processed_cap: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store DB: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS channels (
                tenant_id     TEXT NOT NULL,
                kind          TEXT NOT NULL,
                secret        TEXT NOT NULL,
                endpoint      TEXT NOT NULL,
                active        INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL,
                last_activity TEXT,
                PRIMARY KEY (tenant_id, kind)
             );

             CREATE TABLE IF NOT EXISTS conversations (
                id              TEXT PRIMARY KEY,
                tenant_id       TEXT NOT NULL,
                kind            TEXT NOT NULL,
                participant     TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'active',
                started_at      TEXT NOT NULL,
                last_message_at TEXT NOT NULL
             );
             CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_open
                ON conversations(tenant_id, kind, participant) WHERE status = 'active';
             CREATE INDEX IF NOT EXISTS idx_conversations_tenant
                ON conversations(tenant_id, last_message_at);

             CREATE TABLE IF NOT EXISTS messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                sender          TEXT NOT NULL,
                body            TEXT NOT NULL,
                sent_at         TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
             );
             CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id);

             CREATE TABLE IF NOT EXISTS processed_messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                message_ref TEXT NOT NULL,
                seen_at     TEXT NOT NULL,
                UNIQUE (tenant_id, kind, message_ref)
             );
             CREATE INDEX IF NOT EXISTS idx_processed_channel
                ON processed_messages(tenant_id, kind);",
        )
        .context("Failed to initialize store schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            processed_cap,
        })
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in store DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn sql_conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(err.into())
}

fn map_channel_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelRecord> {
    let endpoint_raw: String = row.get(3)?;
    let endpoint: serde_json::Value = serde_json::from_str(&endpoint_raw)
        .map_err(|e| sql_conversion_error(anyhow::Error::new(e)))?;
    let created_at_raw: String = row.get(5)?;
    let last_activity_raw: Option<String> = row.get(6)?;

    Ok(ChannelRecord {
        tenant_id: row.get(0)?,
        kind: row.get(1)?,
        secret: row.get(2)?,
        endpoint,
        active: row.get::<_, i64>(4)? != 0,
        created_at: parse_rfc3339(&created_at_raw).map_err(sql_conversion_error)?,
        last_activity: match last_activity_raw {
            Some(raw) => Some(parse_rfc3339(&raw).map_err(sql_conversion_error)?),
            None => None,
        },
    })
}

fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    let started_raw: String = row.get(5)?;
    let last_raw: String = row.get(6)?;
    Ok(ConversationSummary {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        kind: row.get(2)?,
        participant: row.get(3)?,
        status: row.get(4)?,
        started_at: parse_rfc3339(&started_raw).map_err(sql_conversion_error)?,
        last_message_at: parse_rfc3339(&last_raw).map_err(sql_conversion_error)?,
    })
}

const CHANNEL_COLUMNS: &str =
    "tenant_id, kind, secret, endpoint, active, created_at, last_activity";
const SUMMARY_COLUMNS: &str =
    "id, tenant_id, kind, participant, status, started_at, last_message_at";

/// Find-or-create the open conversation and append the turn. Runs inside
/// whatever transaction the caller holds.
fn append_turn(
    conn: &Connection,
    tenant_id: &str,
    kind: ChannelKind,
    participant: &str,
    user_text: &str,
    agent_text: Option<&str>,
) -> Result<String> {
    let now = Utc::now().to_rfc3339();

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM conversations
             WHERE tenant_id = ?1 AND kind = ?2 AND participant = ?3 AND status = 'active'",
            params![tenant_id, kind.as_str(), participant],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up open conversation")?;

    let conversation_id = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to bump conversation activity")?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO conversations
                    (id, tenant_id, kind, participant, status, started_at, last_message_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
                params![id, tenant_id, kind.as_str(), participant, now],
            )
            .context("Failed to create conversation")?;
            id
        }
    };

    conn.execute(
        "INSERT INTO messages (conversation_id, sender, body, sent_at)
         VALUES (?1, 'user', ?2, ?3)",
        params![conversation_id, user_text, now],
    )
    .context("Failed to insert user message")?;

    if let Some(reply) = agent_text {
        conn.execute(
            "INSERT INTO messages (conversation_id, sender, body, sent_at)
             VALUES (?1, 'agent', ?2, ?3)",
            params![conversation_id, reply, now],
        )
        .context("Failed to insert agent message")?;
    }

    Ok(conversation_id)
}

/// Remember a ref, then trim the window back to `cap` newest rows.
fn mark_processed_inner(
    conn: &Connection,
    tenant_id: &str,
    kind: ChannelKind,
    message_ref: &str,
    cap: usize,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO processed_messages (tenant_id, kind, message_ref, seen_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![tenant_id, kind.as_str(), message_ref, Utc::now().to_rfc3339()],
    )
    .context("Failed to insert processed ref")?;

    let keep = i64::try_from(cap.max(1)).context("Processed cache size overflows i64")?;
    conn.execute(
        "DELETE FROM processed_messages
         WHERE tenant_id = ?1 AND kind = ?2
           AND id NOT IN (
             SELECT id FROM processed_messages
             WHERE tenant_id = ?1 AND kind = ?2
             ORDER BY id DESC
             LIMIT ?3
           )",
        params![tenant_id, kind.as_str(), keep],
    )
    .context("Failed to prune processed refs")?;
    Ok(())
}

fn touch_channel_inner(conn: &Connection, tenant_id: &str, kind: ChannelKind) -> Result<()> {
    conn.execute(
        "UPDATE channels SET last_activity = ?1 WHERE tenant_id = ?2 AND kind = ?3",
        params![Utc::now().to_rfc3339(), tenant_id, kind.as_str()],
    )
    .context("Failed to stamp channel activity")?;
    Ok(())
}

#[async_trait]
impl GatewayStore for SqliteStore {
    async fn upsert_channel(&self, record: ChannelRecord) -> Result<()> {
        let conn = self.conn.lock();
        let endpoint =
            serde_json::to_string(&record.endpoint).context("Failed to encode endpoint JSON")?;
        conn.execute(
            "INSERT INTO channels (tenant_id, kind, secret, endpoint, active, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (tenant_id, kind) DO UPDATE SET
                secret = excluded.secret,
                endpoint = excluded.endpoint,
                active = excluded.active",
            params![
                record.tenant_id,
                record.kind.as_str(),
                record.secret,
                endpoint,
                if record.active { 1 } else { 0 },
                record.created_at.to_rfc3339(),
                record.last_activity.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to upsert channel")?;
        Ok(())
    }

    async fn channel(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
    ) -> Result<Option<ChannelRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE tenant_id = ?1 AND kind = ?2"),
            params![tenant_id, kind.as_str()],
            map_channel_row,
        )
        .optional()
        .context("Failed to read channel")
    }

    async fn tenant_channels(&self, tenant_id: &str) -> Result<Vec<ChannelRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE tenant_id = ?1 ORDER BY kind"
        ))?;
        let rows = stmt.query_map(params![tenant_id], map_channel_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn set_channel_active(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        active: bool,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE channels SET active = ?1 WHERE tenant_id = ?2 AND kind = ?3",
                params![if active { 1 } else { 0 }, tenant_id, kind.as_str()],
            )
            .context("Failed to update channel activation")?;
        Ok(changed > 0)
    }

    async fn touch_channel_activity(&self, tenant_id: &str, kind: ChannelKind) -> Result<()> {
        let conn = self.conn.lock();
        touch_channel_inner(&conn, tenant_id, kind)
    }

    async fn active_channels(&self, kind: ChannelKind) -> Result<Vec<ChannelRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels
             WHERE kind = ?1 AND active = 1
             ORDER BY tenant_id"
        ))?;
        let rows = stmt.query_map(params![kind.as_str()], map_channel_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn record_turn(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        participant: &str,
        user_text: &str,
        agent_text: Option<&str>,
    ) -> Result<String> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let conversation_id = append_turn(&tx, tenant_id, kind, participant, user_text, agent_text)?;
        tx.commit().context("Failed to commit turn")?;
        Ok(conversation_id)
    }

    async fn conversations(&self, tenant_id: &str) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM conversations
             WHERE tenant_id = ?1
             ORDER BY last_message_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![tenant_id], map_summary_row)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    async fn conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationDetail>> {
        let conn = self.conn.lock();
        let summary = conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM conversations
                     WHERE id = ?1 AND tenant_id = ?2"
                ),
                params![conversation_id, tenant_id],
                map_summary_row,
            )
            .optional()
            .context("Failed to read conversation")?;

        let Some(summary) = summary else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT sender, body, sent_at FROM messages
             WHERE conversation_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            let sender_raw: String = row.get(0)?;
            let sent_raw: String = row.get(2)?;
            Ok(StoredMessage {
                sender: Sender::parse(&sender_raw).ok_or_else(|| {
                    sql_conversion_error(anyhow::anyhow!("unknown sender in DB: {sender_raw}"))
                })?,
                body: row.get(1)?,
                sent_at: parse_rfc3339(&sent_raw).map_err(sql_conversion_error)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(Some(ConversationDetail { summary, messages }))
    }

    async fn is_processed(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        message_ref: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM processed_messages
                 WHERE tenant_id = ?1 AND kind = ?2 AND message_ref = ?3",
                params![tenant_id, kind.as_str(), message_ref],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check processed ref")?;
        Ok(found.is_some())
    }

    async fn mark_processed(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        message_ref: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        mark_processed_inner(&tx, tenant_id, kind, message_ref, self.processed_cap)?;
        tx.commit().context("Failed to commit processed ref")
    }

    async fn commit_cycle(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        journal: CycleJournal,
    ) -> Result<()> {
        if journal.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        // One transaction per cycle: a crash mid-commit rolls the whole
        // cycle back and the messages stay eligible for the next poll.
        let tx = conn.unchecked_transaction()?;
        for turn in &journal.turns {
            append_turn(
                &tx,
                tenant_id,
                kind,
                &turn.participant,
                &turn.user_text,
                turn.agent_text.as_deref(),
            )?;
        }
        for message_ref in &journal.processed {
            mark_processed_inner(&tx, tenant_id, kind, message_ref, self.processed_cap)?;
        }
        if journal.touched {
            touch_channel_inner(&tx, tenant_id, kind)?;
        }
        tx.commit().context("Failed to commit poll cycle")
    }
}

#[cfg(test)]
mod tests {
    use super::super::JournalTurn;
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> SqliteStore {
        SqliteStore::open(&tmp.path().join("gateway.db"), 16).unwrap()
    }

    fn record(tenant: &str, kind: ChannelKind) -> ChannelRecord {
        ChannelRecord {
            tenant_id: tenant.to_string(),
            kind,
            secret: "enc1:deadbeef".to_string(),
            endpoint: serde_json::json!({
                "imap_host": "imap.example.com",
                "imap_port": 993,
                "address": "support@acme.example"
            }),
            active: true,
            created_at: Utc::now(),
            last_activity: None,
        }
    }

    #[tokio::test]
    async fn channel_roundtrip_preserves_endpoint_json() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.upsert_channel(record("t1", ChannelKind::Email)).await.unwrap();

        let stored = store.channel("t1", ChannelKind::Email).await.unwrap().unwrap();
        assert_eq!(stored.endpoint["imap_host"], "imap.example.com");
        assert_eq!(stored.endpoint["imap_port"], 993);
        assert!(stored.active);
    }

    #[tokio::test]
    async fn upsert_keeps_created_at_on_reconnect() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.upsert_channel(record("t1", ChannelKind::Bot)).await.unwrap();
        let original = store.channel("t1", ChannelKind::Bot).await.unwrap().unwrap();

        let mut replacement = record("t1", ChannelKind::Bot);
        replacement.secret = "enc1:rotated".to_string();
        store.upsert_channel(replacement).await.unwrap();

        let updated = store.channel("t1", ChannelKind::Bot).await.unwrap().unwrap();
        assert_eq!(updated.secret, "enc1:rotated");
        assert_eq!(
            updated.created_at.timestamp(),
            original.created_at.timestamp()
        );
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gateway.db");
        {
            let store = SqliteStore::open(&path, 16).unwrap();
            store.upsert_channel(record("t1", ChannelKind::Email)).await.unwrap();
            store
                .record_turn("t1", ChannelKind::Email, "a@ex.com", "hi", Some("hello"))
                .await
                .unwrap();
            store
                .mark_processed("t1", ChannelKind::Email, "<m1@ex>")
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path, 16).unwrap();
        assert!(store.channel("t1", ChannelKind::Email).await.unwrap().is_some());
        assert_eq!(store.conversations("t1").await.unwrap().len(), 1);
        assert!(store.is_processed("t1", ChannelKind::Email, "<m1@ex>").await.unwrap());
    }

    #[tokio::test]
    async fn same_participant_threads_into_one_conversation() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let first = store
            .record_turn("t1", ChannelKind::Business, "971501234567", "hi", Some("hello!"))
            .await
            .unwrap();
        let second = store
            .record_turn("t1", ChannelKind::Business, "971501234567", "again", Some("yes"))
            .await
            .unwrap();
        assert_eq!(first, second);

        let detail = store.conversation("t1", &first).await.unwrap().unwrap();
        assert_eq!(detail.messages.len(), 4);
        assert_eq!(detail.messages[0].sender, Sender::User);
        assert_eq!(detail.messages[3].sender, Sender::Agent);
    }

    #[tokio::test]
    async fn conversation_lookup_is_tenant_scoped() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let id = store
            .record_turn("tenant-a", ChannelKind::Email, "x@example.com", "hi", None)
            .await
            .unwrap();

        assert!(store.conversation("tenant-b", &id).await.unwrap().is_none());
        assert!(store.conversation("tenant-a", &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn processed_window_prunes_old_refs() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("gateway.db"), 2).unwrap();
        for i in 0..4 {
            store
                .mark_processed("t1", ChannelKind::Email, &format!("<m{i}>"))
                .await
                .unwrap();
        }
        assert!(!store.is_processed("t1", ChannelKind::Email, "<m0>").await.unwrap());
        assert!(!store.is_processed("t1", ChannelKind::Email, "<m1>").await.unwrap());
        assert!(store.is_processed("t1", ChannelKind::Email, "<m2>").await.unwrap());
        assert!(store.is_processed("t1", ChannelKind::Email, "<m3>").await.unwrap());
    }

    #[tokio::test]
    async fn processed_window_is_per_channel() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.mark_processed("t1", ChannelKind::Email, "<m@ex>").await.unwrap();

        assert!(!store.is_processed("t2", ChannelKind::Email, "<m@ex>").await.unwrap());
        assert!(!store.is_processed("t1", ChannelKind::Bot, "<m@ex>").await.unwrap());
    }

    #[tokio::test]
    async fn commit_cycle_is_atomic_and_touches_channel() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.upsert_channel(record("t1", ChannelKind::Email)).await.unwrap();

        let journal = CycleJournal {
            turns: vec![JournalTurn {
                participant: "a@example.com".into(),
                user_text: "question".into(),
                agent_text: Some("answer".into()),
            }],
            processed: vec!["<m1@ex>".into()],
            touched: true,
        };
        store.commit_cycle("t1", ChannelKind::Email, journal).await.unwrap();

        let summaries = store.conversations("t1").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(store.is_processed("t1", ChannelKind::Email, "<m1@ex>").await.unwrap());
        let channel = store.channel("t1", ChannelKind::Email).await.unwrap().unwrap();
        assert!(channel.last_activity.is_some());
    }

    #[tokio::test]
    async fn active_channels_filters_kind_and_activation() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        store.upsert_channel(record("t1", ChannelKind::Email)).await.unwrap();
        store.upsert_channel(record("t2", ChannelKind::Email)).await.unwrap();
        store.upsert_channel(record("t3", ChannelKind::Bot)).await.unwrap();
        store.set_channel_active("t2", ChannelKind::Email, false).await.unwrap();

        let active = store.active_channels(ChannelKind::Email).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tenant_id, "t1");
    }
}
