//! Conversation store: channels, threads, and duplicate suppression.
//!
//! Everything a tenant accumulates lives behind the [`GatewayStore`] trait so
//! the rest of the system never cares whether it is talking to SQLite or the
//! in-memory backend. Conversations thread by (tenant, channel, participant):
//! a message from a known participant lands in their open conversation, a new
//! participant opens a fresh one.

pub mod dedup;
pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The three channel families a tenant can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// IMAP mailbox polled for inbound mail, replies over SMTP.
    Email,
    /// Bot-platform webhook (push), replies over the platform send API.
    Bot,
    /// Business-messaging webhook (push), replies over the platform send API.
    Business,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Bot => "bot",
            Self::Business => "business",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "bot" => Some(Self::Bot),
            "business" => Some(Self::Business),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl rusqlite::types::FromSql for ChannelKind {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let text = value.as_str()?;
        ChannelKind::parse(text).ok_or_else(|| {
            rusqlite::types::FromSqlError::Other(
                format!("unknown channel kind in DB: {text}").into(),
            )
        })
    }
}

/// A tenant's connection to one channel. At most one record per
/// (tenant, kind); reconnecting replaces credentials in place.
///
/// `secret` holds the vault-sealed credential. The struct does not
/// implement `Serialize`; read paths build explicit views so the sealed
/// secret cannot reach a response body.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub tenant_id: String,
    pub kind: ChannelKind,
    pub secret: String,
    /// Non-secret endpoint settings (hosts, ports, addresses, verify token).
    pub endpoint: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Which side of the conversation wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Agent,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Conversation header without its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub tenant_id: String,
    pub kind: ChannelKind,
    /// Stable per-channel participant id: email address, chat id, or phone.
    pub participant: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// One stored conversation turn half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sender: Sender,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A conversation with its full message history, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub messages: Vec<StoredMessage>,
}

/// One buffered turn from an email poll cycle.
#[derive(Debug, Clone)]
pub struct JournalTurn {
    pub participant: String,
    pub user_text: String,
    /// None when the reply was skipped (generation failed, quota refused the
    /// send but the message still threads, etc.).
    pub agent_text: Option<String>,
}

/// State changes accumulated over one email poll cycle and committed in a
/// single batch, so a crash mid-cycle never leaves half a cycle behind.
#[derive(Debug, Default)]
pub struct CycleJournal {
    pub turns: Vec<JournalTurn>,
    /// Message refs to remember for duplicate suppression.
    pub processed: Vec<String>,
    /// Whether the channel handled anything and its activity stamp moves.
    pub touched: bool,
}

impl CycleJournal {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.processed.is_empty() && !self.touched
    }
}

/// Persistence seam for the whole gateway.
///
/// Every method is tenant-scoped: lookups take the tenant id and return
/// nothing for other tenants' rows, so a caller holding the wrong id reads
/// absence, not someone else's data.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    /// Insert or replace the channel record for (tenant, kind).
    async fn upsert_channel(&self, record: ChannelRecord) -> Result<()>;

    async fn channel(&self, tenant_id: &str, kind: ChannelKind)
        -> Result<Option<ChannelRecord>>;

    /// All channel records for one tenant, any kind.
    async fn tenant_channels(&self, tenant_id: &str) -> Result<Vec<ChannelRecord>>;

    /// Flip activation. Returns false when no such channel exists.
    async fn set_channel_active(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        active: bool,
    ) -> Result<bool>;

    /// Stamp last_activity with the current time.
    async fn touch_channel_activity(&self, tenant_id: &str, kind: ChannelKind) -> Result<()>;

    /// Every active channel of one kind across all tenants. Feeds the email
    /// poll scheduler.
    async fn active_channels(&self, kind: ChannelKind) -> Result<Vec<ChannelRecord>>;

    /// Append a user message (and the agent reply, when there is one) to the
    /// participant's open conversation, creating it if needed. Returns the
    /// conversation id.
    async fn record_turn(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        participant: &str,
        user_text: &str,
        agent_text: Option<&str>,
    ) -> Result<String>;

    async fn conversations(&self, tenant_id: &str) -> Result<Vec<ConversationSummary>>;

    /// Tenant-scoped lookup: an id belonging to another tenant yields None.
    async fn conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationDetail>>;

    async fn is_processed(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        message_ref: &str,
    ) -> Result<bool>;

    /// Remember a handled message ref. Only the most recent refs are kept
    /// per channel; ancient ones age out.
    async fn mark_processed(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        message_ref: &str,
    ) -> Result<()>;

    /// Apply a whole poll cycle's worth of changes at once.
    async fn commit_cycle(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        journal: CycleJournal,
    ) -> Result<()>;
}

/// Factory: create the configured store backend.
pub fn create_store(config: &Config) -> Result<Arc<dyn GatewayStore>> {
    let cap = config.store.processed_cache_size;
    match config.store.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new(cap))),
        _ => Ok(Arc::new(SqliteStore::open(&config.store_path(), cap)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_kind_parse_roundtrip() {
        for kind in [ChannelKind::Email, ChannelKind::Bot, ChannelKind::Business] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::parse("EMAIL"), Some(ChannelKind::Email));
        assert_eq!(ChannelKind::parse(" bot "), Some(ChannelKind::Bot));
        assert_eq!(ChannelKind::parse("sms"), None);
    }

    #[test]
    fn sender_parse_rejects_unknown() {
        assert_eq!(Sender::parse("user"), Some(Sender::User));
        assert_eq!(Sender::parse("agent"), Some(Sender::Agent));
        assert_eq!(Sender::parse("system"), None);
    }

    #[test]
    fn factory_honors_memory_backend() {
        let mut config = Config::default();
        config.store.backend = "memory".into();
        let store = create_store(&config).unwrap();
        // Smoke: the trait object is usable.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            assert!(store
                .channel("nobody", ChannelKind::Email)
                .await
                .unwrap()
                .is_none());
        });
    }

    #[test]
    fn cycle_journal_empty_detection() {
        let journal = CycleJournal::default();
        assert!(journal.is_empty());

        let journal = CycleJournal {
            touched: true,
            ..CycleJournal::default()
        };
        assert!(!journal.is_empty());
    }
}
