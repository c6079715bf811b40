//! In-memory store backend. State lives for the process lifetime only;
//! suited to tests and throwaway deployments.

use super::dedup::ProcessedRing;
use super::{
    ChannelKind, ChannelRecord, ConversationDetail, ConversationSummary, CycleJournal,
    GatewayStore, Sender, StoredMessage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

struct StoredConversation {
    summary: ConversationSummary,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<(String, ChannelKind), ChannelRecord>,
    conversations: Vec<StoredConversation>,
    processed: HashMap<(String, ChannelKind), ProcessedRing>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    processed_cap: usize,
}

impl MemoryStore {
    pub fn new(processed_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            processed_cap,
        }
    }
}

fn append_turn(
    inner: &mut Inner,
    tenant_id: &str,
    kind: ChannelKind,
    participant: &str,
    user_text: &str,
    agent_text: Option<&str>,
) -> String {
    let now = Utc::now();
    let existing_id = inner
        .conversations
        .iter()
        .find(|c| {
            c.summary.tenant_id == tenant_id
                && c.summary.kind == kind
                && c.summary.participant == participant
                && c.summary.status == "active"
        })
        .map(|c| c.summary.id.clone());

    let id = match existing_id {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            inner.conversations.push(StoredConversation {
                summary: ConversationSummary {
                    id: id.clone(),
                    tenant_id: tenant_id.to_string(),
                    kind,
                    participant: participant.to_string(),
                    status: "active".to_string(),
                    started_at: now,
                    last_message_at: now,
                },
                messages: Vec::new(),
            });
            id
        }
    };

    if let Some(conversation) = inner.conversations.iter_mut().find(|c| c.summary.id == id) {
        conversation.messages.push(StoredMessage {
            sender: Sender::User,
            body: user_text.to_string(),
            sent_at: now,
        });
        if let Some(reply) = agent_text {
            conversation.messages.push(StoredMessage {
                sender: Sender::Agent,
                body: reply.to_string(),
                sent_at: now,
            });
        }
        conversation.summary.last_message_at = now;
    }
    id
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn upsert_channel(&self, record: ChannelRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (record.tenant_id.clone(), record.kind);
        let mut record = record;
        if let Some(existing) = inner.channels.get(&key) {
            // Reconnecting replaces the credential and settings but keeps
            // the original connection date and activity stamp.
            record.created_at = existing.created_at;
            record.last_activity = existing.last_activity;
        }
        inner.channels.insert(key, record);
        Ok(())
    }

    async fn channel(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
    ) -> Result<Option<ChannelRecord>> {
        let inner = self.inner.lock();
        Ok(inner.channels.get(&(tenant_id.to_string(), kind)).cloned())
    }

    async fn tenant_channels(&self, tenant_id: &str) -> Result<Vec<ChannelRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<ChannelRecord> = inner
            .channels
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.kind.as_str());
        Ok(records)
    }

    async fn set_channel_active(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        active: bool,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.channels.get_mut(&(tenant_id.to_string(), kind)) {
            Some(record) => {
                record.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_channel_activity(&self, tenant_id: &str, kind: ChannelKind) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.channels.get_mut(&(tenant_id.to_string(), kind)) {
            record.last_activity = Some(Utc::now());
        }
        Ok(())
    }

    async fn active_channels(&self, kind: ChannelKind) -> Result<Vec<ChannelRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<ChannelRecord> = inner
            .channels
            .values()
            .filter(|r| r.kind == kind && r.active)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
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
        let mut inner = self.inner.lock();
        Ok(append_turn(
            &mut inner, tenant_id, kind, participant, user_text, agent_text,
        ))
    }

    async fn conversations(&self, tenant_id: &str) -> Result<Vec<ConversationSummary>> {
        let inner = self.inner.lock();
        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .iter()
            .filter(|c| c.summary.tenant_id == tenant_id)
            .map(|c| c.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(summaries)
    }

    async fn conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationDetail>> {
        let inner = self.inner.lock();
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.summary.id == conversation_id && c.summary.tenant_id == tenant_id)
            .map(|c| ConversationDetail {
                summary: c.summary.clone(),
                messages: c.messages.clone(),
            }))
    }

    async fn is_processed(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        message_ref: &str,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .processed
            .get(&(tenant_id.to_string(), kind))
            .is_some_and(|ring| ring.contains(message_ref)))
    }

    async fn mark_processed(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        message_ref: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let cap = self.processed_cap;
        inner
            .processed
            .entry((tenant_id.to_string(), kind))
            .or_insert_with(|| ProcessedRing::new(cap))
            .insert(message_ref.to_string());
        Ok(())
    }

    async fn commit_cycle(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        journal: CycleJournal,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        for turn in &journal.turns {
            append_turn(
                &mut inner,
                tenant_id,
                kind,
                &turn.participant,
                &turn.user_text,
                turn.agent_text.as_deref(),
            );
        }
        let cap = self.processed_cap;
        let ring = inner
            .processed
            .entry((tenant_id.to_string(), kind))
            .or_insert_with(|| ProcessedRing::new(cap));
        for message_ref in journal.processed {
            ring.insert(message_ref);
        }
        if journal.touched {
            if let Some(record) = inner.channels.get_mut(&(tenant_id.to_string(), kind)) {
                record.last_activity = Some(Utc::now());
            }
        }
        Ok(())
    }
}
