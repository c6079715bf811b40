//! Bot-platform channel (Telegram-style Bot API).
//!
//! Push-based: the platform delivers updates to
//! `/webhooks/bot/{tenant_id}` and we answer over `sendMessage`. The
//! driver owns the platform calls; update-to-turn orchestration lives in
//! the engine.

use super::traits::{ChannelDriver, ChannelError, InboundMessage, ReplySender};
use crate::security::CredentialVault;
use crate::store::{ChannelKind, ChannelRecord};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// The platform caps messages at 4096 characters. Splitting at 4096 bytes
/// never exceeds that, whatever the text's encoding width.
const BOT_MAX_MESSAGE_BYTES: usize = 4096;

pub struct BotDriver {
    client: reqwest::Client,
    vault: Arc<CredentialVault>,
    api_base: String,
    public_base_url: Option<String>,
}

impl BotDriver {
    pub fn new(vault: Arc<CredentialVault>, public_base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            vault,
            api_base: "https://api.telegram.org".to_string(),
            public_base_url,
        }
    }

    /// Override the Bot API base URL. Useful for local API servers or
    /// testing.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, token)
    }

    fn webhook_url(&self, tenant_id: &str) -> Option<String> {
        self.public_base_url
            .as_deref()
            .map(|base| format!("{base}/webhooks/bot/{tenant_id}"))
    }

    /// POST one Bot API method. Callers wrap the error string in the
    /// variant that fits their phase (connect probe vs. reply dispatch).
    async fn api_call(
        &self,
        token: &str,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let response = self
            .client
            .post(self.api_url(token, method))
            .json(body)
            .send()
            .await
            .map_err(|err| format!("bot API unreachable: {err}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(format!("bot API {method} failed ({status}): {detail}"));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| format!("bot API {method} returned invalid JSON: {err}"))
    }

    /// Extract a conversation turn from one webhook update.
    ///
    /// Returns `None` for everything that must be acknowledged but never
    /// answered: edited messages, callback queries, messages from bots
    /// (including our own echoed back), and non-text content.
    pub fn parse_update(
        record: &ChannelRecord,
        update: &serde_json::Value,
    ) -> Option<InboundMessage> {
        let update_id = update.get("update_id").and_then(serde_json::Value::as_i64)?;
        let message = update.get("message")?;

        let from = message.get("from")?;
        if from
            .get("is_bot")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return None;
        }
        let sender_id = from.get("id").and_then(serde_json::Value::as_i64)?;
        if record
            .endpoint
            .get("bot_user_id")
            .and_then(serde_json::Value::as_i64)
            == Some(sender_id)
        {
            return None;
        }

        let chat_id = message
            .get("chat")
            .and_then(|chat| chat.get("id"))
            .and_then(serde_json::Value::as_i64)?;
        let text = message.get("text").and_then(|t| t.as_str())?.trim();
        if text.is_empty() {
            return None;
        }

        Some(InboundMessage {
            channel: ChannelKind::Bot,
            message_ref: update_id.to_string(),
            participant: chat_id.to_string(),
            text: text.to_string(),
        })
    }
}

/// Split a reply into chunks the platform will accept, preferring newline
/// then space breaks so sentences survive intact.
fn split_reply(text: &str) -> Vec<String> {
    if text.len() <= BOT_MAX_MESSAGE_BYTES {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > BOT_MAX_MESSAGE_BYTES {
        let window_end = crate::util::floor_utf8_char_boundary(remaining, BOT_MAX_MESSAGE_BYTES);
        let window = &remaining[..window_end];

        // Break points in the first half of the window are ignored;
        // splitting there produces runt chunks.
        let half = BOT_MAX_MESSAGE_BYTES / 2;
        let break_at = window
            .rfind('\n')
            .filter(|&pos| pos >= half)
            .or_else(|| window.rfind(' ').filter(|&pos| pos >= half))
            .map_or(window_end, |pos| pos + 1);

        chunks.push(remaining[..break_at].to_string());
        remaining = &remaining[break_at..];
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

#[async_trait]
impl ChannelDriver for BotDriver {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Bot
    }

    async fn prepare_connect(
        &self,
        tenant_id: &str,
        secret: &str,
        _endpoint: &serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let Some(webhook_url) = self.webhook_url(tenant_id) else {
            return Err(ChannelError::Connection(
                "gateway.public_base_url must be set before a bot channel can receive webhooks"
                    .into(),
            ));
        };

        let me = self
            .api_call(secret, "getMe", &serde_json::json!({}))
            .await
            .map_err(ChannelError::Connection)?;
        let bot_user_id = me
            .get("result")
            .and_then(|result| result.get("id"))
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                ChannelError::Connection("bot API getMe response had no result.id".into())
            })?;
        let bot_username = me
            .get("result")
            .and_then(|result| result.get("username"))
            .and_then(|username| username.as_str())
            .unwrap_or_default()
            .to_string();

        self.api_call(
            secret,
            "setWebhook",
            &serde_json::json!({ "url": webhook_url }),
        )
        .await
        .map_err(ChannelError::Connection)?;

        tracing::info!(tenant = %tenant_id, bot = %bot_username, "Bot webhook registered");

        // Persisted so inbound updates can drop the bot's own echoes.
        Ok(serde_json::json!({
            "bot_user_id": bot_user_id,
            "bot_username": bot_username,
            "webhook_url": webhook_url,
        }))
    }

    async fn after_disconnect(&self, record: &ChannelRecord) {
        let token = match self.vault.decrypt(&record.secret) {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!(
                    tenant = %record.tenant_id,
                    "Skipping bot webhook teardown, credential unreadable: {err}"
                );
                return;
            }
        };
        if let Err(err) = self
            .api_call(&token, "deleteWebhook", &serde_json::json!({}))
            .await
        {
            tracing::warn!(tenant = %record.tenant_id, "Bot webhook teardown failed: {err}");
        }
    }
}

#[async_trait]
impl ReplySender for BotDriver {
    async fn send_reply(
        &self,
        record: &ChannelRecord,
        participant: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let token = self.vault.decrypt(&record.secret)?;
        // Numeric ids go over the wire as numbers; anything else (group
        // usernames) stays a string.
        let chat_id = match participant.parse::<i64>() {
            Ok(id) => serde_json::Value::from(id),
            Err(_) => serde_json::Value::from(participant),
        };

        let chunks = split_reply(text);
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.iter().enumerate() {
            let body = serde_json::json!({ "chat_id": chat_id.clone(), "text": chunk });
            self.api_call(&token, "sendMessage", &body)
                .await
                .map_err(ChannelError::Dispatch)?;
            if index < last {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(())
    }
}
