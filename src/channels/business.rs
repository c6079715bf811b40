//! Business-messaging channel (Meta/WhatsApp Cloud API style).
//!
//! Push-based like the bot channel, with two platform quirks on top: a
//! GET verification handshake that must echo a challenge, and an optional
//! `X-Hub-Signature-256` HMAC over the raw request body.

use super::traits::{ChannelDriver, ChannelError, InboundMessage, ReplySender};
use crate::security::{constant_time_eq, CredentialVault};
use crate::store::{ChannelKind, ChannelRecord};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Endpoint settings supplied at connect time.
#[derive(Debug, Clone, Deserialize)]
struct BusinessEndpoint {
    phone_number_id: String,
    verify_token: String,
    /// App secret for webhook signature verification. Optional; without
    /// it, payloads are accepted unsigned.
    #[serde(default)]
    app_secret: Option<String>,
    /// When false, inbound messages are journaled but never answered.
    #[serde(default = "default_auto_reply")]
    auto_reply: bool,
}

fn default_auto_reply() -> bool {
    true
}

/// Query parameters of the platform's webhook verification request.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

pub struct BusinessDriver {
    client: reqwest::Client,
    vault: Arc<CredentialVault>,
    api_base: String,
}

impl BusinessDriver {
    pub fn new(vault: Arc<CredentialVault>) -> Self {
        Self {
            client: reqwest::Client::new(),
            vault,
            api_base: "https://graph.facebook.com/v19.0".to_string(),
        }
    }

    /// Override the Cloud API base URL. Useful for testing.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Answer the platform's subscription handshake. Returns the challenge
    /// to echo when the mode is `subscribe` and the presented verify token
    /// matches the stored one; `None` means respond 403.
    pub fn verify_handshake(record: &ChannelRecord, query: &HandshakeQuery) -> Option<String> {
        if query.mode.as_deref() != Some("subscribe") {
            return None;
        }
        let stored = record.endpoint.get("verify_token").and_then(|t| t.as_str())?;
        let presented = query.verify_token.as_deref()?;
        if !constant_time_eq(stored, presented) {
            return None;
        }
        query.challenge.clone()
    }

    /// Check `X-Hub-Signature-256` over the raw body. Channels connected
    /// without an app secret accept everything; with one, a missing or
    /// wrong signature rejects the payload.
    pub fn verify_signature(
        &self,
        record: &ChannelRecord,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> bool {
        let Some(sealed) = record.endpoint.get("app_secret").and_then(|s| s.as_str()) else {
            return true;
        };
        let app_secret = match self.vault.decrypt(sealed) {
            Ok(secret) => secret,
            Err(err) => {
                tracing::warn!(
                    tenant = %record.tenant_id,
                    "App secret unreadable, dropping webhook: {err}"
                );
                return false;
            }
        };
        let Some(provided) = signature_header.and_then(|h| h.strip_prefix("sha256=")) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());
        constant_time_eq(&expected, provided)
    }

    /// Whether this channel answers inbound messages or only journals them.
    pub fn auto_reply_enabled(record: &ChannelRecord) -> bool {
        record
            .endpoint
            .get("auto_reply")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true)
    }

    /// Walk a webhook payload and extract conversation turns.
    ///
    /// Payload structure: `{ "entry": [ { "changes": [ { "field":
    /// "messages", "value": { "metadata": {...}, "messages": [...] } } ] }
    /// ] }`. A metadata phone-number id that does not match the stored one
    /// refuses the whole payload before anything is recorded. Delivery
    /// status changes carry no `messages` array and fall through quietly.
    pub fn parse_payload(
        record: &ChannelRecord,
        payload: &serde_json::Value,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        let expected_phone_id = record
            .endpoint
            .get("phone_number_id")
            .and_then(|id| id.as_str())
            .unwrap_or_default();

        let mut inbound = Vec::new();
        let Some(entries) = payload.get("entry").and_then(|e| e.as_array()) else {
            return Ok(inbound);
        };

        for entry in entries {
            let Some(changes) = entry.get("changes").and_then(|c| c.as_array()) else {
                continue;
            };
            for change in changes {
                if change.get("field").and_then(|f| f.as_str()) != Some("messages") {
                    continue;
                }
                let Some(value) = change.get("value") else {
                    continue;
                };

                let payload_phone_id = value
                    .get("metadata")
                    .and_then(|m| m.get("phone_number_id"))
                    .and_then(|id| id.as_str())
                    .unwrap_or_default();
                if payload_phone_id != expected_phone_id {
                    return Err(ChannelError::AccessDenied);
                }

                let Some(messages) = value.get("messages").and_then(|m| m.as_array()) else {
                    continue;
                };
                for message in messages {
                    let Some(from) = message.get("from").and_then(|f| f.as_str()) else {
                        continue;
                    };
                    let Some(id) = message.get("id").and_then(|i| i.as_str()) else {
                        continue;
                    };
                    if message.get("type").and_then(|t| t.as_str()) != Some("text") {
                        tracing::debug!("Business webhook: skipping non-text message from {from}");
                        continue;
                    }
                    let text = message
                        .get("text")
                        .and_then(|t| t.get("body"))
                        .and_then(|b| b.as_str())
                        .unwrap_or("")
                        .trim();
                    if text.is_empty() {
                        continue;
                    }

                    inbound.push(InboundMessage {
                        channel: ChannelKind::Business,
                        message_ref: id.to_string(),
                        participant: from.to_string(),
                        text: text.to_string(),
                    });
                }
            }
        }

        Ok(inbound)
    }
}

#[async_trait]
impl ChannelDriver for BusinessDriver {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Business
    }

    async fn prepare_connect(
        &self,
        tenant_id: &str,
        secret: &str,
        endpoint: &serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let parsed: BusinessEndpoint = serde_json::from_value(endpoint.clone()).map_err(|err| {
            ChannelError::Connection(format!("invalid business endpoint settings: {err}"))
        })?;
        if parsed.phone_number_id.trim().is_empty() {
            return Err(ChannelError::Connection("phone_number_id is required".into()));
        }
        if parsed.verify_token.trim().is_empty() {
            return Err(ChannelError::Connection("verify_token is required".into()));
        }

        let url = format!("{}/{}", self.api_base, parsed.phone_number_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(secret)
            .send()
            .await
            .map_err(|err| ChannelError::Connection(format!("platform unreachable: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ChannelError::Connection(format!(
                "platform rejected the access token ({status}): {detail}"
            )));
        }

        // App secret is sealed at rest alongside the access token.
        let sealed_app_secret = match parsed.app_secret.as_deref().map(str::trim) {
            Some(app_secret) if !app_secret.is_empty() => Some(
                self.vault
                    .encrypt(app_secret)
                    .map_err(|err| anyhow::anyhow!("could not seal app secret: {err}"))?,
            ),
            _ => None,
        };

        tracing::info!(
            tenant = %tenant_id,
            phone_number_id = %parsed.phone_number_id,
            "Business channel verified"
        );

        Ok(serde_json::json!({
            "phone_number_id": parsed.phone_number_id,
            "verify_token": parsed.verify_token,
            "app_secret": sealed_app_secret,
            "auto_reply": parsed.auto_reply,
        }))
    }
}

#[async_trait]
impl ReplySender for BusinessDriver {
    async fn send_reply(
        &self,
        record: &ChannelRecord,
        participant: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let access_token = self.vault.decrypt(&record.secret)?;
        let phone_number_id = record
            .endpoint
            .get("phone_number_id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                ChannelError::Dispatch("channel record has no phone_number_id".into())
            })?;

        // The API wants the number without a leading +.
        let to = participant.strip_prefix('+').unwrap_or(participant);
        let url = format!("{}/{phone_number_id}/messages", self.api_base);
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": text }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&access_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| ChannelError::Dispatch(format!("platform unreachable: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ChannelError::Dispatch(format!(
                "platform refused the message ({status}): {detail}"
            )));
        }
        Ok(())
    }
}
