use crate::security::VaultError;
use crate::store::{ChannelKind, ChannelRecord};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

/// A normalized inbound message, whatever channel it arrived on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: ChannelKind,
    /// Platform-unique id used for duplicate suppression: the mail
    /// Message-ID, the bot update id, or the platform message id.
    pub message_ref: String,
    /// Stable participant id: email address, chat id, or phone number.
    pub participant: String,
    pub text: String,
}

/// Everything that can go wrong between receiving a message and delivering
/// the reply. Variants map one-to-one onto distinct recovery behavior.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Upstream endpoint unreachable or refused us. Poll cycles surface
    /// this to the caller; webhooks log it and ack anyway.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stored credential cannot be unsealed. The channel must be
    /// reconnected with fresh credentials; retrying cannot help.
    #[error("credential cannot be unsealed, reconnect the channel: {0}")]
    Decryption(#[from] VaultError),

    /// Caller's tenant does not own the targeted resource. Refused before
    /// any side effect.
    #[error("access denied")]
    AccessDenied,

    /// Message was already handled. Skipped without any side effect.
    #[error("duplicate message")]
    Duplicate,

    /// Reasoning service failed or returned nothing. The user message is
    /// kept, no agent message exists, nothing is sent.
    #[error("reply generation failed: {0}")]
    ReplyGeneration(String),

    /// Reply was generated but could not be delivered.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Daily send allowance exhausted. The message is not marked processed,
    /// so it is retried once the counter resets.
    #[error("send quota exhausted, resets on {resets_on}")]
    QuotaExceeded { remaining: u32, resets_on: NaiveDate },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Body of `POST /api/channels/connect`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    /// Defaults to the session's tenant when omitted.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// "email", "bot", or "business".
    pub channel_type: String,
    /// The channel credential: mailbox password, bot token, or platform
    /// access token. Sealed by the vault before it touches the store.
    pub secret: String,
    /// Channel-specific endpoint settings (hosts, addresses, verify token).
    #[serde(default)]
    pub endpoint: serde_json::Value,
}

/// One channel family's connect/disconnect behavior.
///
/// Inbound handling is not part of this trait: the email driver pulls
/// batches on a schedule while the webhook drivers are pushed single
/// events.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Validate endpoint settings, probe the platform with the plaintext
    /// credential, and return the endpoint JSON to persist. Called before
    /// the credential is sealed and stored.
    async fn prepare_connect(
        &self,
        tenant_id: &str,
        secret: &str,
        endpoint: &serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError>;

    /// Platform-side cleanup after the record is deactivated. Failures are
    /// logged by the implementation, never surfaced: the channel is already
    /// off.
    async fn after_disconnect(&self, _record: &ChannelRecord) {}
}

/// Delivers reply text to a participant. Implemented by the push channels;
/// email replies thread through the poll cycle instead.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(
        &self,
        record: &ChannelRecord,
        participant: &str,
        text: &str,
    ) -> Result<(), ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_recovery() {
        let err = ChannelError::Decryption(VaultError::Unreadable);
        assert!(err.to_string().contains("reconnect"));

        let err = ChannelError::QuotaExceeded {
            remaining: 0,
            resets_on: NaiveDate::from_ymd_opt(2026, 8, 26).unwrap(),
        };
        assert!(err.to_string().contains("2026-08-26"));
    }

    #[test]
    fn connect_request_parses_with_defaulted_endpoint() {
        let request: ConnectRequest = serde_json::from_value(serde_json::json!({
            "tenant_id": "acme",
            "channel_type": "bot",
            "secret": "123:abc"
        }))
        .unwrap();
        assert_eq!(request.tenant_id.as_deref(), Some("acme"));
        assert!(request.endpoint.is_null());
    }
}
