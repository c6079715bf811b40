//! Channel drivers and the engine that routes conversations through them.
//!
//! Each driver owns one platform's wire format; the [`ChannelEngine`] owns
//! everything the platforms share: credential sealing, duplicate suppression,
//! the reasoning call, conversation journaling, and activation state. The
//! HTTP webhook handlers and the mailbox poll scheduler are thin shells
//! around engine methods.

pub mod bot;
pub mod business;
pub mod email;
pub mod traits;

pub use bot::BotDriver;
pub use business::{BusinessDriver, HandshakeQuery};
pub use email::{CycleReport, EmailDriver};
pub use traits::{ChannelDriver, ChannelError, ConnectRequest, InboundMessage, ReplySender};

use crate::config::{Config, TenantProfile};
use crate::quota::{QuotaDecision, SendQuota};
use crate::reasoning::ReplyEngine;
use crate::security::CredentialVault;
use crate::store::{ChannelKind, ChannelRecord, GatewayStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What read paths are allowed to see of a connected channel. The sealed
/// credential and the stored endpoint settings never travel through this.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub tenant_id: String,
    pub channel_type: ChannelKind,
    pub active: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Remaining shared-relay sends; absent for channels that dispatch
    /// through tenant-owned credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaDecision>,
}

/// Orchestrates the channel drivers over one store, one vault, and one
/// reasoning client.
pub struct ChannelEngine {
    store: Arc<dyn GatewayStore>,
    vault: Arc<CredentialVault>,
    reasoning: Arc<dyn ReplyEngine>,
    profiles: HashMap<String, TenantProfile>,
    email: EmailDriver,
    bot: BotDriver,
    business: BusinessDriver,
    poll_interval_secs: u64,
    poll_backoff_initial_secs: u64,
    poll_backoff_max_secs: u64,
}

impl ChannelEngine {
    pub fn new(
        config: &Config,
        store: Arc<dyn GatewayStore>,
        vault: Arc<CredentialVault>,
        quota: Arc<dyn SendQuota>,
        reasoning: Arc<dyn ReplyEngine>,
    ) -> Self {
        let email = EmailDriver::new(
            vault.clone(),
            store.clone(),
            quota,
            reasoning.clone(),
            config.email_defaults.clone(),
            config.tenants.clone(),
        );
        let bot = BotDriver::new(vault.clone(), config.public_base_url());
        let business = BusinessDriver::new(vault.clone());
        Self {
            store,
            vault,
            reasoning,
            profiles: config.tenants.clone(),
            email,
            bot,
            business,
            poll_interval_secs: config.email_defaults.poll_interval_secs,
            poll_backoff_initial_secs: config.email_defaults.poll_backoff_initial_secs,
            poll_backoff_max_secs: config.email_defaults.poll_backoff_max_secs,
        }
    }

    /// Point the bot driver at a different API host. Useful for local API
    /// servers or testing.
    #[must_use]
    pub fn with_bot_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.bot = self.bot.with_api_base(api_base);
        self
    }

    /// Point the business driver at a different graph host. Useful for
    /// testing.
    #[must_use]
    pub fn with_business_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.business = self.business.with_api_base(api_base);
        self
    }

    fn driver(&self, kind: ChannelKind) -> &dyn ChannelDriver {
        match kind {
            ChannelKind::Email => &self.email,
            ChannelKind::Bot => &self.bot,
            ChannelKind::Business => &self.business,
        }
    }

    fn view(&self, record: &ChannelRecord) -> ChannelView {
        ChannelView {
            tenant_id: record.tenant_id.clone(),
            channel_type: record.kind,
            active: record.active,
            connected_at: record.created_at,
            last_activity: record.last_activity,
            quota: None,
        }
    }

    /// Probe the platform, seal the credential, persist the channel active.
    /// Nothing is stored when the probe fails.
    pub async fn connect(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
        secret: &str,
        endpoint: &serde_json::Value,
    ) -> Result<ChannelView, ChannelError> {
        let stored_endpoint = self
            .driver(kind)
            .prepare_connect(tenant_id, secret, endpoint)
            .await?;
        let sealed = self
            .vault
            .encrypt(secret)
            .map_err(|e| anyhow::anyhow!("could not seal channel credential: {e}"))?;
        let record = ChannelRecord {
            tenant_id: tenant_id.to_string(),
            kind,
            secret: sealed,
            endpoint: stored_endpoint,
            active: true,
            created_at: Utc::now(),
            last_activity: None,
        };
        self.store.upsert_channel(record.clone()).await?;
        tracing::info!(tenant = %tenant_id, channel = %kind, "Channel connected");
        Ok(self.view(&record))
    }

    /// Deactivate the channel and let the driver release platform-side
    /// state. Returns false when the tenant has no such channel.
    pub async fn disconnect(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
    ) -> Result<bool, ChannelError> {
        let record = self.store.channel(tenant_id, kind).await?;
        let deactivated = self.store.set_channel_active(tenant_id, kind, false).await?;
        if deactivated {
            if let Some(record) = record {
                self.driver(kind).after_disconnect(&record).await;
            }
            tracing::info!(tenant = %tenant_id, channel = %kind, "Channel disconnected");
        }
        Ok(deactivated)
    }

    pub async fn list_channels(&self, tenant_id: &str) -> Result<Vec<ChannelView>, ChannelError> {
        let records = self.store.tenant_channels(tenant_id).await?;
        Ok(records.iter().map(|r| self.view(r)).collect())
    }

    /// Status for one channel, with the shared-relay allowance attached for
    /// mailboxes that send through it.
    pub async fn channel_status(
        &self,
        tenant_id: &str,
        kind: ChannelKind,
    ) -> Result<Option<ChannelView>, ChannelError> {
        let Some(record) = self.store.channel(tenant_id, kind).await? else {
            return Ok(None);
        };
        let mut view = self.view(&record);
        if kind == ChannelKind::Email {
            view.quota = self.email.quota_state_for(&record);
        }
        Ok(Some(view))
    }

    /// One on-demand poll cycle for a tenant's mailbox. `None` when the
    /// tenant has no active email channel; connection failures propagate.
    pub async fn poll_email(&self, tenant_id: &str) -> Result<Option<CycleReport>, ChannelError> {
        let Some(record) = self.store.channel(tenant_id, ChannelKind::Email).await? else {
            return Ok(None);
        };
        if !record.active {
            return Ok(None);
        }
        let report = self.email.run_poll_cycle(&record).await?;
        Ok(Some(report))
    }

    /// Handle one bot platform update. Always returns `Ok` short of a store
    /// failure: the HTTP layer acknowledges the provider with `{"ok":true}`
    /// regardless, so nothing here may leak whether the tenant exists.
    pub async fn handle_bot_update(
        &self,
        tenant_id: &str,
        update: &serde_json::Value,
    ) -> Result<(), ChannelError> {
        let Some(record) = self.store.channel(tenant_id, ChannelKind::Bot).await? else {
            tracing::debug!(tenant = %tenant_id, "Bot update for unknown channel dropped");
            return Ok(());
        };
        if !record.active {
            tracing::debug!(tenant = %tenant_id, "Bot update for inactive channel dropped");
            return Ok(());
        }
        let Some(inbound) = BotDriver::parse_update(&record, update) else {
            return Ok(());
        };
        match self.respond(&record, &self.bot, &inbound).await {
            Ok(_) => Ok(()),
            Err(ChannelError::Duplicate) => {
                tracing::debug!(tenant = %tenant_id, message_ref = %inbound.message_ref, "Duplicate bot update ignored");
                Ok(())
            }
            Err(e) => {
                tracing::error!(tenant = %tenant_id, "Bot update handling failed: {e}");
                Ok(())
            }
        }
    }

    /// Answer the business platform's subscription handshake. `Some` carries
    /// the challenge to echo; `None` means refuse with 403.
    pub async fn business_handshake(
        &self,
        tenant_id: &str,
        query: &HandshakeQuery,
    ) -> Result<Option<String>, ChannelError> {
        let Some(record) = self.store.channel(tenant_id, ChannelKind::Business).await? else {
            return Ok(None);
        };
        if !record.active {
            return Ok(None);
        }
        Ok(BusinessDriver::verify_handshake(&record, query))
    }

    /// Validate a business webhook delivery and detach the real work. The
    /// caller acknowledges the provider as soon as this returns; a payload
    /// that fails validation is dropped, never bounced.
    pub async fn accept_business_webhook(
        self: &Arc<Self>,
        tenant_id: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), ChannelError> {
        let Some(record) = self.store.channel(tenant_id, ChannelKind::Business).await? else {
            tracing::debug!(tenant = %tenant_id, "Business webhook for unknown channel dropped");
            return Ok(());
        };
        if !record.active {
            tracing::debug!(tenant = %tenant_id, "Business webhook for inactive channel dropped");
            return Ok(());
        }
        if !self.business.verify_signature(&record, signature, body) {
            tracing::warn!(tenant = %tenant_id, "Business webhook signature mismatch, payload dropped");
            return Ok(());
        }
        let payload: serde_json::Value = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(tenant = %tenant_id, "Business webhook body is not JSON: {e}");
                return Ok(());
            }
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.process_business_payload(&record, &payload).await;
        });
        Ok(())
    }

    /// The detached half of [`Self::accept_business_webhook`], split out so
    /// it can be driven to completion directly. Failures land in logs; the
    /// provider already got its acknowledgement.
    pub async fn process_business_payload(
        &self,
        record: &ChannelRecord,
        payload: &serde_json::Value,
    ) {
        let messages = match BusinessDriver::parse_payload(record, payload) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(tenant = %record.tenant_id, "Business webhook refused: {e}");
                return;
            }
        };
        let auto_reply = BusinessDriver::auto_reply_enabled(record);
        for inbound in messages {
            let outcome = if auto_reply {
                self.respond(record, &self.business, &inbound).await.map(|_| ())
            } else {
                self.journal_only(record, &inbound).await
            };
            match outcome {
                Ok(()) => {}
                Err(ChannelError::Duplicate) => {
                    tracing::debug!(tenant = %record.tenant_id, message_ref = %inbound.message_ref, "Duplicate business message ignored");
                }
                // A failed send stays failed for this delivery; the provider
                // ack already went out, so there is no retry lever to pull.
                Err(e) => {
                    tracing::error!(tenant = %record.tenant_id, "Business message handling failed: {e}");
                }
            }
        }
    }

    /// Shared webhook reply pipeline: dedup, generate, dispatch, record.
    ///
    /// A generation failure records the user turn alone and marks the
    /// message processed. A dispatch failure records both turns (the reply
    /// existed) and also marks it processed; webhook deliveries are not
    /// replayed for us, so parking the message would lose it.
    async fn respond(
        &self,
        record: &ChannelRecord,
        sender: &dyn ReplySender,
        inbound: &InboundMessage,
    ) -> Result<String, ChannelError> {
        let tenant_id = record.tenant_id.as_str();
        if self
            .store
            .is_processed(tenant_id, inbound.channel, &inbound.message_ref)
            .await?
        {
            return Err(ChannelError::Duplicate);
        }

        let profile = self.profiles.get(tenant_id);
        let reply = match self.reasoning.generate(tenant_id, profile, &inbound.text).await {
            Ok(reply) => reply,
            Err(e) => {
                self.store
                    .record_turn(tenant_id, inbound.channel, &inbound.participant, &inbound.text, None)
                    .await?;
                self.store
                    .mark_processed(tenant_id, inbound.channel, &inbound.message_ref)
                    .await?;
                self.store.touch_channel_activity(tenant_id, inbound.channel).await?;
                return Err(ChannelError::ReplyGeneration(e.to_string()));
            }
        };

        let dispatch = sender.send_reply(record, &inbound.participant, &reply).await;
        self.store
            .record_turn(
                tenant_id,
                inbound.channel,
                &inbound.participant,
                &inbound.text,
                Some(&reply),
            )
            .await?;
        self.store
            .mark_processed(tenant_id, inbound.channel, &inbound.message_ref)
            .await?;
        self.store.touch_channel_activity(tenant_id, inbound.channel).await?;
        dispatch?;
        Ok(reply)
    }

    /// Record an inbound message without replying. Used when a channel has
    /// auto-reply switched off.
    async fn journal_only(
        &self,
        record: &ChannelRecord,
        inbound: &InboundMessage,
    ) -> Result<(), ChannelError> {
        let tenant_id = record.tenant_id.as_str();
        if self
            .store
            .is_processed(tenant_id, inbound.channel, &inbound.message_ref)
            .await?
        {
            return Err(ChannelError::Duplicate);
        }
        self.store
            .record_turn(tenant_id, inbound.channel, &inbound.participant, &inbound.text, None)
            .await?;
        self.store
            .mark_processed(tenant_id, inbound.channel, &inbound.message_ref)
            .await?;
        self.store.touch_channel_activity(tenant_id, inbound.channel).await?;
        Ok(())
    }
}

/// Backoff state for one supervised loop. Each failure doubles the wait up
/// to the ceiling; a success snaps it back to the initial wait. The restart
/// count rides along for the logs.
struct PollBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    restarts: u32,
}

impl PollBackoff {
    fn new(initial_secs: u64, max_secs: u64) -> Self {
        let initial = Duration::from_secs(initial_secs.max(1));
        let max = Duration::from_secs(max_secs).max(initial);
        Self {
            initial,
            max,
            next: initial,
            restarts: 0,
        }
    }

    /// Wait for the failure just observed. The first failure waits the
    /// initial backoff; each one after doubles it up to the ceiling.
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        self.restarts = self.restarts.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.next = self.initial;
        self.restarts = 0;
    }

    fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// Supervise one poll loop per active mailbox. Loops for channels connected
/// after startup are picked up on the next pass; a loop ends on its own once
/// its channel is deactivated and is respawned if the channel comes back.
/// Store failures while listing channels back off exponentially instead of
/// spinning.
pub fn spawn_poll_scheduler(
    engine: Arc<ChannelEngine>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(engine.poll_interval_secs.max(1));
        let mut backoff = PollBackoff::new(
            engine.poll_backoff_initial_secs,
            engine.poll_backoff_max_secs,
        );
        let mut loops: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
        loop {
            let wait = match engine.store.active_channels(ChannelKind::Email).await {
                Ok(records) => {
                    backoff.reset();
                    loops.retain(|_, handle| !handle.is_finished());
                    for record in records {
                        if !loops.contains_key(&record.tenant_id) {
                            let tenant_id = record.tenant_id.clone();
                            let poll_loop = run_channel_poll_loop(
                                engine.clone(),
                                tenant_id.clone(),
                                shutdown.clone(),
                            );
                            loops.insert(tenant_id, tokio::spawn(poll_loop));
                        }
                    }
                    interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        restarts = backoff.restarts(),
                        "Listing active mailboxes failed: {e}"
                    );
                    delay
                }
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
        }
        for handle in loops.into_values() {
            let _ = handle.await;
        }
        tracing::debug!("Email poll scheduler stopped");
    })
}

/// One mailbox's poll loop: runs until the channel is deactivated or the
/// gateway shuts down. A failed cycle waits out an exponential backoff so a
/// dead mail server is not hammered; a successful cycle snaps the cadence
/// back to the poll interval.
async fn run_channel_poll_loop(
    engine: Arc<ChannelEngine>,
    tenant_id: String,
    shutdown: CancellationToken,
) {
    let interval = Duration::from_secs(engine.poll_interval_secs.max(1));
    let mut backoff = PollBackoff::new(
        engine.poll_backoff_initial_secs,
        engine.poll_backoff_max_secs,
    );
    tracing::debug!(tenant = %tenant_id, "Email poll loop started");
    loop {
        let wait = match engine.poll_email(&tenant_id).await {
            Ok(Some(report)) => {
                backoff.reset();
                if report.searched > 0 {
                    tracing::info!(
                        tenant = %tenant_id,
                        searched = report.searched,
                        replied = report.replied,
                        skipped = report.skipped,
                        deferred = report.deferred,
                        failures = report.failures,
                        "Email poll cycle finished"
                    );
                }
                interval
            }
            // Channel deactivated or removed; the loop's work is done.
            Ok(None) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    tenant = %tenant_id,
                    restarts = backoff.restarts(),
                    retry_in_secs = delay.as_secs(),
                    "Email poll cycle failed: {e}"
                );
                delay
            }
        };
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
    }
    tracing::debug!(tenant = %tenant_id, "Email poll loop stopped");
}
