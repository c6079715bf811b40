//! Email channel: IMAP polling in, SMTP replies out.
//!
//! Unlike the webhook channels nothing is pushed to us; a scheduler calls
//! [`EmailDriver::run_poll_cycle`] per connected mailbox. One cycle reads
//! unseen mail, filters out automated senders and reply loops, generates
//! replies, sends them threaded onto the original message, and commits all
//! store changes in a single batch at the end.
//!
//! Flag ordering matters: messages are marked `\Seen` only after the cycle
//! journal committed. A crash before the commit leaves everything unseen
//! and the next cycle starts over; a crash after it leaves the refs in the
//! dedup store, so the retried messages are recognized and only re-flagged.

use super::traits::{ChannelDriver, ChannelError};
use crate::config::{EmailDefaultsConfig, TenantProfile};
use crate::quota::SendQuota;
use crate::reasoning::ReplyEngine;
use crate::security::CredentialVault;
use crate::store::{ChannelKind, ChannelRecord, CycleJournal, GatewayStore, JournalTurn};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{HeaderValue, MessageParser};
use rustls_pki_types::ServerName;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

type ImapSession = async_imap::Session<TlsStream<TcpStream>>;

/// Endpoint settings supplied at connect time.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailEndpoint {
    imap_host: String,
    #[serde(default = "default_imap_port")]
    imap_port: u16,
    /// Mailbox address; also the IMAP login name.
    address: String,
    /// Tenant-owned outbound relay. When unset, replies go through the
    /// deployment's shared relay and count against the daily quota.
    #[serde(default)]
    smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    smtp_port: u16,
    /// SMTP login when it differs from the mailbox address.
    #[serde(default)]
    smtp_username: Option<String>,
    /// From header override for replies.
    #[serde(default)]
    from_address: Option<String>,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

/// What one poll cycle did, for logs and the manual-poll API.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleReport {
    /// Unseen messages found by the search.
    pub searched: usize,
    /// Messages actually downloaded this cycle.
    pub fetched: usize,
    pub replied: usize,
    /// Filtered, duplicate, or unusable messages.
    pub skipped: usize,
    /// Left unseen for a later cycle (quota or deadline).
    pub deferred: usize,
    /// Generation or send failures.
    pub failures: usize,
}

/// Everything we need from one inbound mail.
struct ParsedMail {
    /// Duplicate-suppression key: the Message-ID, or a content hash when
    /// the mail has none.
    message_ref: String,
    /// Real Message-ID for threading headers. Absent on broken mail.
    message_id: Option<String>,
    from: String,
    subject: String,
    body: String,
    /// Prior thread ids from the References header, oldest first.
    references: Vec<String>,
}

/// A resolved outbound mail route.
#[derive(Clone)]
struct SmtpRoute {
    host: String,
    port: u16,
    username: String,
    password: String,
    from_address: String,
    /// Shared-relay sends draw from the tenant's daily quota; tenant-owned
    /// relays do not.
    metered: bool,
}

pub struct EmailDriver {
    vault: Arc<CredentialVault>,
    store: Arc<dyn GatewayStore>,
    quota: Arc<dyn SendQuota>,
    reasoning: Arc<dyn ReplyEngine>,
    defaults: EmailDefaultsConfig,
    profiles: HashMap<String, TenantProfile>,
}

impl EmailDriver {
    pub fn new(
        vault: Arc<CredentialVault>,
        store: Arc<dyn GatewayStore>,
        quota: Arc<dyn SendQuota>,
        reasoning: Arc<dyn ReplyEngine>,
        defaults: EmailDefaultsConfig,
        profiles: HashMap<String, TenantProfile>,
    ) -> Self {
        Self {
            vault,
            store,
            quota,
            reasoning,
            defaults,
            profiles,
        }
    }

    fn tls_connector() -> TlsConnector {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    async fn open_imap_session(
        &self,
        endpoint: &EmailEndpoint,
        password: &str,
    ) -> Result<ImapSession, ChannelError> {
        let tcp = TcpStream::connect((endpoint.imap_host.as_str(), endpoint.imap_port))
            .await
            .map_err(|err| {
                ChannelError::Connection(format!(
                    "IMAP connect to {}:{} failed: {err}",
                    endpoint.imap_host, endpoint.imap_port
                ))
            })?;
        let server_name = ServerName::try_from(endpoint.imap_host.clone()).map_err(|_| {
            ChannelError::Connection(format!("invalid IMAP host name: {}", endpoint.imap_host))
        })?;
        let tls = Self::tls_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|err| ChannelError::Connection(format!("IMAP TLS handshake failed: {err}")))?;

        let client = async_imap::Client::new(tls);
        let session = client
            .login(&endpoint.address, password)
            .await
            .map_err(|(err, _)| ChannelError::Connection(format!("IMAP login refused: {err}")))?;
        Ok(session)
    }

    /// Quota standing for a connected email channel, when its sends are
    /// metered. Tenant-owned relays have no quota to show.
    pub fn quota_state_for(&self, record: &ChannelRecord) -> Option<crate::quota::QuotaDecision> {
        let endpoint: EmailEndpoint = serde_json::from_value(record.endpoint.clone()).ok()?;
        let route = resolve_smtp_route(&endpoint, "", &self.defaults)?;
        route.metered.then(|| self.quota.peek(&route.username))
    }

    fn is_own_address(&self, from: &str, endpoint: &EmailEndpoint) -> bool {
        let mut own: Vec<&str> = vec![endpoint.address.as_str()];
        if let Some(addr) = endpoint.from_address.as_deref() {
            own.push(addr);
        }
        if let Some(addr) = self.defaults.from_address.as_deref() {
            own.push(addr);
        }
        own.iter().any(|addr| addr.eq_ignore_ascii_case(from))
    }

    /// Read unseen mail from one connected mailbox and answer it.
    ///
    /// Quota-refused and deadline-cut messages stay unseen and unjournaled,
    /// so later cycles pick them up again.
    pub async fn run_poll_cycle(
        &self,
        record: &ChannelRecord,
    ) -> Result<CycleReport, ChannelError> {
        let started = Instant::now();
        let deadline = Duration::from_secs(self.defaults.cycle_deadline_secs);

        let endpoint: EmailEndpoint =
            serde_json::from_value(record.endpoint.clone()).map_err(|err| {
                ChannelError::Other(anyhow::anyhow!("channel endpoint settings unreadable: {err}"))
            })?;
        let password = self.vault.decrypt(&record.secret)?;
        let Some(smtp_route) = resolve_smtp_route(&endpoint, &password, &self.defaults) else {
            return Err(ChannelError::Dispatch(
                "no outbound mail route: set the channel's smtp_host or configure [email_defaults]"
                    .into(),
            ));
        };

        let mut session = self.open_imap_session(&endpoint, &password).await?;
        session
            .select("INBOX")
            .await
            .map_err(|err| ChannelError::Connection(format!("INBOX select failed: {err}")))?;
        let unseen = session
            .search("UNSEEN")
            .await
            .map_err(|err| ChannelError::Connection(format!("UNSEEN search failed: {err}")))?;

        let mut report = CycleReport {
            searched: unseen.len(),
            ..CycleReport::default()
        };

        let mut seqs: Vec<u32> = unseen.into_iter().collect();
        seqs.sort_unstable();
        seqs.truncate(self.defaults.max_per_cycle);

        if seqs.is_empty() {
            if let Err(err) = session.logout().await {
                tracing::debug!("IMAP logout failed: {err}");
            }
            return Ok(report);
        }

        let seq_set = seqs
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let messages: Vec<async_imap::types::Fetch> = {
            let stream = session
                .fetch(&seq_set, "RFC822")
                .await
                .map_err(|err| ChannelError::Connection(format!("fetch failed: {err}")))?;
            stream
                .try_collect()
                .await
                .map_err(|err| ChannelError::Connection(format!("fetch stream failed: {err}")))?
        };
        let mut fetched: Vec<(u32, Vec<u8>)> = Vec::new();
        for fetch in &messages {
            if let Some(body) = fetch.body() {
                fetched.push((fetch.message, body.to_vec()));
            }
        }
        report.fetched = fetched.len();

        let mut journal = CycleJournal::default();
        let mut flag_seen: Vec<u32> = Vec::new();
        let mut handled_refs: HashSet<String> = HashSet::new();
        let total = fetched.len();

        for (index, (seq, bytes)) in fetched.into_iter().enumerate() {
            if started.elapsed() >= deadline {
                report.deferred += total - index;
                tracing::debug!(
                    tenant = %record.tenant_id,
                    "Poll cycle deadline reached, deferring remaining mail"
                );
                break;
            }

            let Some(mail) = extract_mail(&bytes) else {
                // Unparseable or senderless mail can never be answered.
                flag_seen.push(seq);
                report.skipped += 1;
                continue;
            };

            // Filtered mail is still recorded as processed: if the Seen
            // flag is lost the ref store keeps it from being re-examined.
            if self.is_own_address(&mail.from, &endpoint) {
                tracing::debug!(tenant = %record.tenant_id, "Skipping the mailbox's own message");
                journal.processed.push(mail.message_ref.clone());
                handled_refs.insert(mail.message_ref);
                flag_seen.push(seq);
                report.skipped += 1;
                continue;
            }
            if is_automated_sender(&mail.from, &self.defaults.blocked_sender_prefixes)
                || subject_is_blocked(&mail.subject, &self.defaults.blocked_subject_phrases)
            {
                tracing::debug!(
                    tenant = %record.tenant_id,
                    from = %mail.from,
                    "Ignoring automated mail"
                );
                journal.processed.push(mail.message_ref.clone());
                handled_refs.insert(mail.message_ref);
                flag_seen.push(seq);
                report.skipped += 1;
                continue;
            }
            if reply_marker_count(&mail.subject) >= self.defaults.reply_marker_cutoff {
                tracing::warn!(
                    tenant = %record.tenant_id,
                    from = %mail.from,
                    subject = %mail.subject,
                    "Reply chain too deep, treating as a loop"
                );
                journal.processed.push(mail.message_ref.clone());
                handled_refs.insert(mail.message_ref);
                flag_seen.push(seq);
                report.skipped += 1;
                continue;
            }

            let duplicate = handled_refs.contains(&mail.message_ref)
                || self
                    .store
                    .is_processed(&record.tenant_id, ChannelKind::Email, &mail.message_ref)
                    .await?;
            if duplicate {
                flag_seen.push(seq);
                report.skipped += 1;
                continue;
            }

            // Sends through the shared relay draw from the relay's daily
            // pool; the quota key is the relay login, not the tenant.
            if smtp_route.metered {
                let decision = self.quota.peek(&smtp_route.username);
                if !decision.allowed {
                    report.deferred += total - index;
                    tracing::warn!(
                        tenant = %record.tenant_id,
                        resets_on = %decision.resets_on,
                        "Daily send quota exhausted, deferring remaining mail"
                    );
                    break;
                }
            }

            let profile = self.profiles.get(&record.tenant_id);
            let reply = match self
                .reasoning
                .generate(&record.tenant_id, profile, &mail.body)
                .await
            {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::error!(
                        tenant = %record.tenant_id,
                        from = %mail.from,
                        "Reply generation failed: {err}"
                    );
                    journal.turns.push(JournalTurn {
                        participant: mail.from.clone(),
                        user_text: mail.body.clone(),
                        agent_text: None,
                    });
                    journal.processed.push(mail.message_ref.clone());
                    handled_refs.insert(mail.message_ref);
                    flag_seen.push(seq);
                    report.failures += 1;
                    continue;
                }
            };

            if smtp_route.metered {
                let decision = self.quota.try_consume(&smtp_route.username);
                if !decision.allowed {
                    report.deferred += total - index;
                    break;
                }
            }

            let mut references = mail.references.clone();
            if let Some(id) = mail.message_id.clone() {
                references.push(id);
            }
            let send_task = {
                let route = smtp_route.clone();
                let to = mail.from.clone();
                let subject = reply_subject(&mail.subject);
                let in_reply_to = mail.message_id.clone();
                let body = reply.clone();
                tokio::task::spawn_blocking(move || {
                    send_smtp_blocking(&route, &to, &subject, in_reply_to, &references, body)
                })
                .await
            };
            let send_result = match send_task {
                Ok(result) => result,
                Err(join_err) => Err(anyhow::anyhow!("SMTP task failed: {join_err}")),
            };

            match send_result {
                Ok(()) => {
                    journal.turns.push(JournalTurn {
                        participant: mail.from.clone(),
                        user_text: mail.body.clone(),
                        agent_text: Some(reply),
                    });
                    journal.processed.push(mail.message_ref.clone());
                    handled_refs.insert(mail.message_ref);
                    flag_seen.push(seq);
                    report.replied += 1;
                }
                Err(err) => {
                    // The reply exists but could not leave; keep the turn so
                    // the record shows what was meant to go out.
                    tracing::error!(
                        tenant = %record.tenant_id,
                        to = %mail.from,
                        "Reply dispatch failed: {err}"
                    );
                    journal.turns.push(JournalTurn {
                        participant: mail.from.clone(),
                        user_text: mail.body.clone(),
                        agent_text: Some(reply),
                    });
                    journal.processed.push(mail.message_ref.clone());
                    handled_refs.insert(mail.message_ref);
                    flag_seen.push(seq);
                    report.failures += 1;
                }
            }
        }

        journal.touched = report.fetched > 0;
        self.store
            .commit_cycle(&record.tenant_id, ChannelKind::Email, journal)
            .await?;

        if !flag_seen.is_empty() {
            let flag_set = flag_seen
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            match session.store(&flag_set, "+FLAGS (\\Seen)").await {
                Ok(updates) => {
                    if let Err(err) = updates.try_collect::<Vec<_>>().await {
                        tracing::warn!(
                            tenant = %record.tenant_id,
                            "Marking mail seen failed: {err}"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(tenant = %record.tenant_id, "Marking mail seen failed: {err}");
                }
            }
        }

        if let Err(err) = session.logout().await {
            tracing::debug!("IMAP logout failed: {err}");
        }

        Ok(report)
    }
}

#[async_trait]
impl ChannelDriver for EmailDriver {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn prepare_connect(
        &self,
        tenant_id: &str,
        secret: &str,
        endpoint: &serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let parsed: EmailEndpoint = serde_json::from_value(endpoint.clone()).map_err(|err| {
            ChannelError::Connection(format!("invalid email endpoint settings: {err}"))
        })?;
        if parsed.imap_host.trim().is_empty() {
            return Err(ChannelError::Connection("imap_host is required".into()));
        }
        if parsed.address.trim().is_empty() {
            return Err(ChannelError::Connection("address is required".into()));
        }
        if parsed.smtp_host.is_none() && self.defaults.smtp_host.is_none() {
            return Err(ChannelError::Connection(
                "no outbound mail route: supply smtp_host or configure [email_defaults]".into(),
            ));
        }

        // A login plus select proves the credentials reach the mailbox.
        let mut session = self.open_imap_session(&parsed, secret).await?;
        session
            .select("INBOX")
            .await
            .map_err(|err| ChannelError::Connection(format!("INBOX select failed: {err}")))?;
        if let Err(err) = session.logout().await {
            tracing::debug!("IMAP logout failed: {err}");
        }

        tracing::info!(tenant = %tenant_id, address = %parsed.address, "Email channel verified");
        serde_json::to_value(&parsed).map_err(|err| {
            ChannelError::Other(anyhow::anyhow!("endpoint settings not serializable: {err}"))
        })
    }
}

/// Pull the fields we act on out of one RFC822 message. `None` when the
/// mail cannot be parsed or names no sender we could reply to.
fn extract_mail(bytes: &[u8]) -> Option<ParsedMail> {
    let message = MessageParser::default().parse(bytes)?;

    let from = message
        .from()
        .and_then(|address| address.first())
        .and_then(|addr| addr.address())?
        .trim()
        .to_string();
    if from.is_empty() {
        return None;
    }

    let message_id = message
        .message_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let message_ref = message_id.clone().unwrap_or_else(|| {
        let digest = Sha256::digest(bytes);
        format!("sha256:{}", hex::encode(&digest[..16]))
    });

    let subject = message.subject().unwrap_or_default().trim().to_string();

    let body = match message.body_text(0) {
        Some(text) => text.trim().to_string(),
        None => message
            .body_html(0)
            .map(|html| nanohtml2text::html2text(&html).trim().to_string())
            .unwrap_or_default(),
    };
    if body.is_empty() {
        return None;
    }

    let references = match message.references() {
        HeaderValue::Text(id) => vec![id.to_string()],
        HeaderValue::TextList(ids) => ids.iter().map(|id| id.to_string()).collect(),
        _ => Vec::new(),
    };

    Some(ParsedMail {
        message_ref,
        message_id,
        from,
        subject,
        body,
        references,
    })
}

fn is_automated_sender(address: &str, blocked_prefixes: &[String]) -> bool {
    let local = address
        .split('@')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    blocked_prefixes
        .iter()
        .any(|prefix| local.starts_with(&prefix.to_ascii_lowercase()))
}

fn subject_is_blocked(subject: &str, blocked_phrases: &[String]) -> bool {
    let lowered = subject.to_ascii_lowercase();
    blocked_phrases
        .iter()
        .any(|phrase| lowered.contains(&phrase.to_ascii_lowercase()))
}

/// How many reply/forward markers the subject carries. Past the configured
/// cutoff the thread is assumed to be two robots talking.
fn reply_marker_count(subject: &str) -> usize {
    let lowered = subject.to_ascii_lowercase();
    ["re:", "fwd:", "fw:"]
        .iter()
        .map(|marker| lowered.matches(marker).count())
        .sum()
}

fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return "Re: your message".to_string();
    }
    if trimmed.to_ascii_lowercase().starts_with("re:") {
        return trimmed.to_string();
    }
    format!("Re: {trimmed}")
}

/// Pick the outbound relay: the tenant's own when the endpoint names one,
/// otherwise the deployment's shared relay. `None` means no route exists.
fn resolve_smtp_route(
    endpoint: &EmailEndpoint,
    mailbox_password: &str,
    defaults: &EmailDefaultsConfig,
) -> Option<SmtpRoute> {
    if let Some(host) = endpoint.smtp_host.as_deref() {
        return Some(SmtpRoute {
            host: host.to_string(),
            port: endpoint.smtp_port,
            username: endpoint
                .smtp_username
                .clone()
                .unwrap_or_else(|| endpoint.address.clone()),
            password: mailbox_password.to_string(),
            from_address: endpoint
                .from_address
                .clone()
                .unwrap_or_else(|| endpoint.address.clone()),
            metered: false,
        });
    }

    let host = defaults.smtp_host.clone()?;
    let username = defaults.smtp_username.clone()?;
    let password = defaults.smtp_password.clone()?;
    let from_address = defaults
        .from_address
        .clone()
        .unwrap_or_else(|| username.clone());
    Some(SmtpRoute {
        host,
        port: defaults.smtp_port,
        username,
        password,
        from_address,
        metered: true,
    })
}

/// Build and send one threaded reply. Blocking; run under spawn_blocking.
fn send_smtp_blocking(
    route: &SmtpRoute,
    to: &str,
    subject: &str,
    in_reply_to: Option<String>,
    references: &[String],
    body: String,
) -> anyhow::Result<()> {
    let mut builder = Message::builder()
        .from(
            route
                .from_address
                .parse::<Mailbox>()
                .map_err(|err| anyhow::anyhow!("invalid from address: {err}"))?,
        )
        .to(to
            .parse::<Mailbox>()
            .map_err(|err| anyhow::anyhow!("invalid recipient address: {err}"))?)
        .subject(subject);

    if let Some(id) = in_reply_to {
        builder = builder.in_reply_to(format!("<{id}>"));
    }
    if !references.is_empty() {
        let joined = references
            .iter()
            .map(|id| format!("<{id}>"))
            .collect::<Vec<_>>()
            .join(" ");
        builder = builder.references(joined);
    }

    // Clients that ignore one body get the other.
    let email = builder
        .multipart(MultiPart::alternative_plain_html(
            body.clone(),
            render_html_body(&body),
        ))
        .map_err(|err| anyhow::anyhow!("could not build reply: {err}"))?;

    let mailer = SmtpTransport::relay(&route.host)
        .map_err(|err| anyhow::anyhow!("SMTP relay setup failed: {err}"))?
        .port(route.port)
        .credentials(Credentials::new(
            route.username.clone(),
            route.password.clone(),
        ))
        .build();

    mailer
        .send(&email)
        .map_err(|err| anyhow::anyhow!("SMTP send failed: {err}"))?;
    Ok(())
}

/// Minimal HTML rendering of a plain-text reply: escaped text, paragraphs
/// on blank lines, line breaks within them.
fn render_html_body(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    let paragraphs = escaped
        .split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| format!("<p>{}</p>", block.trim().replace('\n', "<br>")))
        .collect::<String>();
    format!("<html><body>{paragraphs}</body></html>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailDefaultsConfig;

    fn endpoint(json: serde_json::Value) -> EmailEndpoint {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn endpoint_defaults_fill_ports() {
        let parsed = endpoint(serde_json::json!({
            "imap_host": "imap.example.com",
            "address": "help@acme.com"
        }));
        assert_eq!(parsed.imap_port, 993);
        assert_eq!(parsed.smtp_port, 587);
        assert!(parsed.smtp_host.is_none());
    }

    #[test]
    fn automated_senders_are_recognized() {
        let defaults = EmailDefaultsConfig::default();
        assert!(is_automated_sender(
            "no-reply@vendor.com",
            &defaults.blocked_sender_prefixes
        ));
        assert!(is_automated_sender(
            "Mailer-Daemon@mx.example.com",
            &defaults.blocked_sender_prefixes
        ));
        assert!(!is_automated_sender(
            "jo@customer.com",
            &defaults.blocked_sender_prefixes
        ));
    }

    #[test]
    fn automated_subjects_are_recognized() {
        let defaults = EmailDefaultsConfig::default();
        assert!(subject_is_blocked(
            "Your weekly newsletter",
            &defaults.blocked_subject_phrases
        ));
        assert!(subject_is_blocked(
            "I am Out of Office until Monday",
            &defaults.blocked_subject_phrases
        ));
        assert!(!subject_is_blocked(
            "Order 5512 never arrived",
            &defaults.blocked_subject_phrases
        ));
    }

    #[test]
    fn reply_markers_are_counted() {
        assert_eq!(reply_marker_count("Order question"), 0);
        assert_eq!(reply_marker_count("Re: Order question"), 1);
        assert_eq!(reply_marker_count("Re: RE: Fwd: FW: deep thread"), 4);
    }

    #[test]
    fn reply_subjects_gain_a_single_prefix() {
        assert_eq!(reply_subject("Order question"), "Re: Order question");
        assert_eq!(reply_subject("Re: Order question"), "Re: Order question");
        assert_eq!(reply_subject("  "), "Re: your message");
    }

    #[test]
    fn extract_mail_reads_threading_headers() {
        let raw = b"Message-ID: <abc@mail.example>\r\n\
From: Jo Doe <jo@customer.com>\r\n\
To: help@acme.com\r\n\
Subject: Need help\r\n\
References: <root@mail.example> <prev@mail.example>\r\n\
Content-Type: text/plain\r\n\
\r\n\
My order is late.\r\n";
        let mail = extract_mail(raw).unwrap();
        assert_eq!(mail.message_ref, "abc@mail.example");
        assert_eq!(mail.message_id.as_deref(), Some("abc@mail.example"));
        assert_eq!(mail.from, "jo@customer.com");
        assert_eq!(mail.subject, "Need help");
        assert_eq!(mail.body, "My order is late.");
        assert_eq!(
            mail.references,
            vec!["root@mail.example".to_string(), "prev@mail.example".to_string()]
        );
    }

    #[test]
    fn extract_mail_falls_back_to_html_body() {
        let raw = b"Message-ID: <h1@mail.example>\r\n\
From: jo@customer.com\r\n\
Subject: Hello\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Hello <b>there</b></p>\r\n";
        let mail = extract_mail(raw).unwrap();
        assert!(mail.body.contains("Hello"));
        assert!(mail.body.contains("there"));
        assert!(!mail.body.contains('<'));
    }

    #[test]
    fn extract_mail_synthesizes_ref_without_message_id() {
        let raw = b"From: jo@customer.com\r\n\
Subject: no id\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello\r\n";
        let mail = extract_mail(raw).unwrap();
        assert!(mail.message_ref.starts_with("sha256:"));
        assert!(mail.message_id.is_none());

        // Same bytes, same ref: refetching cannot double-handle it.
        let again = extract_mail(raw).unwrap();
        assert_eq!(mail.message_ref, again.message_ref);
    }

    #[test]
    fn extract_mail_rejects_empty_or_senderless() {
        assert!(extract_mail(b"not mail at all\r\n").is_none());

        let empty_body = b"Message-ID: <e@mail>\r\n\
From: jo@customer.com\r\n\
Subject: blank\r\n\
Content-Type: text/plain\r\n\
\r\n\
\r\n";
        assert!(extract_mail(empty_body).is_none());
    }

    #[test]
    fn tenant_relay_wins_and_is_unmetered() {
        let parsed = endpoint(serde_json::json!({
            "imap_host": "imap.acme.com",
            "address": "help@acme.com",
            "smtp_host": "smtp.acme.com",
            "smtp_port": 465
        }));
        let defaults = EmailDefaultsConfig {
            smtp_host: Some("smtp.shared.example".into()),
            smtp_username: Some("relay@shared.example".into()),
            smtp_password: Some("relay-pass".into()),
            ..EmailDefaultsConfig::default()
        };

        let route = resolve_smtp_route(&parsed, "mailbox-pass", &defaults).unwrap();
        assert_eq!(route.host, "smtp.acme.com");
        assert_eq!(route.port, 465);
        assert_eq!(route.username, "help@acme.com");
        assert_eq!(route.password, "mailbox-pass");
        assert_eq!(route.from_address, "help@acme.com");
        assert!(!route.metered);
    }

    #[test]
    fn shared_relay_is_metered() {
        let parsed = endpoint(serde_json::json!({
            "imap_host": "imap.acme.com",
            "address": "help@acme.com"
        }));
        let defaults = EmailDefaultsConfig {
            smtp_host: Some("smtp.shared.example".into()),
            smtp_username: Some("relay@shared.example".into()),
            smtp_password: Some("relay-pass".into()),
            from_address: Some("agents@shared.example".into()),
            ..EmailDefaultsConfig::default()
        };

        let route = resolve_smtp_route(&parsed, "mailbox-pass", &defaults).unwrap();
        assert_eq!(route.host, "smtp.shared.example");
        assert_eq!(route.from_address, "agents@shared.example");
        assert!(route.metered);
    }

    #[test]
    fn html_body_escapes_and_keeps_paragraphs() {
        let html = render_html_body("Price is 3 < 5 & fine.\n\nSecond line\nwrapped.");
        assert_eq!(
            html,
            "<html><body><p>Price is 3 &lt; 5 &amp; fine.</p>\
             <p>Second line<br>wrapped.</p></body></html>"
        );
    }

    #[test]
    fn no_relay_anywhere_means_no_route() {
        let parsed = endpoint(serde_json::json!({
            "imap_host": "imap.acme.com",
            "address": "help@acme.com"
        }));
        let defaults = EmailDefaultsConfig::default();
        assert!(resolve_smtp_route(&parsed, "pw", &defaults).is_none());
    }
}
