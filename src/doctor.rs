//! Deployment diagnostics for the `doctor` CLI command.
//!
//! Every check is non-destructive: the store is opened read-only in
//! spirit (listing only), the vault probe round-trips a throwaway value,
//! and the reasoning probe hits the catalog endpoint, not completions.

use crate::config::Config;
use crate::security::CredentialVault;
use crate::store::{self, ChannelKind};
use anyhow::Result;
use std::time::Duration;

const REASONING_PROBE_TIMEOUT_SECS: u64 = 5;

// ── Diagnostic item ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Error,
}

/// Structured diagnostic result for programmatic consumption.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiagResult {
    pub severity: Severity,
    pub category: String,
    pub message: String,
}

struct DiagItem {
    severity: Severity,
    category: &'static str,
    message: String,
}

impl DiagItem {
    fn ok(category: &'static str, msg: impl Into<String>) -> Self {
        Self {
            severity: Severity::Ok,
            category,
            message: msg.into(),
        }
    }
    fn warn(category: &'static str, msg: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warn,
            category,
            message: msg.into(),
        }
    }
    fn error(category: &'static str, msg: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            message: msg.into(),
        }
    }

    fn into_result(self) -> DiagResult {
        DiagResult {
            severity: self.severity,
            category: self.category.to_string(),
            message: self.message,
        }
    }
}

// ── Public entry points ──────────────────────────────────────────

/// Run diagnostics and return structured results.
pub async fn diagnose(config: &Config) -> Vec<DiagResult> {
    let mut items: Vec<DiagItem> = Vec::new();

    check_config(config, &mut items);
    check_vault(config, &mut items);
    check_sessions(config, &mut items);
    check_store(config, &mut items).await;
    check_reasoning(config, &mut items).await;

    items.into_iter().map(DiagItem::into_result).collect()
}

/// Run diagnostics and print a human-readable report to stdout.
pub async fn run(config: &Config) -> Result<()> {
    let results = diagnose(config).await;

    println!("🩺 Trunkline Doctor");
    println!();

    let mut current_cat = "";
    for item in &results {
        if item.category != current_cat {
            current_cat = &item.category;
            println!("  [{current_cat}]");
        }
        let icon = match item.severity {
            Severity::Ok => "✅",
            Severity::Warn => "⚠️ ",
            Severity::Error => "❌",
        };
        println!("    {} {}", icon, item.message);
    }

    let errors = results
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .count();
    let warns = results
        .iter()
        .filter(|i| i.severity == Severity::Warn)
        .count();
    let oks = results
        .iter()
        .filter(|i| i.severity == Severity::Ok)
        .count();

    println!();
    println!("  Summary: {oks} ok, {warns} warnings, {errors} errors");

    if errors > 0 {
        println!("  💡 Fix the errors above, then run `trunkline doctor` again.");
    }

    Ok(())
}

// ── Checks ───────────────────────────────────────────────────────

fn check_config(config: &Config, items: &mut Vec<DiagItem>) {
    let cat = "config";

    if config.config_path.exists() {
        items.push(DiagItem::ok(
            cat,
            format!("config file: {}", config.config_path.display()),
        ));
    } else {
        items.push(DiagItem::error(
            cat,
            format!("config file not found: {}", config.config_path.display()),
        ));
    }

    match config.public_base_url() {
        Some(url) => items.push(DiagItem::ok(
            cat,
            format!("webhook callbacks register under {url}"),
        )),
        None => items.push(DiagItem::warn(
            cat,
            "no [gateway] public_base_url; bot channels cannot register webhooks",
        )),
    }

    if config.quota.daily_limit == 0 {
        items.push(DiagItem::warn(
            cat,
            "quota daily_limit is 0; all shared-relay sends will be refused",
        ));
    } else {
        items.push(DiagItem::ok(
            cat,
            format!("shared-relay quota: {}/day", config.quota.daily_limit),
        ));
    }

    let relay = &config.email_defaults;
    if relay.smtp_host.is_some() {
        if relay.smtp_username.is_none() || relay.smtp_password.is_none() {
            items.push(DiagItem::error(
                cat,
                "shared mail relay is incomplete: smtp_username and smtp_password \
                 are required alongside [email_defaults] smtp_host",
            ));
        } else {
            items.push(DiagItem::ok(
                cat,
                format!(
                    "shared mail relay: {}:{}",
                    relay.smtp_host.as_deref().unwrap_or(""),
                    relay.smtp_port
                ),
            ));
        }
    } else {
        items.push(DiagItem::warn(
            cat,
            "no shared mail relay; email channels must bring their own smtp settings",
        ));
    }
}

fn check_vault(config: &Config, items: &mut Vec<DiagItem>) {
    let cat = "vault";

    if !config.vault.encrypt {
        items.push(DiagItem::warn(
            cat,
            "credential encryption disabled; channel secrets are stored in plaintext",
        ));
        return;
    }

    let vault = CredentialVault::new(&config.config_dir, true);
    match vault
        .encrypt("doctor-probe")
        .and_then(|sealed| vault.decrypt(&sealed))
    {
        Ok(ref roundtrip) if roundtrip == "doctor-probe" => {
            items.push(DiagItem::ok(cat, "encryption round-trip ok"));
        }
        Ok(_) => items.push(DiagItem::error(cat, "encryption round-trip returned garbage")),
        Err(e) => items.push(DiagItem::error(cat, format!("vault unusable: {e}"))),
    }
}

fn check_sessions(config: &Config, items: &mut Vec<DiagItem>) {
    let cat = "sessions";

    if config.sessions.signing_key.trim().is_empty() {
        items.push(DiagItem::error(
            cat,
            "no session signing key; start the gateway once to generate one",
        ));
    } else {
        items.push(DiagItem::ok(
            cat,
            format!("session tokens valid for {}h", config.sessions.ttl_hours),
        ));
    }

    if config.gateway.admin_key.is_none() {
        items.push(DiagItem::warn(
            cat,
            "no admin key; POST /api/session is disabled until one is generated",
        ));
    } else {
        items.push(DiagItem::ok(cat, "admin key configured"));
    }
}

async fn check_store(config: &Config, items: &mut Vec<DiagItem>) {
    let cat = "store";

    let store = match store::create_store(config) {
        Ok(store) => store,
        Err(e) => {
            items.push(DiagItem::error(cat, format!("store unavailable: {e}")));
            return;
        }
    };
    items.push(DiagItem::ok(
        cat,
        format!("{} backend ready", config.store.backend),
    ));

    let mut total = 0usize;
    for kind in [ChannelKind::Email, ChannelKind::Bot, ChannelKind::Business] {
        match store.active_channels(kind).await {
            Ok(records) => total += records.len(),
            Err(e) => {
                items.push(DiagItem::error(
                    cat,
                    format!("listing {kind} channels failed: {e}"),
                ));
                return;
            }
        }
    }
    items.push(DiagItem::ok(cat, format!("{total} active channel(s)")));
}

async fn check_reasoning(config: &Config, items: &mut Vec<DiagItem>) {
    let cat = "reasoning";

    if config.reasoning.api_key.is_none() {
        items.push(DiagItem::warn(
            cat,
            "no reasoning api_key configured; replies will fail until one is set",
        ));
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(REASONING_PROBE_TIMEOUT_SECS))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            items.push(DiagItem::error(cat, format!("http client unusable: {e}")));
            return;
        }
    };

    let url = format!(
        "{}/models",
        config.reasoning.base_url.trim_end_matches('/')
    );
    let mut request = client.get(&url);
    if let Some(key) = config.reasoning.api_key.as_deref() {
        request = request.bearer_auth(key);
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            items.push(DiagItem::ok(
                cat,
                format!("endpoint reachable, model {}", config.reasoning.model),
            ));
        }
        Ok(response) => {
            items.push(DiagItem::warn(
                cat,
                format!("endpoint answered {} on {url}", response.status()),
            ));
        }
        Err(e) => {
            items.push(DiagItem::warn(cat, format!("endpoint unreachable: {e}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.store.backend = "memory".into();
        config.sessions.signing_key = "doctor-test-key".into();
        // Vault off so the probe never writes a key file into the test cwd.
        config.vault.encrypt = false;
        // Unroutable endpoint so the reasoning probe fails fast offline.
        config.reasoning.base_url = "http://127.0.0.1:9".into();
        config
    }

    #[tokio::test]
    async fn reports_missing_relay_credentials_as_error() {
        let mut config = base_config();
        config.email_defaults.smtp_host = Some("smtp.relay.example".into());
        config.email_defaults.smtp_username = None;

        let results = diagnose(&config).await;
        assert!(results
            .iter()
            .any(|r| r.severity == Severity::Error && r.message.contains("shared mail relay")));
    }

    #[tokio::test]
    async fn zero_quota_is_a_warning_not_an_error() {
        let mut config = base_config();
        config.quota.daily_limit = 0;

        let results = diagnose(&config).await;
        assert!(results
            .iter()
            .any(|r| r.severity == Severity::Warn && r.message.contains("daily_limit is 0")));
    }

    #[tokio::test]
    async fn memory_store_backend_passes() {
        let results = diagnose(&base_config()).await;
        assert!(results
            .iter()
            .any(|r| r.category == "store" && r.severity == Severity::Ok));
    }

    #[tokio::test]
    async fn missing_signing_key_is_an_error() {
        let mut config = base_config();
        config.sessions.signing_key = String::new();

        let results = diagnose(&config).await;
        assert!(results
            .iter()
            .any(|r| r.category == "sessions" && r.severity == Severity::Error));
    }
}
