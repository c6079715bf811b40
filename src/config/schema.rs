use crate::security::CredentialVault;
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Trunkline configuration, loaded from `config.toml`.
///
/// Resolution order: `TRUNKLINE_CONFIG_DIR` env → `~/.trunkline/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Directory holding config.toml, the vault key, and the store - computed, not serialized
    #[serde(skip)]
    pub config_dir: PathBuf,
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Gateway server configuration: bind address, public URL, admin key (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Reasoning service configuration: endpoint, model, credentials (`[reasoning]`).
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Conversation store configuration: backend and location (`[store]`).
    #[serde(default)]
    pub store: StoreConfig,

    /// Credential encryption configuration (`[vault]`).
    #[serde(default)]
    pub vault: VaultConfig,

    /// Outbound send quota configuration (`[quota]`).
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Session token configuration: signing key and lifetime (`[sessions]`).
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Email channel defaults: poll cadence, shared SMTP, sender filters
    /// (`[email_defaults]`).
    #[serde(default)]
    pub email_defaults: EmailDefaultsConfig,

    /// Per-tenant reply profiles keyed by tenant id (`[tenants.<id>]`).
    #[serde(default)]
    pub tenants: HashMap<String, TenantProfile>,
}

// ── Gateway ──────────────────────────────────────────────────────

/// HTTP gateway settings: where to listen and how callbacks reach us.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Bind host. Loopback by default; expose publicly only behind TLS.
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Externally reachable base URL, used when registering webhook callbacks
    /// (e.g. `"https://gw.example.com"`). Required for bot channel connect.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Deployment admin key guarding `POST /api/session`. Generated on first
    /// run when absent.
    #[serde(default)]
    pub admin_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            public_base_url: None,
            admin_key: None,
        }
    }
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8080
}

// ── Reasoning service ────────────────────────────────────────────

/// External reasoning service that generates reply text for inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReasoningConfig {
    /// Chat-completions style endpoint base (e.g. `"https://api.openai.com/v1"`).
    #[serde(default = "default_reasoning_base_url")]
    pub base_url: String,
    /// API key for the reasoning service. Overridden by `TRUNKLINE_API_KEY`
    /// or `API_KEY` env vars. Encrypted at rest when the vault is enabled.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_reasoning_model")]
    pub model: String,
    /// Sampling temperature (0.0–2.0). Default: `0.7`.
    #[serde(default = "default_reasoning_temperature")]
    pub temperature: f64,
    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: default_reasoning_base_url(),
            api_key: None,
            model: default_reasoning_model(),
            temperature: default_reasoning_temperature(),
            timeout_secs: default_reasoning_timeout_secs(),
        }
    }
}

fn default_reasoning_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_reasoning_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_reasoning_temperature() -> f64 {
    0.7
}

fn default_reasoning_timeout_secs() -> u64 {
    60
}

// ── Conversation store ───────────────────────────────────────────

/// Where conversations, channels, and processed-message state live.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Storage backend: `"sqlite"` (durable, default) or `"memory"` (tests,
    /// ephemeral deployments).
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// SQLite database path. Defaults to `gateway.db` under the config dir.
    /// Supports `~` expansion.
    #[serde(default)]
    pub path: Option<String>,
    /// How many processed message ids are remembered per channel for
    /// duplicate suppression. Oldest entries are evicted first.
    #[serde(default = "default_processed_cache_size")]
    pub processed_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
            processed_cache_size: default_processed_cache_size(),
        }
    }
}

fn default_store_backend() -> String {
    "sqlite".to_string()
}

fn default_processed_cache_size() -> usize {
    4096
}

// ── Credential vault ─────────────────────────────────────────────

/// Encryption of channel credentials and config secrets at rest.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VaultConfig {
    /// Encrypt credentials with a local key file. Strongly recommended;
    /// disable only for throwaway dev setups.
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            encrypt: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ── Outbound quota ───────────────────────────────────────────────

/// Daily cap on outbound sends through shared infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QuotaConfig {
    /// Maximum outbound messages per calendar day through the shared mail
    /// relay. Tenants sending with their own credentials are not counted.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
        }
    }
}

fn default_daily_limit() -> u32 {
    200
}

// ── Session tokens ───────────────────────────────────────────────

/// Signing key and lifetime for tenant session tokens.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionsConfig {
    /// HS256 signing key. Generated on first run when empty; rotating it
    /// invalidates all outstanding tokens. Encrypted at rest when the
    /// vault is enabled.
    #[serde(default)]
    pub signing_key: String,
    /// Token lifetime in hours. Default: 720 (30 days).
    #[serde(default = "default_session_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            ttl_hours: default_session_ttl_hours(),
        }
    }
}

fn default_session_ttl_hours() -> u64 {
    720
}

// ── Email defaults ───────────────────────────────────────────────

/// Deployment-wide email behavior. Per-tenant mailbox settings live on the
/// channel record; these are the knobs shared by every email channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailDefaultsConfig {
    /// Seconds between mailbox poll cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum messages handled in a single poll cycle; the rest wait for
    /// the next cycle.
    #[serde(default = "default_max_per_cycle")]
    pub max_per_cycle: usize,
    /// Soft deadline for one poll cycle in seconds. Checked between
    /// messages, not mid-message.
    #[serde(default = "default_cycle_deadline_secs")]
    pub cycle_deadline_secs: u64,
    /// Wait after the first failed poll cycle, in seconds. Consecutive
    /// failures double the wait; a successful cycle snaps it back.
    #[serde(default = "default_poll_backoff_initial_secs")]
    pub poll_backoff_initial_secs: u64,
    /// Ceiling on the failure wait, in seconds.
    #[serde(default = "default_poll_backoff_max_secs")]
    pub poll_backoff_max_secs: u64,
    /// Shared SMTP relay for tenants that did not supply their own outbound
    /// settings. Sends through it count against the daily quota.
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// Encrypted at rest when the vault is enabled.
    #[serde(default)]
    pub smtp_password: Option<String>,
    /// From address used when replying through the shared relay.
    #[serde(default)]
    pub from_address: Option<String>,
    /// Local-part prefixes that mark automated senders; mail from them is
    /// ignored without reply.
    #[serde(default = "default_blocked_sender_prefixes")]
    pub blocked_sender_prefixes: Vec<String>,
    /// Case-insensitive subject substrings that mark automated mail.
    #[serde(default = "default_blocked_subject_phrases")]
    pub blocked_subject_phrases: Vec<String>,
    /// Subjects carrying this many reply markers ("Re:", "Fwd:") or more are
    /// treated as loops and ignored.
    #[serde(default = "default_reply_marker_cutoff")]
    pub reply_marker_cutoff: usize,
}

impl Default for EmailDefaultsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_per_cycle: default_max_per_cycle(),
            cycle_deadline_secs: default_cycle_deadline_secs(),
            poll_backoff_initial_secs: default_poll_backoff_initial_secs(),
            poll_backoff_max_secs: default_poll_backoff_max_secs(),
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            from_address: None,
            blocked_sender_prefixes: default_blocked_sender_prefixes(),
            blocked_subject_phrases: default_blocked_subject_phrases(),
            reply_marker_cutoff: default_reply_marker_cutoff(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_per_cycle() -> usize {
    10
}

fn default_cycle_deadline_secs() -> u64 {
    50
}

fn default_poll_backoff_initial_secs() -> u64 {
    5
}

fn default_poll_backoff_max_secs() -> u64 {
    300
}

fn default_smtp_port() -> u16 {
    587
}

fn default_blocked_sender_prefixes() -> Vec<String> {
    [
        "no-reply",
        "noreply",
        "do-not-reply",
        "donotreply",
        "mailer-daemon",
        "postmaster",
        "bounce",
        "notifications",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_blocked_subject_phrases() -> Vec<String> {
    [
        "newsletter",
        "unsubscribe",
        "out of office",
        "auto-reply",
        "automatic reply",
        "delivery status notification",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_reply_marker_cutoff() -> usize {
    4
}

// ── Tenant profiles ──────────────────────────────────────────────

/// Optional per-tenant reply shaping passed to the reasoning service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TenantProfile {
    /// Business name the assistant speaks as. Falls back to the tenant id.
    #[serde(default)]
    pub business_name: Option<String>,
    /// Tone instruction, e.g. `"friendly and concise"`.
    #[serde(default)]
    pub tone: Option<String>,
    /// Free-form knowledge snippet prepended to the system prompt.
    #[serde(default)]
    pub knowledge: Option<String>,
}

// ── Lifecycle ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::new(),
            config_path: PathBuf::new(),
            gateway: GatewayConfig::default(),
            reasoning: ReasoningConfig::default(),
            store: StoreConfig::default(),
            vault: VaultConfig::default(),
            quota: QuotaConfig::default(),
            sessions: SessionsConfig::default(),
            email_defaults: EmailDefaultsConfig::default(),
            tenants: HashMap::new(),
        }
    }
}

fn resolve_config_dir() -> Result<PathBuf> {
    if let Ok(custom) = std::env::var("TRUNKLINE_CONFIG_DIR") {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(custom).into_owned()));
        }
    }
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".trunkline"))
}

fn decrypt_optional_secret(
    vault: &CredentialVault,
    value: &mut Option<String>,
    field_name: &str,
) -> Result<()> {
    if let Some(raw) = value.clone() {
        if CredentialVault::is_sealed(&raw) {
            *value = Some(
                vault
                    .decrypt(&raw)
                    .with_context(|| format!("Failed to decrypt {field_name}"))?,
            );
        }
    }
    Ok(())
}

fn decrypt_secret(vault: &CredentialVault, value: &mut String, field_name: &str) -> Result<()> {
    if CredentialVault::is_sealed(value) {
        *value = vault
            .decrypt(value)
            .with_context(|| format!("Failed to decrypt {field_name}"))?;
    }
    Ok(())
}

fn encrypt_optional_secret(
    vault: &CredentialVault,
    value: &mut Option<String>,
    field_name: &str,
) -> Result<()> {
    if let Some(raw) = value.clone() {
        if !CredentialVault::is_sealed(&raw) {
            *value = Some(
                vault
                    .encrypt(&raw)
                    .with_context(|| format!("Failed to encrypt {field_name}"))?,
            );
        }
    }
    Ok(())
}

fn encrypt_secret(vault: &CredentialVault, value: &mut String, field_name: &str) -> Result<()> {
    if !CredentialVault::is_sealed(value) {
        *value = vault
            .encrypt(value)
            .with_context(|| format!("Failed to encrypt {field_name}"))?;
    }
    Ok(())
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let config_dir = resolve_config_dir()?;
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;

        if config_path.exists() {
            // Warn if config file is world-readable (holds keys and SMTP creds)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let raw: toml::Value =
                toml::from_str(&contents).context("Failed to parse config file")?;
            let mut unknown_keys = Vec::new();
            let mut config: Config =
                serde_ignored::deserialize(raw, |path| unknown_keys.push(path.to_string()))
                    .context("Failed to parse config file")?;
            if !unknown_keys.is_empty() {
                tracing::warn!(
                    keys = %unknown_keys.join(", "),
                    "Ignoring unknown config keys"
                );
            }
            // Set computed paths that are skipped during serialization
            config.config_dir = config_dir.clone();
            config.config_path = config_path.clone();

            let vault = CredentialVault::new(&config_dir, config.vault.encrypt);
            decrypt_optional_secret(&vault, &mut config.reasoning.api_key, "reasoning.api_key")?;
            decrypt_optional_secret(&vault, &mut config.gateway.admin_key, "gateway.admin_key")?;
            decrypt_optional_secret(
                &vault,
                &mut config.email_defaults.smtp_password,
                "email_defaults.smtp_password",
            )?;
            decrypt_secret(&vault, &mut config.sessions.signing_key, "sessions.signing_key")?;

            if config.ensure_generated_keys() {
                config.save().await?;
                tracing::warn!(
                    "Generated missing signing/admin keys and saved them to config"
                );
            }

            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = false,
                "Config loaded"
            );
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_dir = config_dir;
            config.config_path = config_path.clone();
            config.ensure_generated_keys();
            config.save().await?;

            // Restrict permissions on newly created config file (holds keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }

            config.apply_env_overrides();
            config.validate()?;
            tracing::info!(
                path = %config.config_path.display(),
                initialized = true,
                "Config loaded"
            );
            Ok(config)
        }
    }

    /// Fill in the signing key and admin key when absent. Returns true if
    /// anything changed and the config should be persisted.
    fn ensure_generated_keys(&mut self) -> bool {
        let mut changed = false;
        if self.sessions.signing_key.trim().is_empty() {
            self.sessions.signing_key = crate::security::generate_signing_key();
            changed = true;
        }
        let admin_missing = self
            .gateway
            .admin_key
            .as_deref()
            .is_none_or(|k| k.trim().is_empty());
        if admin_missing {
            self.gateway.admin_key = Some(crate::security::generate_admin_key());
            changed = true;
        }
        changed
    }

    /// Validate configuration values that would cause runtime failures.
    ///
    /// Called after TOML deserialization and env-override application to catch
    /// obviously invalid values early instead of failing at arbitrary runtime points.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if let Some(url) = &self.gateway.public_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("gateway.public_base_url must start with http:// or https://");
            }
        }
        if !matches!(self.store.backend.as_str(), "sqlite" | "memory") {
            anyhow::bail!(
                "store.backend must be \"sqlite\" or \"memory\" (got {:?})",
                self.store.backend
            );
        }
        if self.store.processed_cache_size == 0 {
            anyhow::bail!("store.processed_cache_size must be greater than 0");
        }
        if self.quota.daily_limit == 0 {
            anyhow::bail!("quota.daily_limit must be greater than 0");
        }
        if self.sessions.ttl_hours == 0 {
            anyhow::bail!("sessions.ttl_hours must be greater than 0");
        }
        if self.reasoning.base_url.trim().is_empty() {
            anyhow::bail!("reasoning.base_url must not be empty");
        }
        if self.email_defaults.poll_interval_secs == 0 {
            anyhow::bail!("email_defaults.poll_interval_secs must be greater than 0");
        }
        if self.email_defaults.max_per_cycle == 0 {
            anyhow::bail!("email_defaults.max_per_cycle must be greater than 0");
        }
        if self.email_defaults.poll_backoff_initial_secs == 0 {
            anyhow::bail!("email_defaults.poll_backoff_initial_secs must be greater than 0");
        }
        if self.email_defaults.poll_backoff_max_secs < self.email_defaults.poll_backoff_initial_secs
        {
            anyhow::bail!(
                "email_defaults.poll_backoff_max_secs must be at least poll_backoff_initial_secs"
            );
        }
        if self.email_defaults.reply_marker_cutoff == 0 {
            anyhow::bail!("email_defaults.reply_marker_cutoff must be greater than 0");
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        // Reasoning key: TRUNKLINE_API_KEY or API_KEY (generic)
        if let Ok(key) = std::env::var("TRUNKLINE_API_KEY").or_else(|_| std::env::var("API_KEY")) {
            if !key.is_empty() {
                self.reasoning.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("TRUNKLINE_REASONING_URL") {
            if !url.is_empty() {
                self.reasoning.base_url = url;
            }
        }
        if let Ok(model) = std::env::var("TRUNKLINE_MODEL").or_else(|_| std::env::var("MODEL")) {
            if !model.is_empty() {
                self.reasoning.model = model;
            }
        }
        if let Ok(url) = std::env::var("TRUNKLINE_PUBLIC_URL") {
            if !url.is_empty() {
                self.gateway.public_base_url = Some(url);
            }
        }
        if let Ok(key) = std::env::var("TRUNKLINE_ADMIN_KEY") {
            if !key.is_empty() {
                self.gateway.admin_key = Some(key);
            }
        }
    }

    /// Resolved SQLite database path, honoring `store.path` with `~` expansion.
    pub fn store_path(&self) -> PathBuf {
        match self.store.path.as_deref() {
            Some(p) if !p.trim().is_empty() => {
                PathBuf::from(shellexpand::tilde(p.trim()).into_owned())
            }
            _ => self.config_dir.join("gateway.db"),
        }
    }

    /// Public base URL with any trailing slash removed. None when unset.
    pub fn public_base_url(&self) -> Option<String> {
        self.gateway
            .public_base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
    }

    pub async fn save(&self) -> Result<()> {
        // Encrypt secrets before serialization
        let mut config_to_save = self.clone();
        let config_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        let vault = CredentialVault::new(config_dir, self.vault.encrypt);

        encrypt_optional_secret(
            &vault,
            &mut config_to_save.reasoning.api_key,
            "reasoning.api_key",
        )?;
        encrypt_optional_secret(
            &vault,
            &mut config_to_save.gateway.admin_key,
            "gateway.admin_key",
        )?;
        encrypt_optional_secret(
            &vault,
            &mut config_to_save.email_defaults.smtp_password,
            "email_defaults.smtp_password",
        )?;
        encrypt_secret(
            &vault,
            &mut config_to_save.sessions.signing_key,
            "sessions.signing_key",
        )?;

        let toml_str =
            toml::to_string_pretty(&config_to_save).context("Failed to serialize config")?;

        fs::create_dir_all(config_dir).await.with_context(|| {
            format!("Failed to create config directory: {}", config_dir.display())
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = config_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = config_dir.join(format!("{file_name}.bak"));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(config_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config {
            config_dir: dir.to_path_buf(),
            config_path: dir.join("config.toml"),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.store.backend, "sqlite");
        assert_eq!(config.quota.daily_limit, 200);
        assert!(config.vault.encrypt);
    }

    #[test]
    fn default_filters_cover_common_automated_senders() {
        let email = EmailDefaultsConfig::default();
        assert!(email.blocked_sender_prefixes.iter().any(|p| p == "no-reply"));
        assert!(email.blocked_sender_prefixes.iter().any(|p| p == "mailer-daemon"));
        assert!(email.blocked_subject_phrases.iter().any(|p| p == "newsletter"));
        assert!(email.reply_marker_cutoff >= 2);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.store.backend = "postgres".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.quota.daily_limit = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.host = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.public_base_url = Some("gw.example.com".into());
        assert!(config.validate().is_err());

        // Backoff ceiling below the initial wait.
        let mut config = Config::default();
        config.email_defaults.poll_backoff_max_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn store_path_defaults_under_config_dir() {
        let config = test_config(Path::new("/tmp/tl-test"));
        assert_eq!(config.store_path(), Path::new("/tmp/tl-test/gateway.db"));

        let mut config = test_config(Path::new("/tmp/tl-test"));
        config.store.path = Some("/var/lib/trunkline/db.sqlite".into());
        assert_eq!(
            config.store_path(),
            Path::new("/var/lib/trunkline/db.sqlite")
        );
    }

    #[test]
    fn public_base_url_strips_trailing_slash() {
        let mut config = Config::default();
        assert_eq!(config.public_base_url(), None);
        config.gateway.public_base_url = Some("https://gw.example.com/".into());
        assert_eq!(
            config.public_base_url().as_deref(),
            Some("https://gw.example.com")
        );
    }

    #[test]
    fn ensure_generated_keys_fills_missing() {
        let mut config = Config::default();
        assert!(config.sessions.signing_key.is_empty());
        assert!(config.ensure_generated_keys());
        assert_eq!(config.sessions.signing_key.len(), 64);
        assert!(config.gateway.admin_key.as_deref().unwrap().starts_with("tl_"));
        // Second pass changes nothing.
        assert!(!config.ensure_generated_keys());
    }

    #[tokio::test]
    async fn save_and_reload_roundtrips_with_sealed_secrets() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.reasoning.api_key = Some("sk-roundtrip".into());
        config.ensure_generated_keys();
        let signing_key = config.sessions.signing_key.clone();
        config.save().await.unwrap();

        let contents = fs::read_to_string(temp.path().join("config.toml"))
            .await
            .unwrap();
        // Secrets are sealed on disk, never plaintext.
        assert!(!contents.contains("sk-roundtrip"));
        assert!(!contents.contains(&signing_key));
        assert!(contents.contains("enc1:"));

        let raw: toml::Value = toml::from_str(&contents).unwrap();
        let mut reloaded: Config = raw.try_into().unwrap();
        reloaded.config_dir = temp.path().to_path_buf();
        reloaded.config_path = temp.path().join("config.toml");
        let vault = CredentialVault::new(temp.path(), reloaded.vault.encrypt);
        decrypt_optional_secret(&vault, &mut reloaded.reasoning.api_key, "reasoning.api_key")
            .unwrap();
        decrypt_secret(&vault, &mut reloaded.sessions.signing_key, "sessions.signing_key")
            .unwrap();
        assert_eq!(reloaded.reasoning.api_key.as_deref(), Some("sk-roundtrip"));
        assert_eq!(reloaded.sessions.signing_key, signing_key);
    }

    #[test]
    fn unknown_keys_are_collected_not_fatal() {
        let contents = r#"
            [gateway]
            host = "127.0.0.1"
            legacy_toggle = true

            [reasoning]
            model = "gpt-4o-mini"
        "#;
        let raw: toml::Value = toml::from_str(contents).unwrap();
        let mut unknown = Vec::new();
        let config: Config =
            serde_ignored::deserialize(raw, |path| unknown.push(path.to_string())).unwrap();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(unknown, vec!["gateway.legacy_toggle".to_string()]);
    }

    #[test]
    fn tenant_profiles_parse_from_toml() {
        let contents = r#"
            [tenants.acme-dental]
            business_name = "Acme Dental"
            tone = "warm and professional"

            [tenants.bolt-plumbing]
            knowledge = "Open weekdays 8-17."
        "#;
        let config: Config = toml::from_str(contents).unwrap();
        assert_eq!(config.tenants.len(), 2);
        assert_eq!(
            config.tenants["acme-dental"].business_name.as_deref(),
            Some("Acme Dental")
        );
        assert!(config.tenants["bolt-plumbing"].tone.is_none());
    }
}
