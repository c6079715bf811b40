#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use trunkline::channels::{self, ChannelEngine};
use trunkline::config::Config;
use trunkline::doctor;
use trunkline::gateway::{self, AppState};
use trunkline::quota::{DailyQuota, SendQuota};
use trunkline::reasoning::{HttpReplyEngine, ReplyEngine};
use trunkline::security::{CredentialVault, SessionSigner};
use trunkline::store::{self, ChannelKind, GatewayStore};
use trunkline::ChannelCommands;

#[derive(Parser, Debug)]
#[command(name = "trunkline")]
#[command(version)]
#[command(about = "Multi-tenant gateway bridging email, bot, and business messaging into threaded conversations")]
struct Cli {
    /// Override the config directory (default: ~/.trunkline)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway and the mailbox poll scheduler
    Serve {
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one mailbox poll cycle for a tenant and print the report
    Poll {
        /// Tenant id
        #[arg(long)]
        tenant: String,
    },
    /// Manage tenant channels
    Channel {
        #[command(subcommand)]
        channel_command: ChannelCommands,
    },
    /// Issue a dashboard session token, or print the admin key
    Token {
        /// Tenant id to issue a session token for
        #[arg(long)]
        tenant: Option<String>,
        /// Print the deployment admin key instead
        #[arg(long)]
        admin: bool,
    },
    /// Print the config.toml JSON schema
    Schema,
    /// Run deployment diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for rustls. Required because multiple
    // TLS backends may be linked and rustls needs to know which to use.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir requires a non-empty path");
        }
        std::env::set_var("TRUNKLINE_CONFIG_DIR", config_dir);
    }

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // Schema printing must work without a config file on disk.
    if matches!(cli.command, Commands::Schema) {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Poll { tenant } => poll(&config, &tenant).await,
        Commands::Channel { channel_command } => run_channel_command(&config, channel_command).await,
        Commands::Token { tenant, admin } => run_token_command(&config, tenant.as_deref(), admin),
        Commands::Doctor => doctor::run(&config).await,
        Commands::Schema => unreachable!(), // handled above
    }
}

/// Wire the store, vault, quota, and reasoning client into a channel engine.
fn build_engine(
    config: &Config,
) -> Result<(Arc<ChannelEngine>, Arc<dyn GatewayStore>, Arc<SessionSigner>)> {
    let store = store::create_store(config)?;
    let vault = Arc::new(CredentialVault::new(&config.config_dir, config.vault.encrypt));
    let quota: Arc<dyn SendQuota> = Arc::new(DailyQuota::new(config.quota.daily_limit));
    let reasoning: Arc<dyn ReplyEngine> = Arc::new(HttpReplyEngine::new(&config.reasoning)?);
    let sessions = Arc::new(SessionSigner::new(
        &config.sessions.signing_key,
        session_ttl_secs(config),
    )?);
    let engine = Arc::new(ChannelEngine::new(
        config,
        store.clone(),
        vault,
        quota,
        reasoning,
    ));
    Ok((engine, store, sessions))
}

fn session_ttl_secs(config: &Config) -> i64 {
    i64::try_from(config.sessions.ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX)
}

async fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let (engine, store, sessions) = build_engine(&config)?;
    let shutdown = CancellationToken::new();
    let scheduler = channels::spawn_poll_scheduler(engine.clone(), shutdown.clone());

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    let state = AppState {
        engine,
        store,
        sessions,
        admin_key: config.gateway.admin_key.clone(),
    };
    let result = gateway::run_gateway(&config, state, shutdown.clone()).await;

    shutdown.cancel();
    let _ = scheduler.await;
    result
}

async fn poll(config: &Config, tenant: &str) -> Result<()> {
    let (engine, _store, _sessions) = build_engine(config)?;
    let Some(report) = engine.poll_email(tenant).await? else {
        bail!("tenant {tenant} has no active email channel");
    };
    println!("Poll cycle for {tenant}:");
    println!("  searched:  {}", report.searched);
    println!("  fetched:   {}", report.fetched);
    println!("  replied:   {}", report.replied);
    println!("  skipped:   {}", report.skipped);
    println!("  deferred:  {}", report.deferred);
    println!("  failures:  {}", report.failures);
    Ok(())
}

async fn run_channel_command(config: &Config, command: ChannelCommands) -> Result<()> {
    let (engine, _store, _sessions) = build_engine(config)?;
    match command {
        ChannelCommands::Add {
            tenant,
            channel_type,
            secret,
            endpoint,
        } => {
            let kind = parse_kind(&channel_type)?;
            let endpoint: serde_json::Value =
                serde_json::from_str(&endpoint).context("endpoint must be a JSON object")?;
            let view = engine.connect(&tenant, kind, &secret, &endpoint).await?;
            println!(
                "✅ {} channel connected for {}",
                view.channel_type, view.tenant_id
            );
            Ok(())
        }
        ChannelCommands::Remove {
            tenant,
            channel_type,
        } => {
            let kind = parse_kind(&channel_type)?;
            if engine.disconnect(&tenant, kind).await? {
                println!("✅ {kind} channel disconnected for {tenant}");
                Ok(())
            } else {
                bail!("{tenant} has no {kind} channel")
            }
        }
        ChannelCommands::List { tenant } => {
            let views = engine.list_channels(&tenant).await?;
            if views.is_empty() {
                println!("No channels connected for {tenant}");
                return Ok(());
            }
            println!("Channels for {tenant}:");
            for view in views {
                let state = if view.active { "active" } else { "inactive" };
                let activity = view
                    .last_activity
                    .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
                println!(
                    "  {:<10} {:<9} last activity: {activity}",
                    view.channel_type.to_string(),
                    state
                );
            }
            Ok(())
        }
        ChannelCommands::Status {
            tenant,
            channel_type,
        } => {
            let kind = parse_kind(&channel_type)?;
            let Some(view) = engine.channel_status(&tenant, kind).await? else {
                bail!("{tenant} has no {kind} channel");
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
    }
}

fn run_token_command(config: &Config, tenant: Option<&str>, admin: bool) -> Result<()> {
    if admin {
        let Some(key) = config.gateway.admin_key.as_deref() else {
            bail!("no admin key in config; start the gateway once to generate one");
        };
        println!("{key}");
        return Ok(());
    }
    let Some(tenant) = tenant else {
        bail!("pass --tenant <id> for a session token, or --admin for the admin key");
    };
    let sessions = SessionSigner::new(&config.sessions.signing_key, session_ttl_secs(config))?;
    println!("{}", sessions.issue(tenant)?);
    Ok(())
}

fn parse_kind(raw: &str) -> Result<ChannelKind> {
    ChannelKind::parse(raw).ok_or_else(|| {
        anyhow::anyhow!("unknown channel type: {raw} (expected email, bot, or business)")
    })
}
