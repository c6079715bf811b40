#![allow(clippy::field_reassign_with_default)]
//! Live probes against real services. Everything here is `#[ignore]` and
//! additionally skips itself unless the matching `TRUNKLINE_LIVE_*`
//! variables are set, so `--ignored` runs stay safe on machines without
//! credentials.
//!
//! Run with: cargo test --test live -- --ignored --nocapture

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use trunkline::channels::ChannelEngine;
use trunkline::config::{Config, ReasoningConfig};
use trunkline::quota::DailyQuota;
use trunkline::reasoning::{HttpReplyEngine, ReplyEngine};
use trunkline::security::CredentialVault;
use trunkline::store::{ChannelKind, MemoryStore};

fn live_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Reasoning service
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn live_reasoning_generates_a_reply() {
    let Some(api_key) = live_var("TRUNKLINE_LIVE_API_KEY") else {
        eprintln!("SKIP: TRUNKLINE_LIVE_API_KEY not set");
        return;
    };

    let mut reasoning = ReasoningConfig::default();
    reasoning.api_key = Some(api_key);
    if let Some(base_url) = live_var("TRUNKLINE_LIVE_BASE_URL") {
        reasoning.base_url = base_url;
    }
    if let Some(model) = live_var("TRUNKLINE_LIVE_MODEL") {
        reasoning.model = model;
    }

    let engine = HttpReplyEngine::new(&reasoning).unwrap();
    let reply = engine
        .generate("live-probe", None, "Reply with the single word PONG.")
        .await
        .unwrap();
    println!("reasoning replied: {reply}");
    assert!(!reply.trim().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Bot platform
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn live_bot_token_is_valid() {
    let Some(token) = live_var("TRUNKLINE_LIVE_BOT_TOKEN") else {
        eprintln!("SKIP: TRUNKLINE_LIVE_BOT_TOKEN not set");
        return;
    };

    let me: serde_json::Value = reqwest::Client::new()
        .post(format!("https://api.telegram.org/bot{token}/getMe"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    println!("getMe: {me}");
    assert_eq!(me["ok"], true);
    assert!(me["result"]["id"].as_i64().is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Mailbox
// ─────────────────────────────────────────────────────────────────────────────

/// Probes a real mailbox login through the connect path. Needs host,
/// address, and password; nothing is sent and no mail is touched.
#[tokio::test]
#[ignore]
async fn live_imap_login_probe() {
    let (Some(host), Some(address), Some(password)) = (
        live_var("TRUNKLINE_LIVE_IMAP_HOST"),
        live_var("TRUNKLINE_LIVE_IMAP_ADDRESS"),
        live_var("TRUNKLINE_LIVE_IMAP_PASSWORD"),
    ) else {
        eprintln!("SKIP: TRUNKLINE_LIVE_IMAP_HOST/ADDRESS/PASSWORD not set");
        return;
    };

    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new(16));
    let engine = Arc::new(ChannelEngine::new(
        &Config::default(),
        store,
        Arc::new(CredentialVault::new(dir.path(), false)),
        Arc::new(DailyQuota::new(1)),
        Arc::new(HttpReplyEngine::new(&ReasoningConfig::default()).unwrap()),
    ));

    let view = engine
        .connect(
            "live-probe",
            ChannelKind::Email,
            &password,
            &json!({ "imap_host": host, "address": address }),
        )
        .await
        .unwrap();
    println!("connected: {}", serde_json::to_string(&view).unwrap());
    assert!(view.active);
}
