//! Reply generation through the external reasoning service.
//!
//! The gateway never composes reply text itself: every inbound message is
//! handed to an OpenAI-compatible chat-completions endpoint together with the
//! tenant's profile, and whatever comes back is dispatched verbatim. The
//! service is a trait so channel drivers can be tested against a scripted
//! engine.

use crate::config::{ReasoningConfig, TenantProfile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Produces the agent's reply text for one inbound user message.
#[async_trait]
pub trait ReplyEngine: Send + Sync {
    /// Errors (and empty replies) surface here; the caller records the turn
    /// without an agent message and sends nothing.
    async fn generate(
        &self,
        tenant_id: &str,
        profile: Option<&TenantProfile>,
        user_text: &str,
    ) -> Result<String>;
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct HttpReplyEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
}

impl HttpReplyEngine {
    pub fn new(config: &ReasoningConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build reasoning HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Build the completions URL, tolerating a base_url that already names
    /// the full endpoint.
    fn chat_completions_url(&self) -> String {
        if self
            .base_url
            .trim_end_matches('/')
            .ends_with("/chat/completions")
        {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }
}

/// Compose the system prompt from the tenant's profile. The business name
/// falls back to the tenant id so an unconfigured tenant still gets a
/// coherent persona.
fn system_prompt(tenant_id: &str, profile: Option<&TenantProfile>) -> String {
    let name = profile
        .and_then(|p| p.business_name.as_deref())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(tenant_id);
    let mut prompt = format!(
        "You are the customer assistant for {name}. \
         Answer the customer's message helpfully and briefly."
    );
    if let Some(tone) = profile.and_then(|p| p.tone.as_deref()) {
        prompt.push_str(&format!(" Keep your tone {tone}."));
    }
    if let Some(knowledge) = profile.and_then(|p| p.knowledge.as_deref()) {
        prompt.push_str(&format!("\n\nBusiness information:\n{knowledge}"));
    }
    prompt
}

#[derive(Debug, Serialize)]
struct ApiChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ReplyEngine for HttpReplyEngine {
    async fn generate(
        &self,
        tenant_id: &str,
        profile: Option<&TenantProfile>,
        user_text: &str,
    ) -> Result<String> {
        let request = ApiChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system_prompt(tenant_id, profile),
                },
                Message {
                    role: "user".to_string(),
                    content: user_text.to_string(),
                },
            ],
            temperature: self.temperature,
            stream: false,
        };

        let url = self.chat_completions_url();
        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.context("Reasoning service unreachable")?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Reasoning service error ({status}): {}",
                crate::util::truncate_with_ellipsis(&error, 200)
            );
        }

        let body: ApiChatResponse = response
            .json()
            .await
            .context("Invalid reasoning service response")?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Reasoning service returned an empty reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine_for(server: &MockServer, api_key: Option<&str>) -> HttpReplyEngine {
        HttpReplyEngine::new(&ReasoningConfig {
            base_url: server.uri(),
            api_key: api_key.map(str::to_string),
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn system_prompt_uses_profile_or_falls_back() {
        let bare = system_prompt("acme-dental", None);
        assert!(bare.contains("acme-dental"));

        let profile = TenantProfile {
            business_name: Some("Acme Dental".into()),
            tone: Some("warm".into()),
            knowledge: Some("Open 9-5.".into()),
        };
        let full = system_prompt("acme-dental", Some(&profile));
        assert!(full.contains("Acme Dental"));
        assert!(!full.contains("acme-dental"));
        assert!(full.contains("warm"));
        assert!(full.contains("Open 9-5."));
    }

    #[test]
    fn completions_url_tolerates_full_endpoint() {
        let config = ReasoningConfig {
            base_url: "http://localhost:11434/v1".into(),
            ..ReasoningConfig::default()
        };
        let engine = HttpReplyEngine::new(&config).unwrap();
        assert_eq!(
            engine.chat_completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );

        let config = ReasoningConfig {
            base_url: "http://localhost:11434/v1/chat/completions".into(),
            ..ReasoningConfig::default()
        };
        let engine = HttpReplyEngine::new(&config).unwrap();
        assert_eq!(
            engine.chat_completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn generate_posts_chat_shape_and_returns_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "gpt-4o-mini", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hello there!"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(&server, Some("test-key"));
        let reply = engine.generate("acme", None, "hi").await.unwrap();
        assert_eq!(reply, "Hello there!");
    }

    #[tokio::test]
    async fn generate_fails_on_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let engine = engine_for(&server, None);
        let err = engine.generate("acme", None, "hi").await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn generate_fails_on_empty_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "  "}}]
            })))
            .mount(&server)
            .await;

        let engine = engine_for(&server, None);
        assert!(engine.generate("acme", None, "hi").await.is_err());
    }
}
