//! Direct Anthropic Messages API provider used to generate conversation turns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info, info_span, warn};

use matura_core::traits::Provider;
use matura_core::types::{Message, ModelInfo, Role, Usage};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Max retry attempts for transient errors.
const MAX_RETRIES: u32 = 3;

/// Chat turns are short; there is no point paying for long completions.
const DEFAULT_MAX_TOKENS: u32 = 256;

/// Stand-in opener when the conversation has no user message yet.
const OPENER: &str = "(start the conversation)";

/// Direct Anthropic provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    api_url: String,
    model: ModelInfo,
    max_tokens: u32,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: String, model_name: &str) -> Result<Self> {
        debug!(model = model_name, "creating anthropic provider");

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("failed to create HTTP client")?;

        let model = ModelInfo {
            name: strip_provider_prefix(model_name).to_owned(),
            context_limit: 200_000,
        };

        Ok(Self {
            client,
            api_key,
            api_url: ANTHROPIC_API_URL.to_owned(),
            model,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    /// Create from environment variable `env_var` (usually ANTHROPIC_API_KEY).
    pub fn from_env(env_var: &str, model_name: &str) -> Result<Self> {
        let api_key = std::env::var(env_var)
            .with_context(|| format!("{env_var} environment variable not set"))?;
        Self::new(api_key, model_name)
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point at a different endpoint (proxies, test servers).
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn build_request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(&self.api_url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(body)
    }

    /// Send a request with retry on transient errors (429, 500, 502, 503).
    async fn send_with_retry(&self, body: &Value) -> Result<reqwest::Response> {
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            let response = self
                .build_request(body)
                .send()
                .await
                .context("failed to send request to Anthropic")?;

            let status = response.status();
            debug!(status = %status, attempt = attempt + 1, "http response");

            if status.is_success() {
                return Ok(response);
            }

            if !is_retryable(status.as_u16()) || attempt == MAX_RETRIES {
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("Anthropic API error: {status} - {error_text}");
            }

            let error_text = response.text().await.unwrap_or_default();
            let base_ms = 1000u64 * 2u64.pow(attempt);
            let jitter_ms = rand::rng().random_range(0..500u64);
            let backoff_ms = base_ms + jitter_ms;
            warn!(
                attempt = attempt + 1,
                max = MAX_RETRIES,
                status = %status,
                backoff_ms,
                "retryable Anthropic error, backing off: {error_text}"
            );

            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;

            last_err = Some(format!("{status} - {error_text}"));
        }

        anyhow::bail!(
            "Anthropic API error after retries: {}",
            last_err.unwrap_or_default()
        );
    }

    fn build_body(&self, system: &str, messages: &[Message]) -> Value {
        let mut body = json!({
            "model": self.model.name,
            "max_tokens": self.max_tokens,
            "messages": format_messages(messages),
        });
        if !system.trim().is_empty() {
            body["system"] = json!(system);
        }
        body
    }
}

/// Strip "provider/" prefix from model ID
/// (e.g. "anthropic/claude-3-5-haiku-latest" -> "claude-3-5-haiku-latest").
fn strip_provider_prefix(model: &str) -> &str {
    model.strip_prefix("anthropic/").unwrap_or(model)
}

fn is_retryable(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503)
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Convert chat history to Anthropic API format.
///
/// The API wants strictly alternating roles starting with `user`, so
/// consecutive same-role messages are merged and a stand-in opener is
/// prepended when the history starts with the assistant (or is empty).
fn format_messages(messages: &[Message]) -> Vec<Value> {
    let mut merged: Vec<(Role, String)> = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        let text = message.content.trim();
        if text.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some((role, content)) if *role == message.role => {
                content.push('\n');
                content.push_str(text);
            }
            _ => merged.push((message.role, text.to_owned())),
        }
    }

    if merged.first().is_none_or(|(role, _)| *role != Role::User) {
        merged.insert(0, (Role::User, OPENER.to_owned()));
    }

    merged
        .into_iter()
        .map(|(role, content)| {
            json!({
                "role": role_str(role),
                "content": content,
            })
        })
        .collect()
}

/// Concatenate the text blocks of a response.
fn response_text(response: &AnthropicResponse) -> String {
    let mut text = String::new();
    for block in &response.content {
        if let ContentBlock::Text { text: part } = block {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(part);
        }
    }
    text
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("model", &self.model.name)
            .field("api_url", &self.api_url)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    async fn complete(&self, system: &str, messages: &[Message]) -> Result<(Message, Usage)> {
        let span = info_span!(
            "anthropic_request",
            model = %self.model.name,
            message_count = messages.len(),
        );

        async {
            let body = self.build_body(system, messages);
            let response = self.send_with_retry(&body).await?;

            let api_response: AnthropicResponse = response
                .json()
                .await
                .context("failed to parse Anthropic response")?;

            let text = response_text(&api_response);
            anyhow::ensure!(!text.trim().is_empty(), "Anthropic returned no text");

            let usage = Usage {
                input_tokens: Some(api_response.usage.input_tokens),
                output_tokens: Some(api_response.usage.output_tokens),
            };

            info!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = %api_response.stop_reason.as_deref().unwrap_or("unknown"),
                "anthropic response"
            );

            Ok((Message::assistant(text), usage))
        }
        .instrument(span)
        .await
    }
}

// --- API response types ---

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: ApiUsage,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}
