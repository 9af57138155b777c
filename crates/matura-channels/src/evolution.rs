//! HTTP messaging channel speaking the Evolution API dialect.
//!
//! Each identity is an "instance" on the API server; sending text is
//! `POST {base_url}/message/sendText/{instance}` authenticated with an
//! `apikey` header.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use matura_core::{Channel, ChannelError, ChannelEvent, ChannelHealth};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{Instrument, debug, info_span, warn};


pub struct EvolutionChannel {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
}

impl EvolutionChannel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            id: "evolution".to_owned(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
        })
    }

    fn send_url(&self, instance: &str) -> String {
        format!("{}/message/sendText/{instance}", self.base_url)
    }
}

impl std::fmt::Debug for EvolutionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionChannel")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Request body for `sendText`. The API takes the bare number or a JID.
fn send_body(address: &str, text: &str) -> Value {
    json!({
        "number": address,
        "text": text,
    })
}

/// Map a non-success HTTP status to a channel error.
fn classify_status(status: StatusCode, body: &str) -> ChannelError {
    let message = format!("{status}: {}", body.trim());
    match status.as_u16() {
        408 | 425 | 429 => ChannelError::Transient(message),
        s if s >= 500 => ChannelError::Transient(message),
        _ => ChannelError::Fatal(message),
    }
}

/// Map a transport-level failure to a channel error.
fn classify_transport(error: &reqwest::Error) -> ChannelError {
    if error.is_builder() {
        ChannelError::Fatal(error.to_string())
    } else {
        ChannelError::Transient(error.to_string())
    }
}

#[async_trait]
impl Channel for EvolutionChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_text(
        &self,
        instance: &str,
        address: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let span = info_span!(
            "evolution_send",
            instance,
            content_len = text.len(),
        );

        async {
            let response = self
                .client
                .post(self.send_url(instance))
                .header("apikey", &self.api_key)
                .json(&send_body(address, text))
                .send()
                .await
                .map_err(|e| classify_transport(&e))?;

            let status = response.status();
            if status.is_success() {
                debug!(status = %status, "evolution send accepted");
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            let error = classify_status(status, &body);
            warn!(status = %status, error = %error, "evolution send rejected");
            Err(error)
        }
        .instrument(span)
        .await
    }

    async fn probe(&self) -> ChannelHealth {
        match self
            .client
            .get(&self.base_url)
            .header("apikey", &self.api_key)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => ChannelHealth::Healthy,
            Ok(response) => ChannelHealth::Degraded(format!("status {}", response.status())),
            Err(error) => ChannelHealth::Unhealthy(error.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound webhook events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: Option<String>,
    instance: Option<String>,
    data: Option<WebhookData>,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    key: Option<WebhookKey>,
    message: Option<WebhookMessage>,
    #[serde(rename = "messageTimestamp")]
    message_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WebhookKey {
    #[serde(rename = "remoteJid")]
    remote_jid: Option<String>,
    #[serde(rename = "fromMe", default)]
    from_me: bool,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    conversation: Option<String>,
    #[serde(rename = "extendedTextMessage")]
    extended_text: Option<ExtendedText>,
}

#[derive(Debug, Deserialize)]
struct ExtendedText {
    text: Option<String>,
}

/// Parse an inbound-message webhook payload into a [`ChannelEvent`].
///
/// Returns `None` for other event types and payloads missing the instance
/// or sender.
pub fn parse_webhook_event(payload: &Value) -> Option<ChannelEvent> {
    let payload: WebhookPayload = serde_json::from_value(payload.clone()).ok()?;

    if let Some(ref event) = payload.event {
        let normalized = event.to_ascii_lowercase().replace('_', ".");
        if normalized != "messages.upsert" {
            return None;
        }
    }

    let instance = payload.instance?;
    let data = payload.data?;
    let key = data.key?;
    let from_address = key.remote_jid?;

    let content = data
        .message
        .and_then(|m| {
            m.conversation
                .or_else(|| m.extended_text.and_then(|e| e.text))
        })
        .unwrap_or_default();

    let timestamp: DateTime<Utc> = data
        .message_timestamp
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    Some(ChannelEvent {
        instance,
        from_address,
        content,
        from_me: key.from_me,
        timestamp,
    })
}
