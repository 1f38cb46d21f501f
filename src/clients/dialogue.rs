//! Dialogue backend client
//!
//! Sends one user utterance to the assistant workflow webhook and returns
//! the reply text. The webhook contract is a JSON object with a
//! configurable input field plus the session id, answered by a JSON
//! object with a configurable reply field.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Result};

/// Default request field carrying the user utterance
pub const DEFAULT_INPUT_FIELD: &str = "chatInput";

/// Default response field carrying the assistant reply
pub const DEFAULT_REPLY_FIELD: &str = "output";

/// Sends an utterance to the remote dialogue backend
#[async_trait]
pub trait Dialogue: Send + Sync {
    /// Send the utterance, tagged with its session id, and return the reply
    async fn send(&self, utterance: &str, session_id: &str) -> Result<String>;
}

/// Dialogue client for webhook-style workflow backends
pub struct WebhookDialogue {
    client: reqwest::Client,
    url: String,
    bearer_token: Option<String>,
    input_field: String,
    reply_field: String,
}

impl WebhookDialogue {
    /// Create a new webhook dialogue client
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is missing.
    pub fn new(url: String, bearer_token: Option<String>) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::Config(
                "dialogue webhook URL required; set dialogue.url in config.toml".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            bearer_token,
            input_field: DEFAULT_INPUT_FIELD.to_string(),
            reply_field: DEFAULT_REPLY_FIELD.to_string(),
        })
    }

    /// Override the request/response field names
    #[must_use]
    pub fn with_fields(mut self, input_field: String, reply_field: String) -> Self {
        self.input_field = input_field;
        self.reply_field = reply_field;
        self
    }
}

#[async_trait]
impl Dialogue for WebhookDialogue {
    async fn send(&self, utterance: &str, session_id: &str) -> Result<String> {
        tracing::debug!(session_id, "dispatching utterance");

        let mut payload = serde_json::Map::new();
        payload.insert(
            "sessionId".to_string(),
            Value::String(session_id.to_string()),
        );
        payload.insert(
            self.input_field.clone(),
            Value::String(utterance.to_string()),
        );

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "dialogue request failed");
            Error::transport(&e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "dialogue backend error");
            let excerpt: String = body.chars().take(200).collect();
            return Err(Error::Upstream(format!("{status}: {excerpt}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let reply = body
            .get(&self.reply_field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Upstream(format!(
                    "dialogue response missing '{}' field",
                    self.reply_field
                ))
            })?;

        tracing::info!(reply_len = reply.len(), "dialogue reply received");
        Ok(reply.to_string())
    }
}
