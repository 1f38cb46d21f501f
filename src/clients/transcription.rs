//! Speech-to-text client

use async_trait::async_trait;

use crate::{Error, Result};

/// Transcribes a captured audio clip to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio bytes
    ///
    /// An empty string is a valid result (silence); the caller decides
    /// what to do with it.
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Response from the Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes speech via the `OpenAI` Whisper API
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    language: Option<String>,
}

impl WhisperTranscriber {
    /// Create a new Whisper transcriber
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the API key is missing.
    pub fn new(api_key: String, model: String, language: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for transcription; set api_keys.openai or OPENAI_API_KEY"
                    .to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            language,
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transport(e.to_string()))?,
            )
            .text("model", self.model.clone());

        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "transcription request failed");
                Error::transport(&e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::from_status(status, &body));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}
