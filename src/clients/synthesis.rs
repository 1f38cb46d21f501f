//! Text-to-speech client

use async_trait::async_trait;

use crate::{Error, Result};

/// Synthesizes reply text into playable audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize text to audio bytes (MP3)
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Synthesizes speech via the `OpenAI` TTS API
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    voice: String,
    speed: f64,
}

impl OpenAiSynthesizer {
    /// Create a new synthesizer
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the API key is missing.
    pub fn new(api_key: String, model: String, voice: String, speed: f64) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for speech synthesis; set api_keys.openai or OPENAI_API_KEY"
                    .to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            voice,
            speed,
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
        }

        tracing::debug!(text_len = text.len(), "starting synthesis");

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "synthesis request failed");
                Error::transport(&e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "synthesis API error");
            return Err(Error::from_status(status, &body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        tracing::debug!(audio_bytes = audio.len(), "synthesis complete");
        Ok(audio.to_vec())
    }
}
