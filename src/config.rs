//! Configuration management
//!
//! Defaults, overlaid by an optional TOML file under the platform config
//! directory, overlaid by environment variables for secrets. All file
//! fields are optional.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::voice::{FailurePolicy, VoicePolicy};
use crate::{Error, Result};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the session document lives
    pub data_dir: PathBuf,

    /// `OpenAI` API key for transcription and synthesis
    ///
    /// Absence is a valid state: voice mode and read-aloud are simply
    /// unavailable until one is configured.
    pub api_key: Option<String>,

    /// Dialogue backend settings
    pub dialogue: DialogueConfig,

    /// Voice pipeline settings
    pub voice: VoiceConfig,
}

/// Dialogue webhook settings
#[derive(Debug, Clone, Default)]
pub struct DialogueConfig {
    /// Workflow webhook URL
    pub url: Option<String>,

    /// Bearer token sent with every dialogue request
    pub bearer_token: Option<String>,

    /// Request field carrying the utterance (defaults to "chatInput")
    pub input_field: Option<String>,

    /// Response field carrying the reply (defaults to "output")
    pub reply_field: Option<String>,
}

/// Voice pipeline settings
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Transcription model (e.g. "whisper-1")
    pub stt_model: String,

    /// Transcription language hint (e.g. "th", "en")
    pub language: Option<String>,

    /// Synthesis model (e.g. "tts-1")
    pub tts_model: String,

    /// Synthesis voice identifier (e.g. "alloy")
    pub tts_voice: String,

    /// Synthesis speed multiplier
    pub tts_speed: f64,

    /// Hard ceiling on one capture window, in seconds
    pub capture_window_secs: u64,

    /// Pause between playback end and the next capture, in milliseconds
    pub settle_delay_ms: u64,

    /// Turn-failure behavior: keep listening or leave voice mode
    pub failure: FailurePolicy,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            stt_model: "whisper-1".to_string(),
            language: None,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
            capture_window_secs: 8,
            settle_delay_ms: 500,
            failure: FailurePolicy::default(),
        }
    }
}

impl VoiceConfig {
    /// Timing/failure policy for the orchestrator
    #[must_use]
    pub const fn policy(&self) -> VoicePolicy {
        VoicePolicy {
            capture_window: Duration::from_secs(self.capture_window_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            failure: self.failure,
        }
    }
}

/// Top-level TOML configuration file schema; every field is optional
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    data_dir: Option<PathBuf>,

    #[serde(default)]
    api_keys: ApiKeysFileConfig,

    #[serde(default)]
    dialogue: DialogueFileConfig,

    #[serde(default)]
    voice: VoiceFileConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ApiKeysFileConfig {
    openai: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DialogueFileConfig {
    url: Option<String>,
    bearer_token: Option<String>,
    input_field: Option<String>,
    reply_field: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VoiceFileConfig {
    stt_model: Option<String>,
    language: Option<String>,
    tts_model: Option<String>,
    tts_voice: Option<String>,
    tts_speed: Option<f64>,
    capture_window_secs: Option<u64>,
    settle_delay_ms: Option<u64>,
    /// "keep-listening" or "exit"
    on_failure: Option<String>,
}

impl Config {
    /// Load configuration
    ///
    /// `path` overrides the default config file location.
    ///
    /// # Errors
    ///
    /// Returns error if an existing config file cannot be parsed.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(default_config_path);

        let file = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)?;
                let parsed: ConfigFile = toml::from_str(&raw)?;
                tracing::debug!(path = %p.display(), "config file loaded");
                parsed
            }
            _ => ConfigFile::default(),
        };

        let defaults = VoiceConfig::default();
        let failure = match file.voice.on_failure.as_deref() {
            None => defaults.failure,
            Some("keep-listening") => FailurePolicy::KeepListening,
            Some("exit") => FailurePolicy::ExitVoiceMode,
            Some(other) => {
                return Err(Error::Config(format!(
                    "voice.on_failure must be \"keep-listening\" or \"exit\", got \"{other}\""
                )));
            }
        };

        Ok(Self {
            data_dir: file.data_dir.unwrap_or_else(default_data_dir),
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .or(file.api_keys.openai),
            dialogue: DialogueConfig {
                url: std::env::var("SKALD_DIALOGUE_URL")
                    .ok()
                    .filter(|u| !u.is_empty())
                    .or(file.dialogue.url),
                bearer_token: std::env::var("SKALD_DIALOGUE_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty())
                    .or(file.dialogue.bearer_token),
                input_field: file.dialogue.input_field,
                reply_field: file.dialogue.reply_field,
            },
            voice: VoiceConfig {
                stt_model: file.voice.stt_model.unwrap_or(defaults.stt_model),
                language: file.voice.language,
                tts_model: file.voice.tts_model.unwrap_or(defaults.tts_model),
                tts_voice: file.voice.tts_voice.unwrap_or(defaults.tts_voice),
                tts_speed: file.voice.tts_speed.unwrap_or(defaults.tts_speed),
                capture_window_secs: file
                    .voice
                    .capture_window_secs
                    .unwrap_or(defaults.capture_window_secs),
                settle_delay_ms: file.voice.settle_delay_ms.unwrap_or(defaults.settle_delay_ms),
                failure,
            },
        })
    }

    /// Path of the persisted session document
    #[must_use]
    pub fn sessions_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "skald", "skald")
        .map(|d| d.config_dir().join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "skald", "skald")
        .map_or_else(|| PathBuf::from(".skald"), |d| d.data_dir().to_path_buf())
}
