//! Error types for the skald client

use thiserror::Error;

/// Result type alias for skald operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the skald client
///
/// Network and service failures are converted into this taxonomy at the
/// client boundary; the voice state machine never sees a raw transport
/// error.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, bad config file)
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential rejected by a remote service
    #[error("auth error: {0}")]
    Auth(String),

    /// Remote service rate limit or quota exhausted
    #[error("quota error: {0}")]
    Quota(String),

    /// Request failed on the wire (connect, timeout, malformed response)
    #[error("transport error: {0}")]
    Transport(String),

    /// Dialogue backend returned an error or an unusable payload
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Audio device error (capture or playback)
    #[error("audio error: {0}")]
    Audio(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Classify a `reqwest` failure as a transport error
    pub fn transport(e: &reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }

    /// Map an HTTP error status + body into the client error taxonomy
    ///
    /// 401/403 become [`Error::Auth`], 429 becomes [`Error::Quota`],
    /// everything else is a transport failure with a body excerpt.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let excerpt: String = body.chars().take(200).collect();
        match status.as_u16() {
            401 | 403 => Self::Auth(format!("{status}: {excerpt}")),
            429 => Self::Quota(format!("{status}: {excerpt}")),
            _ => Self::Transport(format!("{status}: {excerpt}")),
        }
    }
}
