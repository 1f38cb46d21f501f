//! Remote service clients
//!
//! Each client is a stateless request/response wrapper. Hints and
//! credentials are fixed at construction; failures are mapped into the
//! crate error taxonomy before they reach the orchestrator.

mod dialogue;
mod synthesis;
mod transcription;

pub use dialogue::{DEFAULT_INPUT_FIELD, DEFAULT_REPLY_FIELD, Dialogue, WebhookDialogue};
pub use synthesis::{OpenAiSynthesizer, Synthesizer};
pub use transcription::{Transcriber, WhisperTranscriber};
