//! Skald - voice and text conversation client for AI assistants
//!
//! This library provides the core of a conversational client:
//! - Session store: independent persisted conversation threads
//! - Thin clients for transcription, dialogue, and speech synthesis
//! - Voice orchestrator: the epoch-guarded turn state machine
//! - Conversation controller: the single surface the UI talks to
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                UI (out of scope)               │
//! └──────────────────────┬─────────────────────────┘
//!                        │
//! ┌──────────────────────▼─────────────────────────┐
//! │            ConversationController              │
//! │   typed input   │  voice toggle  │  read-aloud │
//! └───────┬──────────────────┬─────────────────────┘
//!         │                  │
//! ┌───────▼──────┐  ┌────────▼────────────────────┐
//! │ DialogueClnt │  │      VoiceOrchestrator      │
//! │  (webhook)   │  │ capture → STT → dispatch →  │
//! │              │  │     TTS → playback loop     │
//! └───────┬──────┘  └────────┬────────────────────┘
//!         └────────┬─────────┘
//!         ┌────────▼─────────┐
//!         │   SessionStore   │
//!         └──────────────────┘
//! ```

pub mod audio;
pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod session;
pub mod voice;

pub use config::Config;
pub use controller::ConversationController;
pub use error::{Error, Result};
pub use session::{Message, Sender, Session, SessionStore};
pub use voice::{FailurePolicy, Notice, Phase, VoiceOrchestrator, VoicePolicy};
