//! Voice conversation orchestration
//!
//! One continuously-running state machine drives the
//! capture → transcribe → dispatch → synthesize → speak loop and owns the
//! microphone and speaker resources.

mod orchestrator;

pub use orchestrator::{
    FailurePolicy, Notice, Phase, VoiceOrchestrator, VoiceOrchestratorBuilder, VoicePolicy,
};
