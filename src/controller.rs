//! Top-level conversation coordinator
//!
//! The UI talks to this type only: typed input goes straight to the
//! dialogue backend, voice-mode toggles are delegated to the
//! orchestrator, and every resulting turn lands in the session store.

use std::sync::{Arc, Mutex};

use crate::audio::{PlaybackHandle, Speaker};
use crate::clients::{Dialogue, Synthesizer};
use crate::session::{Message, Sender, SessionStore};
use crate::voice::VoiceOrchestrator;
use crate::{Error, Result};

/// Transcript entry appended when a typed message cannot be answered
const SEND_ERROR_TEXT: &str = "Sorry, I couldn't reach the assistant. Please try again.";

/// Coordinates the session store, the dialogue backend, and voice mode
pub struct ConversationController {
    sessions: Arc<SessionStore>,
    dialogue: Arc<dyn Dialogue>,
    speaker: Arc<dyn Speaker>,
    /// Absent when no speech credential is configured
    synthesizer: Option<Arc<dyn Synthesizer>>,
    /// Absent when no speech credential is configured
    voice: Option<Arc<VoiceOrchestrator>>,
    /// Playback of an on-demand replay; replaced (and thereby stopped)
    /// by the next replay or by entering voice mode
    read_aloud: Mutex<Option<Box<dyn PlaybackHandle>>>,
}

impl ConversationController {
    pub fn new(
        sessions: Arc<SessionStore>,
        dialogue: Arc<dyn Dialogue>,
        speaker: Arc<dyn Speaker>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        voice: Option<Arc<VoiceOrchestrator>>,
    ) -> Self {
        Self {
            sessions,
            dialogue,
            speaker,
            synthesizer,
            voice,
            read_aloud: Mutex::new(None),
        }
    }

    /// The session store backing this conversation
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// The voice orchestrator, when voice mode is available
    pub fn voice(&self) -> Option<&Arc<VoiceOrchestrator>> {
        self.voice.as_ref()
    }

    /// Send a typed message to the assistant
    ///
    /// Whitespace-only input is rejected as a no-op. On dialogue failure
    /// a synthetic assistant message is appended so the transcript never
    /// stalls silently. When voice mode is on, the reply is also spoken
    /// through the orchestrator's epoch-guarded path.
    pub async fn send_typed(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let session_id = self.sessions.active_id();
        self.sessions
            .append_message(&session_id, Message::user(text));

        match self.dialogue.send(text, &session_id).await {
            Ok(reply) => {
                self.sessions
                    .append_message(&session_id, Message::assistant(&reply));

                if let Some(voice) = &self.voice
                    && voice.is_active()
                    && let Err(e) = voice.speak_reply(&reply).await
                {
                    tracing::warn!(error = %e, "failed to speak typed reply");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "dialogue failed for typed message");
                self.sessions
                    .append_message(&session_id, Message::assistant(SEND_ERROR_TEXT));
            }
        }
    }

    /// Toggle voice mode; returns the new on/off state
    ///
    /// # Errors
    ///
    /// Returns a configuration error when voice mode is unavailable
    /// (missing credential) and an audio error when the microphone is
    /// denied.
    pub fn toggle_voice_mode(&self) -> Result<bool> {
        let Some(voice) = &self.voice else {
            return Err(Error::Config(
                "voice mode needs an API credential; set api_keys.openai in config.toml or OPENAI_API_KEY"
                    .to_string(),
            ));
        };

        if voice.is_active() {
            voice.disable();
            Ok(false)
        } else {
            self.stop_read_aloud();
            voice.enable()?;
            Ok(true)
        }
    }

    /// Replay a past assistant message out loud
    ///
    /// Interrupts any replay already in progress, but never competes
    /// with the turn loop for the speaker: replay is refused while voice
    /// mode is on, and the check is repeated when the playback is
    /// installed in case voice mode came on during synthesis.
    ///
    /// # Errors
    ///
    /// Returns a configuration error without a speech credential, a
    /// not-found error for an unknown session/message, an audio error
    /// while voice mode holds the speaker, and synthesis or playback
    /// errors from the replay itself.
    pub async fn read_aloud(&self, session_id: &str, message_index: usize) -> Result<()> {
        let Some(synthesizer) = &self.synthesizer else {
            return Err(Error::Config(
                "read-aloud needs an API credential; set api_keys.openai in config.toml or OPENAI_API_KEY"
                    .to_string(),
            ));
        };

        let session = self
            .sessions
            .list_sessions()
            .into_iter()
            .find(|s| s.id == session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let message = session
            .messages
            .get(message_index)
            .filter(|m| m.sender == Sender::Assistant)
            .ok_or_else(|| {
                Error::NotFound(format!("assistant message {message_index} in {session_id}"))
            })?;

        self.ensure_speaker_free()?;
        let audio = synthesizer.synthesize(&message.text).await?;

        let done = {
            let mut slot = self.read_aloud.lock().expect("read-aloud slot poisoned");
            self.ensure_speaker_free()?;
            let playing = self.speaker.play(&audio)?;
            // Replacing the previous handle stops its playback
            *slot = Some(playing.handle);
            playing.done
        };

        let _ = done.await;
        Ok(())
    }

    /// Replay may only start while the turn loop is not running
    fn ensure_speaker_free(&self) -> Result<()> {
        match &self.voice {
            Some(voice) if voice.is_active() => Err(Error::Audio(
                "voice mode owns the speaker; turn it off to replay messages".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn stop_read_aloud(&self) {
        if let Ok(mut slot) = self.read_aloud.lock() {
            slot.take();
        }
    }
}
