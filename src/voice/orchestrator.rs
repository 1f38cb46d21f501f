//! The voice turn state machine
//!
//! All voice-session state lives behind one mutex that is never held
//! across an await, so transitions between suspension points are atomic.
//! Every asynchronous step captures the epoch counter at submission and
//! re-checks it on completion; `disable` bumps the epoch, which makes any
//! in-flight result stale and side-effect free. Cancellation therefore
//! never races a turn: late transcripts, replies, and audio are simply
//! dropped.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};

use crate::audio::{CaptureHandle, Microphone, PlaybackHandle, SAMPLE_RATE, Speaker, samples_to_wav};
use crate::clients::{Dialogue, Synthesizer, Transcriber};
use crate::Result;
use crate::session::{Message, SessionStore};

/// Transcript entry appended when a turn's dialogue call fails
const TURN_ERROR_TEXT: &str = "Sorry, something went wrong answering that.";

/// Phase of the voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Voice mode off; also entered immediately on cancellation
    Idle,
    /// Microphone open, accumulating the utterance
    Capturing,
    /// Clip submitted for transcription
    Transcribing,
    /// Transcript submitted to the dialogue backend
    Dispatching,
    /// Reply submitted for speech synthesis
    Synthesizing,
    /// Reply audio playing
    Speaking,
}

/// What to do when a dialogue or synthesis call fails mid-turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// End the turn, surface a notice, go back to capturing
    #[default]
    KeepListening,
    /// End the turn and leave voice mode entirely
    ExitVoiceMode,
}

/// Timing and failure policy for the turn loop
#[derive(Debug, Clone)]
pub struct VoicePolicy {
    /// Hard ceiling on one capture window; guarantees forward progress
    /// even with a silent, open microphone
    pub capture_window: Duration,
    /// Pause between playback ending and the next capture starting
    pub settle_delay: Duration,
    /// Behavior on dialogue/synthesis failure
    pub failure: FailurePolicy,
}

impl Default for VoicePolicy {
    fn default() -> Self {
        Self {
            capture_window: Duration::from_secs(8),
            settle_delay: Duration::from_millis(500),
            failure: FailurePolicy::default(),
        }
    }
}

/// Recoverable conditions surfaced to the user without stopping the loop
#[derive(Debug, Clone)]
pub enum Notice {
    TranscriptionFailed(String),
    DialogueFailed(String),
    SynthesisFailed(String),
    PlaybackFailed(String),
    MicrophoneUnavailable(String),
}

struct VoiceState {
    phase: Phase,
    /// Bumped on every disable; stale results are dropped unapplied
    epoch: u64,
    capture: Option<Box<dyn CaptureHandle>>,
    playback: Option<Box<dyn PlaybackHandle>>,
    /// Bumped on every playback install, so a finished playback can tell
    /// whether the slot still holds its own handle before clearing it
    playback_seq: u64,
}

/// Drives the voice turn loop and owns the audio resources
///
/// At most one capture handle and one playback handle are open at any
/// instant; only this type mutates the listening/speaking phase.
pub struct VoiceOrchestrator {
    mic: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    transcriber: Arc<dyn Transcriber>,
    dialogue: Arc<dyn Dialogue>,
    synthesizer: Arc<dyn Synthesizer>,
    fallback_transcriber: Option<Arc<dyn Transcriber>>,
    fallback_synthesizer: Option<Arc<dyn Synthesizer>>,
    sessions: Arc<SessionStore>,
    policy: VoicePolicy,
    state: Mutex<VoiceState>,
    phase_tx: watch::Sender<Phase>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<Notice>>>,
    capture_stop: Notify,
}

/// Builder for [`VoiceOrchestrator`]
pub struct VoiceOrchestratorBuilder {
    mic: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    transcriber: Arc<dyn Transcriber>,
    dialogue: Arc<dyn Dialogue>,
    synthesizer: Arc<dyn Synthesizer>,
    sessions: Arc<SessionStore>,
    policy: VoicePolicy,
    fallback_transcriber: Option<Arc<dyn Transcriber>>,
    fallback_synthesizer: Option<Arc<dyn Synthesizer>>,
}

impl VoiceOrchestratorBuilder {
    #[must_use]
    pub fn policy(mut self, policy: VoicePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Degraded on-device transcriber, tried after a primary failure
    #[must_use]
    pub fn fallback_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.fallback_transcriber = Some(transcriber);
        self
    }

    /// Degraded on-device synthesizer, tried after a primary failure
    #[must_use]
    pub fn fallback_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.fallback_synthesizer = Some(synthesizer);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<VoiceOrchestrator> {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        Arc::new(VoiceOrchestrator {
            mic: self.mic,
            speaker: self.speaker,
            transcriber: self.transcriber,
            dialogue: self.dialogue,
            synthesizer: self.synthesizer,
            fallback_transcriber: self.fallback_transcriber,
            fallback_synthesizer: self.fallback_synthesizer,
            sessions: self.sessions,
            policy: self.policy,
            state: Mutex::new(VoiceState {
                phase: Phase::Idle,
                epoch: 0,
                capture: None,
                playback: None,
                playback_seq: 0,
            }),
            phase_tx,
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            capture_stop: Notify::new(),
        })
    }
}

impl VoiceOrchestrator {
    pub fn builder(
        mic: Arc<dyn Microphone>,
        speaker: Arc<dyn Speaker>,
        transcriber: Arc<dyn Transcriber>,
        dialogue: Arc<dyn Dialogue>,
        synthesizer: Arc<dyn Synthesizer>,
        sessions: Arc<SessionStore>,
    ) -> VoiceOrchestratorBuilder {
        VoiceOrchestratorBuilder {
            mic,
            speaker,
            transcriber,
            dialogue,
            synthesizer,
            sessions,
            policy: VoicePolicy::default(),
            fallback_transcriber: None,
            fallback_synthesizer: None,
        }
    }

    /// Turn voice mode on
    ///
    /// No-op when already running. The microphone is acquired before any
    /// state changes; on denial the orchestrator stays `Idle` and does
    /// not retry.
    ///
    /// # Errors
    ///
    /// Returns an audio error if the microphone cannot be acquired.
    pub fn enable(self: &Arc<Self>) -> Result<()> {
        let mut st = self.lock();
        if st.phase != Phase::Idle {
            tracing::debug!(phase = ?st.phase, "enable ignored, voice mode already on");
            return Ok(());
        }

        let handle = self.mic.open()?;
        st.capture = Some(handle);
        self.set_phase(&mut st, Phase::Capturing);
        let epoch = st.epoch;
        drop(st);

        tracing::info!("voice mode on");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.turn_loop(epoch).await });
        Ok(())
    }

    /// Turn voice mode off
    ///
    /// Bumps the epoch (invalidating every in-flight result), releases
    /// the microphone and speaker synchronously, and snaps to `Idle`.
    /// Idempotent: a second call while `Idle` changes nothing.
    pub fn disable(&self) {
        let mut st = self.lock();
        if st.phase == Phase::Idle {
            return;
        }

        st.epoch += 1;
        st.capture = None;
        st.playback = None;
        self.set_phase(&mut st, Phase::Idle);
        drop(st);
        tracing::info!("voice mode off");
    }

    /// End the current capture window early
    ///
    /// Ignored unless a capture is in progress.
    pub fn finish_capture(&self) {
        self.capture_stop.notify_waiters();
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Whether voice mode is on
    pub fn is_active(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Subscribe to phase changes (for UI listening/speaking indicators)
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Take the notice receiver; yields `Some` exactly once
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<Notice>> {
        self.notice_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Speak a reply that arrived through the typed path
    ///
    /// Epoch-guarded like every other voice step, and skipped entirely
    /// unless the orchestrator is quietly capturing — it never talks over
    /// a turn that is already dispatching or speaking.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis fails.
    pub async fn speak_reply(&self, text: &str) -> Result<()> {
        let epoch = {
            let st = self.lock();
            if st.phase != Phase::Capturing {
                return Ok(());
            }
            st.epoch
        };

        let audio = self.synthesize_step(text).await?;

        let (done, seq) = {
            let mut st = self.lock();
            if st.epoch != epoch || st.phase != Phase::Capturing || st.playback.is_some() {
                return Ok(());
            }
            let playing = self.speaker.play(&audio)?;
            st.playback = Some(playing.handle);
            st.playback_seq += 1;
            (playing.done, st.playback_seq)
        };
        let _ = done.await;

        // Clear only our own handle; a turn that started while this was
        // playing may have installed its own playback in the slot
        let mut st = self.lock();
        if st.epoch == epoch && st.playback_seq == seq {
            st.playback = None;
        }
        Ok(())
    }

    /// One enable's worth of turns; exits when its epoch goes stale
    async fn turn_loop(self: Arc<Self>, epoch: u64) {
        loop {
            // Capturing: bounded window, ended early by finish_capture
            tokio::select! {
                () = tokio::time::sleep(self.policy.capture_window) => {}
                () = self.capture_stop.notified() => {}
            }

            let handle = {
                let mut st = self.lock();
                if st.epoch != epoch {
                    return;
                }
                let Some(handle) = st.capture.take() else {
                    return;
                };
                self.set_phase(&mut st, Phase::Transcribing);
                handle
            };

            // Closing the device joins its stream thread; keep that off
            // the async workers
            let samples = tokio::task::spawn_blocking(move || handle.finish())
                .await
                .unwrap_or_default();

            let text = match samples_to_wav(&samples, SAMPLE_RATE) {
                Ok(wav) => match self.transcribe_step(&wav).await {
                    Ok(text) => text,
                    Err(e) => {
                        // Recoverable-retryable: notice, then behave like silence
                        self.notify(Notice::TranscriptionFailed(e.to_string()));
                        String::new()
                    }
                },
                Err(e) => {
                    self.notify(Notice::TranscriptionFailed(e.to_string()));
                    String::new()
                }
            };

            if self.stale(epoch) {
                return;
            }

            let text = text.trim().to_string();
            if text.is_empty() {
                // Silence: discard the clip and listen again
                if self.reopen_capture(epoch) {
                    continue;
                }
                return;
            }

            // Dispatching
            let session_id = {
                let mut st = self.lock();
                if st.epoch != epoch {
                    return;
                }
                self.set_phase(&mut st, Phase::Dispatching);
                drop(st);
                self.sessions.active_id()
            };
            self.sessions.append_message(&session_id, Message::user(&text));

            let reply = match self.dialogue.send(&text, &session_id).await {
                Ok(reply) => reply,
                Err(e) => {
                    if self.stale(epoch) {
                        return;
                    }
                    self.notify(Notice::DialogueFailed(e.to_string()));
                    self.sessions
                        .append_message(&session_id, Message::assistant(TURN_ERROR_TEXT));
                    if self.end_turn_after_failure(epoch) {
                        continue;
                    }
                    return;
                }
            };

            if self.stale(epoch) {
                return;
            }

            // Synthesizing
            {
                let mut st = self.lock();
                if st.epoch != epoch {
                    return;
                }
                self.set_phase(&mut st, Phase::Synthesizing);
            }
            self.sessions
                .append_message(&session_id, Message::assistant(&reply));

            let audio = match self.synthesize_step(&reply).await {
                Ok(audio) => audio,
                Err(e) => {
                    if self.stale(epoch) {
                        return;
                    }
                    self.notify(Notice::SynthesisFailed(e.to_string()));
                    if self.end_turn_after_failure(epoch) {
                        continue;
                    }
                    return;
                }
            };

            // Speaking: the epoch check and playback start are atomic
            let done = {
                let mut st = self.lock();
                if st.epoch != epoch {
                    return;
                }
                match self.speaker.play(&audio) {
                    Ok(playing) => {
                        st.playback = Some(playing.handle);
                        st.playback_seq += 1;
                        self.set_phase(&mut st, Phase::Speaking);
                        playing.done
                    }
                    Err(e) => {
                        drop(st);
                        self.notify(Notice::PlaybackFailed(e.to_string()));
                        if self.end_turn_after_failure(epoch) {
                            continue;
                        }
                        return;
                    }
                }
            };
            // Errors here mean the handle was dropped by disable
            let _ = done.await;

            {
                let mut st = self.lock();
                if st.epoch != epoch {
                    return;
                }
                st.playback = None;
            }

            // Settle before listening again; the timer is tied to the
            // epoch so it cannot restart capture after a disable
            tokio::time::sleep(self.policy.settle_delay).await;
            if !self.reopen_capture(epoch) {
                return;
            }
        }
    }

    async fn transcribe_step(&self, wav: &[u8]) -> Result<String> {
        match self.transcriber.transcribe(wav).await {
            Ok(text) => Ok(text),
            Err(primary) => match &self.fallback_transcriber {
                Some(fallback) => {
                    tracing::warn!(error = %primary, "transcription failed, trying fallback");
                    fallback.transcribe(wav).await
                }
                None => Err(primary),
            },
        }
    }

    async fn synthesize_step(&self, text: &str) -> Result<Vec<u8>> {
        match self.synthesizer.synthesize(text).await {
            Ok(audio) => Ok(audio),
            Err(primary) => match &self.fallback_synthesizer {
                Some(fallback) => {
                    tracing::warn!(error = %primary, "synthesis failed, trying fallback");
                    fallback.synthesize(text).await
                }
                None => Err(primary),
            },
        }
    }

    /// Re-acquire the microphone for the next turn
    ///
    /// Returns false when the epoch went stale or the device vanished;
    /// the latter leaves voice mode.
    fn reopen_capture(&self, epoch: u64) -> bool {
        let mut st = self.lock();
        if st.epoch != epoch {
            return false;
        }
        match self.mic.open() {
            Ok(handle) => {
                st.capture = Some(handle);
                self.set_phase(&mut st, Phase::Capturing);
                true
            }
            Err(e) => {
                drop(st);
                self.notify(Notice::MicrophoneUnavailable(e.to_string()));
                self.disable();
                false
            }
        }
    }

    /// Apply the failure policy after a turn-ending error
    ///
    /// Returns true if the loop should continue capturing.
    fn end_turn_after_failure(&self, epoch: u64) -> bool {
        match self.policy.failure {
            FailurePolicy::KeepListening => self.reopen_capture(epoch),
            FailurePolicy::ExitVoiceMode => {
                self.disable();
                false
            }
        }
    }

    fn stale(&self, epoch: u64) -> bool {
        self.lock().epoch != epoch
    }

    fn set_phase(&self, st: &mut MutexGuard<'_, VoiceState>, phase: Phase) {
        st.phase = phase;
        let _ = self.phase_tx.send(phase);
        tracing::debug!(?phase, "voice phase");
    }

    fn notify(&self, notice: Notice) {
        tracing::warn!(?notice, "voice notice");
        let _ = self.notice_tx.send(notice);
    }

    fn lock(&self) -> MutexGuard<'_, VoiceState> {
        self.state.lock().expect("voice state poisoned")
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Capturing => "listening",
            Self::Transcribing => "transcribing",
            Self::Dispatching => "thinking",
            Self::Synthesizing => "synthesizing",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TranscriptionFailed(e) => write!(f, "couldn't transcribe that: {e}"),
            Self::DialogueFailed(e) => write!(f, "assistant unreachable: {e}"),
            Self::SynthesisFailed(e) => write!(f, "couldn't synthesize the reply: {e}"),
            Self::PlaybackFailed(e) => write!(f, "couldn't play the reply: {e}"),
            Self::MicrophoneUnavailable(e) => write!(f, "microphone unavailable: {e}"),
        }
    }
}
