//! Shared test doubles for the voice pipeline
//!
//! No audio hardware or network involved; devices count their live
//! handles so tests can assert the one-capture/one-playback invariant.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use skald::audio::{ActivePlayback, CaptureHandle, Microphone, PlaybackHandle, Speaker};
use skald::clients::{Dialogue, Synthesizer, Transcriber};
use skald::{Error, Result};

/// Handle bookkeeping shared between a mock device and its handles
#[derive(Default)]
pub struct DeviceStats {
    pub opens: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl DeviceStats {
    fn handle_opened(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }

    fn handle_closed(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Microphone whose clips are canned samples
pub struct MockMicrophone {
    pub stats: Arc<DeviceStats>,
    samples: Vec<f32>,
    deny: AtomicBool,
}

impl MockMicrophone {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Arc::new(DeviceStats::default()),
            samples: vec![0.1; 1600],
            deny: AtomicBool::new(false),
        }
    }

    /// Make every subsequent open fail, as a revoked device would
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }
}

impl Microphone for MockMicrophone {
    fn open(&self) -> Result<Box<dyn CaptureHandle>> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::Audio("microphone access denied".to_string()));
        }
        self.stats.handle_opened();
        Ok(Box::new(MockCaptureHandle {
            samples: self.samples.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockCaptureHandle {
    samples: Vec<f32>,
    stats: Arc<DeviceStats>,
}

impl CaptureHandle for MockCaptureHandle {
    fn finish(self: Box<Self>) -> Vec<f32> {
        self.samples.clone()
    }
}

impl Drop for MockCaptureHandle {
    fn drop(&mut self) {
        self.stats.handle_closed();
    }
}

/// Speaker that completes every clip instantly (or holds it open forever
/// until the handle is dropped, when built with [`MockSpeaker::holding`])
pub struct MockSpeaker {
    pub stats: Arc<DeviceStats>,
    hold: bool,
}

impl MockSpeaker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Arc::new(DeviceStats::default()),
            hold: false,
        }
    }

    /// Playback never finishes on its own; only dropping the handle ends it
    #[must_use]
    pub fn holding() -> Self {
        Self {
            stats: Arc::new(DeviceStats::default()),
            hold: true,
        }
    }
}

impl Speaker for MockSpeaker {
    fn play(&self, _mp3: &[u8]) -> Result<ActivePlayback> {
        self.stats.handle_opened();
        let (done_tx, done_rx) = oneshot::channel();

        let done_tx = if self.hold {
            Some(done_tx)
        } else {
            let _ = done_tx.send(());
            None
        };

        Ok(ActivePlayback {
            handle: Box::new(MockPlaybackHandle {
                stats: Arc::clone(&self.stats),
                _done_tx: done_tx,
            }),
            done: done_rx,
        })
    }
}

struct MockPlaybackHandle {
    stats: Arc<DeviceStats>,
    /// Held so that dropping the handle cancels the done signal
    _done_tx: Option<oneshot::Sender<()>>,
}

impl PlaybackHandle for MockPlaybackHandle {}

impl Drop for MockPlaybackHandle {
    fn drop(&mut self) {
        self.stats.handle_closed();
    }
}

/// Transcriber with a queue of scripted results, then a fixed default
pub struct MockTranscriber {
    pub calls: AtomicUsize,
    queue: Mutex<VecDeque<std::result::Result<String, String>>>,
    default: std::result::Result<String, String>,
}

impl MockTranscriber {
    #[must_use]
    pub fn returning(text: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            default: Ok(text.to_string()),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            default: Err("transcription service down".to_string()),
        }
    }

    /// Queue a result consumed before the default kicks in
    #[must_use]
    pub fn then(self, result: std::result::Result<&str, &str>) -> Self {
        self.queue
            .lock()
            .unwrap()
            .push_back(result.map(str::to_string).map_err(str::to_string));
        self
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());
        result.map_err(Error::Transport)
    }
}

/// Dialogue backend double; records every utterance it receives
pub struct MockDialogue {
    pub sent: Mutex<Vec<(String, String)>>,
    reply: String,
    fail: bool,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockDialogue {
    #[must_use]
    pub fn replying(reply: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reply: reply.to_string(),
            fail: false,
            gate: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reply: String::new(),
            fail: true,
            gate: Mutex::new(None),
        }
    }

    /// The first send blocks until the returned sender fires, giving
    /// tests a deterministic in-flight window
    #[must_use]
    pub fn gated(reply: &str) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let dialogue = Self {
            sent: Mutex::new(Vec::new()),
            reply: reply.to_string(),
            fail: false,
            gate: Mutex::new(Some(rx)),
        };
        (dialogue, tx)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Dialogue for MockDialogue {
    async fn send(&self, utterance: &str, session_id: &str) -> Result<String> {
        self.sent
            .lock()
            .unwrap()
            .push((utterance.to_string(), session_id.to_string()));

        let gate = self.gate.lock().unwrap().take();
        if let Some(rx) = gate {
            let _ = rx.await;
        }

        if self.fail {
            return Err(Error::Upstream("dialogue backend down".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Synthesizer returning a canned clip
pub struct MockSynthesizer {
    pub calls: AtomicUsize,
    fail: bool,
}

impl MockSynthesizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Upstream("synthesis down".to_string()));
        }
        Ok(vec![0u8; 64])
    }
}
