//! Speaker playback via cpal
//!
//! Like capture, each playback owns its stream on a dedicated thread.
//! The handle carries a stop flag; dropping the handle makes the thread
//! tear the stream down mid-clip.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::{ActivePlayback, PlaybackHandle, Speaker, decode_mp3};
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Plays to the default output device
pub struct CpalSpeaker;

impl CpalSpeaker {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for CpalSpeaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalSpeaker {
    /// Start playing raw f32 samples (used by the speaker self-test)
    ///
    /// # Errors
    ///
    /// Returns an audio error if the device is unavailable.
    pub fn play_samples(&self, samples: Vec<f32>) -> Result<ActivePlayback> {
        let stopped = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let thread_stopped = Arc::clone(&stopped);
        std::thread::spawn(move || {
            let sample_count = samples.len();
            let finished = Arc::new(AtomicBool::new(false));

            let stream = match build_output_stream(samples, &finished) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            // Poll for completion, bounded by the clip duration
            let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
            let deadline = std::time::Instant::now() + Duration::from_millis(duration_ms + 500);

            while !finished.load(Ordering::Relaxed) {
                if thread_stopped.load(Ordering::Relaxed) {
                    drop(stream);
                    tracing::debug!("playback stopped early");
                    return;
                }
                if std::time::Instant::now() > deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }

            // Let the last buffer drain
            std::thread::sleep(Duration::from_millis(100));
            drop(stream);
            tracing::debug!(samples = sample_count, "playback complete");
            let _ = done_tx.send(());
        });

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;

        Ok(ActivePlayback {
            handle: Box::new(CpalPlaybackHandle { stopped }),
            done: done_rx,
        })
    }
}

impl Speaker for CpalSpeaker {
    fn play(&self, mp3: &[u8]) -> Result<ActivePlayback> {
        self.play_samples(decode_mp3(mp3)?)
    }
}

struct CpalPlaybackHandle {
    stopped: Arc<AtomicBool>,
}

impl PlaybackHandle for CpalPlaybackHandle {}

impl Drop for CpalPlaybackHandle {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

fn build_output_stream(samples: Vec<f32>, finished: &Arc<AtomicBool>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels = config.channels,
        "audio playback initialized"
    );

    let channels = config.channels as usize;
    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::clone(finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut pos) = position.lock() else {
                    return;
                };

                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < samples.len() {
                        samples[*pos]
                    } else {
                        finished.store(true, Ordering::Relaxed);
                        0.0
                    };

                    for out in frame.iter_mut() {
                        *out = sample;
                    }

                    if *pos < samples.len() {
                        *pos += 1;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    Ok(stream)
}
