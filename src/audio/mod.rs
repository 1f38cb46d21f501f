//! Audio device abstraction
//!
//! The orchestrator owns at most one open capture handle and one open
//! playback handle at any instant. Devices hand out exclusive handles;
//! dropping a handle releases the underlying stream. The cpal-backed
//! implementations live in [`capture`] and [`playback`]; tests substitute
//! their own.

mod capture;
mod playback;

pub use capture::CpalMicrophone;
pub use playback::CpalSpeaker;

use std::io::Cursor;

use tokio::sync::oneshot;

use crate::{Error, Result};

/// Sample rate for capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Exclusive handle to an open microphone stream
///
/// Dropping the handle without calling [`finish`](Self::finish) closes
/// the stream and discards the clip.
pub trait CaptureHandle: Send {
    /// Close the microphone and return the captured samples
    fn finish(self: Box<Self>) -> Vec<f32>;
}

/// Microphone capability
pub trait Microphone: Send + Sync {
    /// Acquire the microphone and start capturing
    ///
    /// # Errors
    ///
    /// Returns an audio error if the device is unavailable or access is
    /// denied.
    fn open(&self) -> Result<Box<dyn CaptureHandle>>;
}

/// Exclusive handle to an open speaker stream; dropping it stops playback
pub trait PlaybackHandle: Send {}

/// A playback in progress
pub struct ActivePlayback {
    /// Keeps the speaker stream open; drop to stop
    pub handle: Box<dyn PlaybackHandle>,
    /// Resolves when playback runs to completion; errors if stopped early
    pub done: oneshot::Receiver<()>,
}

/// Speaker capability
pub trait Speaker: Send + Sync {
    /// Start playing an MP3 clip
    ///
    /// # Errors
    ///
    /// Returns an audio error if the device is unavailable or the clip
    /// cannot be decoded.
    fn play(&self, mp3: &[u8]) -> Result<ActivePlayback>;
}

/// Convert f32 samples to WAV bytes for transcription APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode MP3 bytes to f32 samples, averaging stereo down to mono
pub(crate) fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let frame_samples: Vec<f32> = if frame.channels == 2 {
                    frame
                        .data
                        .chunks(2)
                        .map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            f32::midpoint(left, right)
                        })
                        .collect()
                } else {
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
                };

                samples.extend(frame_samples);
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}
