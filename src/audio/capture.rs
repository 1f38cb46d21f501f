//! Microphone capture via cpal
//!
//! cpal streams are not `Send`, so each capture runs on a dedicated
//! thread that owns the stream; the handle communicates over channels.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::{CaptureHandle, Microphone, SAMPLE_RATE};
use crate::{Error, Result};

/// Captures from the default input device
pub struct CpalMicrophone;

impl CpalMicrophone {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self) -> Result<Box<dyn CaptureHandle>> {
        let buffer: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_buffer = Arc::clone(&buffer);
        let join = std::thread::spawn(move || {
            let stream = match build_input_stream(&thread_buffer) {
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

            // Parks until the handle finishes or is dropped
            let _ = stop_rx.recv();
            drop(stream);
            tracing::debug!("audio capture stopped");
        });

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited".to_string()))??;

        tracing::debug!(sample_rate = SAMPLE_RATE, "audio capture started");

        Ok(Box::new(CpalCaptureHandle {
            buffer,
            stop_tx,
            join,
        }))
    }
}

struct CpalCaptureHandle {
    buffer: Arc<Mutex<Vec<f32>>>,
    stop_tx: mpsc::Sender<()>,
    join: std::thread::JoinHandle<()>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn finish(self: Box<Self>) -> Vec<f32> {
        let this = *self;
        let _ = this.stop_tx.send(());
        let _ = this.join.join();
        this.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

fn build_input_stream(buffer: &Arc<Mutex<Vec<f32>>>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let buffer = Arc::clone(buffer);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    Ok(stream)
}
