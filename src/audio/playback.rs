//! Speaker output via cpal.
//!
//! Keeps one open output stream whose callback drains a shared sample
//! queue; [`AudioOutput::write`] appends to the queue and
//! [`AudioOutput::flush`] waits for it to drain, so the sequencer can tell
//! when a frame has actually been rendered.

use crate::audio::AudioOutput;
use crate::config::AudioConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// An open speaker stream fed from a shared sample queue.
///
/// Dropping the value stops the stream and releases the device.
pub struct CpalOutput {
    _stream: cpal::Stream,
    queue: Arc<Mutex<VecDeque<f32>>>,
    failed: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open the configured output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| EngineError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| EngineError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| EngineError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: config.output_sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
        let queue_cb = Arc::clone(&queue);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_cb = Arc::clone(&failed);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut queue = match queue_cb.lock() {
                        Ok(q) => q,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        *sample = queue.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                    failed_cb.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| EngineError::Audio(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| EngineError::Audio(format!("failed to start output stream: {e}")))?;

        Ok(Self {
            _stream: stream,
            queue,
            failed,
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| EngineError::Audio(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn queued_len(&self) -> Result<usize> {
        self.queue
            .lock()
            .map(|q| q.len())
            .map_err(|e| EngineError::Audio(format!("playback queue lock poisoned: {e}")))
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn write(&mut self, samples: &[f32]) -> Result<()> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(EngineError::Audio("output device error".into()));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|e| EngineError::Audio(format!("playback queue lock poisoned: {e}")))?;
        queue.extend(samples.iter().copied());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        loop {
            if self.failed.load(Ordering::Relaxed) {
                return Err(EngineError::Audio("output device error".into()));
            }
            if self.queued_len()? == 0 {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
