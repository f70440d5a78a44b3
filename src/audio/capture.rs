//! Microphone input via cpal.
//!
//! Captures at the device's native sample rate, folds to mono, and
//! downsamples to the configured input rate (default 16kHz), re-chunked
//! into fixed-size blocks for the voice-activity classifier.

use crate::audio::{AudioInput, AudioInputSource, downsample, to_mono};
use crate::config::AudioConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Opens the system microphone as an [`AudioInput`].
pub struct CpalInputSource {
    config: AudioConfig,
}

impl CpalInputSource {
    /// Create a source for the configured input device.
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| EngineError::Capture(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl AudioInputSource for CpalInputSource {
    fn open(&self) -> Result<Box<dyn AudioInput>> {
        CpalInput::open(&self.config).map(|input| Box::new(input) as Box<dyn AudioInput>)
    }
}

/// An open microphone stream yielding fixed-size mono blocks.
///
/// Dropping the value stops the stream and releases the device.
pub struct CpalInput {
    _stream: cpal::Stream,
    reader: BlockReceiver,
    target_sample_rate: u32,
}

/// Receiving half of the capture channel.
///
/// The cpal error callback pushes a terminal `Err` through the same
/// channel, so a reader parked on an empty channel wakes up immediately;
/// the flag covers the case where the channel was full when the error
/// fired (the marker is lost but the next read short-circuits).
struct BlockReceiver {
    rx: mpsc::Receiver<Result<Vec<f32>>>,
    failed: Arc<AtomicBool>,
}

impl BlockReceiver {
    async fn next_block(&mut self) -> Result<Vec<f32>> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(EngineError::Capture("input device error".into()));
        }
        match self.rx.recv().await {
            Some(block) => block,
            None => Err(EngineError::Capture("input stream closed".into())),
        }
    }
}

impl CpalInput {
    fn open(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(|e| EngineError::Capture(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| EngineError::Capture(format!("input device '{name}' not found")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| EngineError::Capture("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        // Use the device's default config for best compatibility, then
        // downsample in software.
        let default_config = device
            .default_input_config()
            .map_err(|e| EngineError::Capture(format!("no default input config: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let target_rate = config.input_sample_rate;
        let block_size = config.block_size;
        if native_rate != target_rate {
            info!("will downsample from {native_rate}Hz to {target_rate}Hz");
        }

        let (tx, rx) = mpsc::channel::<Result<Vec<f32>>>(64);
        let tx_err = tx.clone();
        let failed = Arc::new(AtomicBool::new(false));
        let failed_cb = Arc::clone(&failed);

        let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };

                    pending.extend_from_slice(&samples);
                    while pending.len() >= block_size {
                        let block: Vec<f32> = pending.drain(..block_size).collect();
                        // Use try_send to avoid blocking the audio thread
                        if tx.try_send(Ok(block)).is_err() {
                            debug!("capture channel full, dropping block");
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                    failed_cb.store(true, Ordering::Relaxed);
                    // Wake a reader parked on an empty channel.
                    let _ = tx_err.try_send(Err(EngineError::Capture(format!(
                        "input stream error: {err}"
                    ))));
                },
                None,
            )
            .map_err(|e| EngineError::Capture(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| EngineError::Capture(format!("failed to start input stream: {e}")))?;

        info!("audio capture started: native {native_rate}Hz -> target {target_rate}Hz");

        Ok(Self {
            _stream: stream,
            reader: BlockReceiver { rx, failed },
            target_sample_rate: target_rate,
        })
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    async fn read_block(&mut self) -> Result<Vec<f32>> {
        self.reader.next_block().await
    }

    fn sample_rate(&self) -> u32 {
        self.target_sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn error_marker_wakes_parked_reader() {
        let (tx, rx) = mpsc::channel::<Result<Vec<f32>>>(4);
        let failed = Arc::new(AtomicBool::new(false));
        let mut reader = BlockReceiver {
            rx,
            failed: Arc::clone(&failed),
        };

        let read = tokio::spawn(async move { reader.next_block().await });
        // Let the reader park on the empty channel, as it does while the
        // device produces no data.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // What the cpal error callback does; the sender stays alive because
        // the stream closure still owns its clone.
        failed.store(true, Ordering::Relaxed);
        tx.try_send(Err(EngineError::Capture("input stream error: device lost".into())))
            .expect("channel full");

        let result = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .expect("reader stayed parked after the device error")
            .expect("reader task panicked");
        assert!(result.is_err());
        drop(tx);
    }

    #[tokio::test]
    async fn failed_flag_short_circuits_buffered_backlog() {
        let (tx, rx) = mpsc::channel::<Result<Vec<f32>>>(4);
        tx.try_send(Ok(vec![0.0; 8])).expect("channel full");
        let mut reader = BlockReceiver {
            rx,
            failed: Arc::new(AtomicBool::new(true)),
        };

        // Blocks queued before the error are not worth draining.
        assert!(reader.next_block().await.is_err());
        drop(tx);
    }
}
