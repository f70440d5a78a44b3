//! Audio device boundary and sample conversion helpers.
//!
//! The engine consumes microphone and speaker access through the
//! [`AudioInput`] and [`AudioOutput`] capability traits so the capture loop
//! and playback sequencer can be driven by fakes in tests. The cpal-backed
//! implementations live in [`capture`] and [`playback`].

pub mod capture;
pub mod playback;

use crate::error::Result;
use async_trait::async_trait;

/// Blocking-read microphone boundary.
///
/// Implementations own the open device; dropping the value releases it.
#[async_trait]
pub trait AudioInput: Send {
    /// Read the next fixed-size block of mono samples.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails or becomes unavailable.
    async fn read_block(&mut self) -> Result<Vec<f32>>;

    /// Sample rate of the blocks returned by [`Self::read_block`].
    fn sample_rate(&self) -> u32;
}

/// Opens an [`AudioInput`] on demand.
///
/// The capture loop opens the device on enable and drops it on disable so
/// capture hardware is never held while hands-free listening is off.
pub trait AudioInputSource: Send + Sync {
    /// Open the input device.
    ///
    /// # Errors
    ///
    /// Returns an error if no device is available.
    fn open(&self) -> Result<Box<dyn AudioInput>>;
}

/// Blocking-write speaker boundary.
#[async_trait]
pub trait AudioOutput: Send {
    /// Write decoded samples to the device, returning when accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails.
    async fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Wait until everything written so far has been rendered.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails while draining.
    async fn flush(&mut self) -> Result<()>;
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation downsampler.
///
/// Converts audio from `src_rate` to `dst_rate`. For speech capture
/// (48kHz → 16kHz) this is sufficient quality — human speech energy is
/// below 8kHz, so no anti-alias filter is needed.
pub fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

/// Decode little-endian signed 16-bit PCM bytes to f32 samples in [-1, 1].
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}
