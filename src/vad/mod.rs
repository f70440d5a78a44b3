//! Voice activity classification.
//!
//! The capture loop consumes speech detection through the
//! [`VoiceActivity`] trait so an ML classifier can be plugged in; the
//! default [`EnergyVad`] uses RMS energy thresholding.

use crate::config::VadConfig;

/// Per-block speech/non-speech classifier.
pub trait VoiceActivity: Send {
    /// Classify one block of mono samples as speech or not.
    fn classify(&mut self, block: &[f32]) -> bool;
}

/// Energy-based voice activity classifier.
///
/// Blocks whose RMS energy exceeds the configured threshold are speech.
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    /// Create a classifier from VAD configuration.
    pub fn new(config: &VadConfig) -> Self {
        Self {
            threshold: config.threshold,
        }
    }
}

impl VoiceActivity for EnergyVad {
    fn classify(&mut self, block: &[f32]) -> bool {
        compute_rms_energy(block) > self.threshold
    }
}

/// Compute RMS energy of audio samples.
fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
