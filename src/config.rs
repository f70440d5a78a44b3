//! Configuration types for the conversation engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the streaming conversation engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Conversation stream (HTTP) settings.
    pub stream: StreamConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Utterance endpointing settings.
    pub endpointing: EndpointingConfig,
    /// Hands-free turn-taking settings.
    pub turn_taking: TurnTakingConfig,
}

/// Conversation stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Base URL of the conversation service.
    pub base_url: String,
    /// Static per-client API key, sent as a bearer header when non-empty.
    pub api_key: String,
    /// Whether to request synthesized speech alongside text.
    pub voice_reply: bool,
    /// Request timeout in seconds (applies to the whole streamed response).
    pub request_timeout_secs: u64,
    /// Maximum conversation history messages sent with each turn
    /// (0 = unlimited).
    pub max_history_messages: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_owned(),
            api_key: String::new(),
            voice_reply: true,
            request_timeout_secs: 120,
            max_history_messages: 40,
        }
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz.
    pub input_sample_rate: u32,
    /// Output sample rate in Hz.
    pub output_sample_rate: u32,
    /// Capture block size in samples (at the input rate).
    pub block_size: usize,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            block_size: 512,
            input_device: None,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration (default energy classifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection.
    ///
    /// Blocks with RMS above this value are classified as speech.
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default, good for most environments)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self { threshold: 0.01 }
    }
}

/// Utterance endpointing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointingConfig {
    /// Silence duration in ms that closes an utterance.
    pub silence_timeout_ms: u32,
    /// Minimum utterance duration in ms to be forwarded.
    pub min_speech_duration_ms: u32,
    /// Maximum utterance duration in ms before a force close.
    pub max_speech_duration_ms: u32,
    /// Pre-speech audio retained in ms so utterance onsets are not clipped.
    pub pre_roll_ms: u32,
}

impl Default for EndpointingConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 1_200,
            min_speech_duration_ms: 300,
            max_speech_duration_ms: 30_000,
            pre_roll_ms: 200,
        }
    }
}

/// Hands-free turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnTakingConfig {
    /// Delay in ms after playback finishes before capture re-enables,
    /// so the microphone does not pick up the speaker tail.
    pub settle_delay_ms: u64,
    /// Grace window in ms after the playback queue drains before the
    /// sequencer reports playback finished.
    pub playback_grace_ms: u64,
    /// Maximum unplayed frames buffered by the sequencer; beyond this the
    /// oldest unplayed frames are dropped.
    pub max_queued_frames: usize,
}

impl Default for TurnTakingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 350,
            playback_grace_ms: 250,
            max_queued_frames: 256,
        }
    }
}

impl EngineConfig {
    /// Default config file path (`<config dir>/parley/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("parley").join("config.toml"))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| crate::error::EngineError::Config(format!("invalid config: {e}")))
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> crate::error::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| crate::error::EngineError::Config(format!("serialize failed: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
