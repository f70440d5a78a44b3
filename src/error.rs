//! Error types for the conversation engine.

/// Top-level error type for the streaming conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transport-level failure: connection refused, timeout, non-2xx status.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol-level failure: malformed frame, premature stream close.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Microphone capture error (device unavailable, permission revoked).
    #[error("capture error: {0}")]
    Capture(String),

    /// Transcription produced no usable text.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error between engine stages.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
