//! Speech-to-text boundary.
//!
//! Transcription is consumed as an external capability; the coordinator
//! drops utterances whose transcription is empty or fails, since
//! false-positive voice-activity triggers are routine.

use crate::error::Result;
use crate::pipeline::messages::Utterance;
use async_trait::async_trait;

/// Transcribes a complete utterance to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the utterance buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::EngineError::Transcription`] when the audio
    /// is unintelligible or empty.
    async fn transcribe(&self, utterance: &Utterance) -> Result<String>;
}
