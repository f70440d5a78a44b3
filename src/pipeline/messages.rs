//! Message types passed between engine stages.

use crate::turn::TurnToken;
use std::time::{Duration, Instant};

/// A typed event decoded from the turn's response stream.
///
/// Produced only by the frame decoder; immutable once constructed. Every
/// stream ends with exactly one of [`StreamEvent::Done`] or
/// [`StreamEvent::Error`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental fragment of the reply text.
    TextDelta(String),
    /// A chunk of synthesized reply audio (decoded payload bytes).
    AudioChunk(bytes::Bytes),
    /// The reply text is complete (audio may still follow).
    TextComplete,
    /// The stream finished normally, with an optional structured result.
    Done(Option<serde_json::Value>),
    /// The stream failed. Terminal; no further events follow.
    Error {
        /// Best-effort server or transport message.
        message: String,
        /// HTTP status, when the failure was a non-2xx response.
        status: Option<u16>,
    },
}

impl StreamEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error { .. })
    }
}

/// One decoded audio payload queued for playback, in arrival order.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// f32 samples, mono.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// The turn this frame belongs to.
    pub turn: TurnToken,
}

/// A complete spoken utterance closed by the endpointing logic.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Concatenated audio samples for the utterance, including pre-roll.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When speech was first detected.
    pub started_at: Instant,
    /// When the utterance was closed.
    pub ended_at: Instant,
}

impl Utterance {
    /// Wall-clock duration from speech onset to close.
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}

/// Signals emitted by the playback sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// The first frame of a turn is about to reach the output device.
    Started(TurnToken),
    /// The queue drained and stayed empty through the grace window.
    Finished(TurnToken),
}

/// Signals emitted by the utterance capture loop.
#[derive(Debug, Clone)]
pub enum CaptureSignal {
    /// Voice activity opened a new utterance.
    SpeechStarted,
    /// A complete utterance was closed by endpointing.
    UtteranceReady(Utterance),
    /// The input device failed; the loop has stopped.
    Failed(String),
}

/// Hands-free turn-taking state. Exactly one instance, observable via a
/// `watch` channel; transitions happen only inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    /// Hands-free mode is off.
    #[default]
    Idle,
    /// Capturing microphone input, waiting for an utterance.
    Listening,
    /// A turn is in flight; capture is disabled.
    AwaitingReply,
    /// Synthesized reply audio is playing; capture is disabled.
    Speaking,
}

/// Events broadcast to the surrounding application.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Incremental reply text for the current turn.
    TextDelta { turn: TurnToken, content: String },
    /// The current turn's reply text is complete.
    TextComplete { turn: TurnToken },
    /// Reply audio is about to start playing.
    PlaybackStarted { turn: TurnToken },
    /// Reply audio finished playing.
    PlaybackFinished { turn: TurnToken },
    /// The capture loop detected the start of speech.
    CaptureStarted,
    /// The turn-taking state changed.
    StateChanged(CoordinatorState),
    /// Hands-free mode was disabled because capture failed.
    HandsFreeFailed { message: String },
}
