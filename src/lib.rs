//! Parley: client-side streaming conversation engine.
//!
//! Sends a user's message to a conversational AI service, decodes the
//! live streamed reply (text and synthesized speech), and optionally runs
//! fully hands-free: the device listens continuously, segments speech into
//! utterances, transcribes them, and feeds them back as new turns — while
//! never capturing its own voice output.
//!
//! # Architecture
//!
//! Independent loops connected by ordered async channels:
//! - **Turn client**: one streaming HTTP call per turn, decoded into typed
//!   [`StreamEvent`]s by an incremental NDJSON parser
//! - **Turn tokens**: a monotonic counter makes supersession a filtering
//!   discipline instead of a cancellation race
//! - **Playback sequencer**: a single worker drains an ordered frame queue
//!   to the speaker, signalling playback start/finish
//! - **Utterance capture**: voice-activity classification plus silence
//!   endpointing over microphone blocks
//! - **Turn-taking coordinator**: the one place the hands-free state
//!   machine mutates, gating capture so microphone and speaker are never
//!   both active

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod stream;
pub mod stt;
pub mod turn;
pub mod vad;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use pipeline::coordinator::{ConversationEngine, EngineDevices};
pub use pipeline::messages::{CoordinatorState, EngineEvent, StreamEvent, Utterance};
pub use stream::TurnClient;
pub use turn::{TurnCounter, TurnToken};
