//! Turn-taking coordination and engine wiring.
//!
//! [`ConversationEngine`] is the upward interface: it drives turns against
//! the conversation service, routes reply audio into the playback
//! sequencer, and runs the hands-free turn-taking state machine. The
//! coordinator task is the only place [`CoordinatorState`] changes;
//! capture, playback, and the network loop communicate with it through
//! ordered message channels and never share mutable state.

use crate::audio::{AudioInputSource, AudioOutput, pcm16_to_f32};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::pipeline::capture::{CaptureController, VadFactory};
use crate::pipeline::messages::{
    AudioFrame, CaptureSignal, CoordinatorState, EngineEvent, PlaybackSignal, StreamEvent,
    Utterance,
};
use crate::pipeline::sequencer::{self, PlaybackHandle};
use crate::stream::TurnClient;
use crate::stt::Transcriber;
use crate::turn::{TurnCounter, TurnToken};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capability providers the engine consumes but does not implement.
pub struct EngineDevices {
    /// Speaker boundary for synthesized reply audio.
    pub output: Box<dyn AudioOutput>,
    /// Microphone boundary, opened per hands-free session.
    pub input: Arc<dyn AudioInputSource>,
    /// Voice-activity classifier factory, one per capture session.
    pub vad: VadFactory,
    /// Utterance transcription.
    pub transcriber: Arc<dyn Transcriber>,
}

/// Messages handled by the coordinator task.
enum CoordMsg {
    SetHandsFree(bool),
    TurnStarted(TurnToken),
    StreamDone(TurnToken),
    StreamError(TurnToken, String),
    Transcribed(Option<String>),
}

/// State shared by the engine's tasks.
struct EngineShared {
    turns: Arc<TurnCounter>,
    client: tokio::sync::Mutex<TurnClient>,
    playback: PlaybackHandle,
    coord_tx: mpsc::UnboundedSender<CoordMsg>,
    event_tx: broadcast::Sender<EngineEvent>,
    output_sample_rate: u32,
}

/// Client-side streaming conversation engine.
///
/// Owns the turn token counter, the playback sequencer, the utterance
/// capture loop, and the turn-taking coordinator. One instance per
/// conversation session.
pub struct ConversationEngine {
    shared: Arc<EngineShared>,
    state_rx: watch::Receiver<CoordinatorState>,
    cancel: CancellationToken,
}

impl ConversationEngine {
    /// Build the engine and start its background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: EngineConfig, devices: EngineDevices) -> Result<Self> {
        let cancel = CancellationToken::new();
        let (event_tx, _) = broadcast::channel(256);
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);
        let (coord_tx, coord_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();

        let playback = sequencer::spawn(
            devices.output,
            &config.turn_taking,
            playback_tx,
            cancel.clone(),
        );

        let capture = CaptureController::new(
            devices.input,
            devices.vad,
            config.endpointing.clone(),
            config.audio.block_size,
            capture_tx,
        );

        let client = TurnClient::new(&config.stream)?;

        let turns = Arc::new(TurnCounter::new());
        let shared = Arc::new(EngineShared {
            turns: Arc::clone(&turns),
            client: tokio::sync::Mutex::new(client),
            playback,
            coord_tx: coord_tx.clone(),
            event_tx: event_tx.clone(),
            output_sample_rate: config.audio.output_sample_rate,
        });

        let coordinator = Coordinator {
            state_tx,
            capture,
            coord_tx,
            coord_rx,
            capture_rx,
            playback_rx,
            event_tx,
            transcriber: devices.transcriber,
            turns,
            turn_tx,
            settle_delay: Duration::from_millis(config.turn_taking.settle_delay_ms),
            hands_free: false,
            state: CoordinatorState::Idle,
            active_turn: None,
            stream_done: false,
            settle_deadline: None,
            cancel: cancel.clone(),
        };
        tokio::spawn(coordinator.run());

        tokio::spawn(run_hands_free_driver(
            Arc::clone(&shared),
            turn_rx,
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            state_rx,
            cancel,
        })
    }

    /// Send one conversation turn, superseding any in-flight turn.
    ///
    /// Returns the turn's event stream. Events from a turn that has since
    /// been superseded stop flowing; audio events are routed to the
    /// playback sequencer internally.
    pub fn send_turn(&self, input: &str) -> impl futures_util::Stream<Item = StreamEvent> + Send {
        let (consumer_tx, consumer_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_turn(
            Arc::clone(&self.shared),
            input.to_owned(),
            Some(consumer_tx),
        ));
        UnboundedReceiverStream::new(consumer_rx)
    }

    /// Enable or disable hands-free mode.
    pub fn set_hands_free_enabled(&self, enabled: bool) {
        let _ = self
            .shared
            .coord_tx
            .send(CoordMsg::SetHandsFree(enabled));
    }

    /// Observable turn-taking state.
    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    /// Subscribe to engine events (text deltas, playback signals, state).
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Clear the conversation: supersede any in-flight turn and drop the
    /// history context.
    pub async fn clear_conversation(&self) {
        self.shared.turns.begin_turn();
        self.shared.playback.reset();
        self.shared.client.lock().await.clear_history();
    }

    /// Stop all background tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drive one turn to completion: open the stream, filter by token, apply
/// effects, and report the terminal event to the coordinator.
async fn drive_turn(
    shared: Arc<EngineShared>,
    input: String,
    mut consumer: Option<mpsc::UnboundedSender<StreamEvent>>,
) {
    let token = shared.turns.begin_turn();
    // Stricter supersession rule: queued-but-unplayed audio from the
    // previous turn is dropped.
    shared.playback.reset();
    let _ = shared.coord_tx.send(CoordMsg::TurnStarted(token));

    let mut stream = shared.client.lock().await.send_turn(&input);
    let mut reply_text = String::new();

    while let Some(event) = stream.next().await {
        if !shared.turns.is_current(token) {
            // Superseded: drain the transport but apply no effects.
            consumer.take();
            continue;
        }

        match &event {
            StreamEvent::TextDelta(delta) => {
                reply_text.push_str(delta);
                let _ = shared.event_tx.send(EngineEvent::TextDelta {
                    turn: token,
                    content: delta.clone(),
                });
            }
            StreamEvent::AudioChunk(bytes) => {
                shared.playback.enqueue(AudioFrame {
                    samples: pcm16_to_f32(bytes),
                    sample_rate: shared.output_sample_rate,
                    turn: token,
                });
            }
            StreamEvent::TextComplete => {
                let _ = shared
                    .event_tx
                    .send(EngineEvent::TextComplete { turn: token });
            }
            StreamEvent::Done(_) => {
                shared.client.lock().await.record_reply(&reply_text);
                let _ = shared.coord_tx.send(CoordMsg::StreamDone(token));
            }
            StreamEvent::Error { message, status } => {
                warn!("turn stream failed (status {status:?}): {message}");
                // Queued-but-unplayed audio from the failed turn is stale.
                shared.playback.reset();
                let _ = shared
                    .coord_tx
                    .send(CoordMsg::StreamError(token, message.clone()));
            }
        }

        if let Some(ref tx) = consumer
            && tx.send(event).is_err()
        {
            // Consumer went away; keep applying engine-side effects.
            consumer = None;
        }
    }
}

/// Hands-free driver: turns transcribed utterances into new turns, one at
/// a time.
async fn run_hands_free_driver(
    shared: Arc<EngineShared>,
    mut turn_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            () = cancel.cancelled() => break,
            text = turn_rx.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        drive_turn(Arc::clone(&shared), text, None).await;
    }
}

/// The turn-taking state machine. Runs as a single task; the only writer
/// of [`CoordinatorState`].
struct Coordinator {
    state_tx: watch::Sender<CoordinatorState>,
    capture: CaptureController,
    coord_tx: mpsc::UnboundedSender<CoordMsg>,
    coord_rx: mpsc::UnboundedReceiver<CoordMsg>,
    capture_rx: mpsc::UnboundedReceiver<CaptureSignal>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackSignal>,
    event_tx: broadcast::Sender<EngineEvent>,
    transcriber: Arc<dyn Transcriber>,
    turns: Arc<TurnCounter>,
    /// Transcribed utterance text flows out here to become new turns.
    turn_tx: mpsc::UnboundedSender<String>,
    settle_delay: Duration,
    hands_free: bool,
    state: CoordinatorState,
    /// Most recent turn the coordinator has seen start.
    active_turn: Option<TurnToken>,
    /// Whether the active turn's stream reported `Done`.
    stream_done: bool,
    /// When set, capture re-enables at this instant (settle after playback).
    settle_deadline: Option<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            let settle = self.settle_deadline;
            tokio::select! {
                () = self.cancel.cancelled() => break,
                msg = self.coord_rx.recv() => match msg {
                    Some(msg) => self.on_msg(msg),
                    None => break,
                },
                sig = self.capture_rx.recv() => match sig {
                    Some(sig) => self.on_capture(sig),
                    None => break,
                },
                sig = self.playback_rx.recv() => match sig {
                    Some(sig) => self.on_playback(sig),
                    None => break,
                },
                () = async {
                    match settle {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => self.on_settle(),
            }
        }
        self.capture.disable();
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state == state {
            return;
        }
        info!("turn-taking: {:?} -> {:?}", self.state, state);
        self.state = state;
        let _ = self.state_tx.send(state);
        let _ = self.event_tx.send(EngineEvent::StateChanged(state));
    }

    fn begin_listening(&mut self) {
        self.settle_deadline = None;
        self.set_state(CoordinatorState::Listening);
        self.capture.enable();
    }

    fn on_msg(&mut self, msg: CoordMsg) {
        match msg {
            CoordMsg::SetHandsFree(enabled) => {
                if enabled == self.hands_free {
                    return;
                }
                self.hands_free = enabled;
                if enabled {
                    if self.active_turn.is_some() && !self.stream_done {
                        self.set_state(CoordinatorState::AwaitingReply);
                    } else {
                        self.begin_listening();
                    }
                } else {
                    // In-flight turns finish under non-hands-free rules.
                    self.settle_deadline = None;
                    self.capture.disable();
                    self.set_state(CoordinatorState::Idle);
                }
            }
            CoordMsg::TurnStarted(token) => {
                self.active_turn = Some(token);
                self.stream_done = false;
                self.settle_deadline = None;
                if self.hands_free {
                    self.capture.disable();
                    self.set_state(CoordinatorState::AwaitingReply);
                }
            }
            CoordMsg::StreamDone(token) => {
                if self.active_turn != Some(token) {
                    return;
                }
                self.stream_done = true;
                // Text-only reply: no playback will start, so re-listen
                // from here; if audio is playing, playback-finished drives
                // the transition instead.
                if self.hands_free && self.state == CoordinatorState::AwaitingReply {
                    self.schedule_settle();
                }
            }
            CoordMsg::StreamError(token, message) => {
                if self.active_turn != Some(token) {
                    return;
                }
                error!("turn {token:?} failed: {message}");
                self.stream_done = true;
                if self.state != CoordinatorState::Idle {
                    self.capture.disable();
                    if self.hands_free {
                        self.begin_listening();
                    } else {
                        self.set_state(CoordinatorState::Idle);
                    }
                }
            }
            CoordMsg::Transcribed(text) => {
                match text {
                    Some(text) => {
                        let _ = self.turn_tx.send(text);
                    }
                    None => {
                        // Expected, frequent: false-positive VAD trigger.
                        debug!("utterance discarded after transcription");
                        if self.hands_free && self.state == CoordinatorState::AwaitingReply {
                            self.begin_listening();
                        }
                    }
                }
            }
        }
    }

    fn on_capture(&mut self, sig: CaptureSignal) {
        match sig {
            CaptureSignal::SpeechStarted => {
                let _ = self.event_tx.send(EngineEvent::CaptureStarted);
            }
            CaptureSignal::UtteranceReady(utterance) => {
                if self.state != CoordinatorState::Listening {
                    debug!("dropping utterance closed outside Listening");
                    return;
                }
                // Stop picking up trailing noise while the reply streams.
                self.capture.disable();
                self.set_state(CoordinatorState::AwaitingReply);
                self.spawn_transcription(utterance);
            }
            CaptureSignal::Failed(message) => {
                error!("capture failed, disabling hands-free: {message}");
                self.capture.disable();
                self.hands_free = false;
                self.settle_deadline = None;
                self.set_state(CoordinatorState::Idle);
                let _ = self
                    .event_tx
                    .send(EngineEvent::HandsFreeFailed { message });
            }
        }
    }

    fn on_playback(&mut self, sig: PlaybackSignal) {
        match sig {
            PlaybackSignal::Started(token) => {
                if !self.turns.is_current(token) {
                    return;
                }
                let _ = self.event_tx.send(EngineEvent::PlaybackStarted { turn: token });
                if self.hands_free {
                    self.settle_deadline = None;
                    // A start arriving after an error already resumed
                    // listening must not leave the microphone open while
                    // audio plays.
                    self.capture.disable();
                    self.set_state(CoordinatorState::Speaking);
                }
            }
            PlaybackSignal::Finished(token) => {
                let _ = self.event_tx.send(EngineEvent::PlaybackFinished { turn: token });
                if !self.hands_free || self.state != CoordinatorState::Speaking {
                    return;
                }
                if self.stream_done {
                    self.schedule_settle();
                } else {
                    // Stream still open; more frames may follow.
                    self.set_state(CoordinatorState::AwaitingReply);
                }
            }
        }
    }

    /// Re-enable listening after the settle delay, so the microphone does
    /// not capture the output device tail.
    fn schedule_settle(&mut self) {
        self.set_state(CoordinatorState::AwaitingReply);
        self.settle_deadline = Some(tokio::time::Instant::now() + self.settle_delay);
    }

    fn on_settle(&mut self) {
        self.settle_deadline = None;
        if self.hands_free {
            self.begin_listening();
        }
    }

    fn spawn_transcription(&self, utterance: Utterance) {
        let transcriber = Arc::clone(&self.transcriber);
        let coord_tx = self.coord_tx.clone();
        tokio::spawn(async move {
            let result = transcriber.transcribe(&utterance).await;
            let text = match result {
                Ok(text) => {
                    let text = text.trim().to_owned();
                    if text.is_empty() { None } else { Some(text) }
                }
                Err(e) => {
                    debug!("transcription failed, dropping utterance: {e}");
                    None
                }
            };
            let _ = coord_tx.send(CoordMsg::Transcribed(text));
        });
    }
}
