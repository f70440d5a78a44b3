//! Engine-level tests: token supersession, audio routing, and the
//! hands-free round trip, with fake devices and a mock HTTP server.

use async_trait::async_trait;
use futures_util::StreamExt;
use parley::audio::{AudioInput, AudioInputSource, AudioOutput};
use parley::config::EngineConfig;
use parley::pipeline::capture::VadFactory;
use parley::stt::Transcriber;
use parley::vad::EnergyVad;
use parley::{
    ConversationEngine, CoordinatorState, EngineDevices, EngineError, EngineEvent, StreamEvent,
    Utterance,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct RecordingOutput {
    writes: Arc<Mutex<Vec<Vec<f32>>>>,
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn write(&mut self, samples: &[f32]) -> parley::Result<()> {
        self.writes.lock().unwrap().push(samples.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> parley::Result<()> {
        Ok(())
    }
}

/// Serves a scripted block sequence on the first open; later opens pend.
struct ScriptedSource {
    blocks: Vec<Vec<f32>>,
    opens: AtomicUsize,
}

struct ScriptedInput {
    blocks: Vec<Vec<f32>>,
}

#[async_trait]
impl AudioInput for ScriptedInput {
    async fn read_block(&mut self) -> parley::Result<Vec<f32>> {
        if self.blocks.is_empty() {
            std::future::pending::<()>().await;
            unreachable!()
        }
        Ok(self.blocks.remove(0))
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }
}

impl AudioInputSource for ScriptedSource {
    fn open(&self) -> parley::Result<Box<dyn AudioInput>> {
        let first = self.opens.fetch_add(1, Ordering::SeqCst) == 0;
        Ok(Box::new(ScriptedInput {
            blocks: if first { self.blocks.clone() } else { Vec::new() },
        }))
    }
}

struct FixedTranscriber(&'static str);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _utterance: &Utterance) -> parley::Result<String> {
        if self.0.is_empty() {
            return Err(EngineError::Transcription("empty audio".into()));
        }
        Ok(self.0.to_owned())
    }
}

/// Output fake whose writes take long enough for frames to pile up in the
/// sequencer queue.
struct SlowOutput {
    writes: Arc<Mutex<Vec<Vec<f32>>>>,
}

#[async_trait]
impl AudioOutput for SlowOutput {
    async fn write(&mut self, samples: &[f32]) -> parley::Result<()> {
        self.writes.lock().unwrap().push(samples.to_vec());
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(())
    }

    async fn flush(&mut self) -> parley::Result<()> {
        Ok(())
    }
}

fn engine_for(
    server: &MockServer,
    input_blocks: Vec<Vec<f32>>,
    transcriber: &'static str,
) -> (ConversationEngine, Arc<Mutex<Vec<Vec<f32>>>>) {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let output = Box::new(RecordingOutput {
        writes: Arc::clone(&writes),
    });
    let engine = engine_with_output(server, output, input_blocks, transcriber);
    (engine, writes)
}

fn engine_with_output(
    server: &MockServer,
    output: Box<dyn AudioOutput>,
    input_blocks: Vec<Vec<f32>>,
    transcriber: &'static str,
) -> ConversationEngine {
    let mut config = EngineConfig::default();
    config.stream.base_url = server.uri();
    config.turn_taking.playback_grace_ms = 30;
    config.turn_taking.settle_delay_ms = 30;
    // Short endpointing so hands-free tests run quickly.
    config.endpointing.silence_timeout_ms = 96;
    config.endpointing.min_speech_duration_ms = 64;
    config.endpointing.pre_roll_ms = 0;

    let vad: VadFactory = {
        let vad_config = config.vad.clone();
        Arc::new(move || Box::new(EnergyVad::new(&vad_config)))
    };
    let devices = EngineDevices {
        output,
        input: Arc::new(ScriptedSource {
            blocks: input_blocks,
            opens: AtomicUsize::new(0),
        }),
        vad,
        transcriber: Arc::new(FixedTranscriber(transcriber)),
    };
    ConversationEngine::new(config, devices).expect("engine")
}

#[tokio::test]
async fn superseded_turn_produces_no_observable_effects() {
    let server = MockServer::start().await;
    // Mounted first: turn B's request history also contains "turn-a", so
    // the B matcher has to win on its own text.
    Mock::given(method("POST"))
        .and(path("/v1/turn"))
        .and(body_string_contains("turn-b"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"type\":\"text_delta\",\"content\":\"from-b\"}\n{\"type\":\"done\"}\n",
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/turn"))
        .and(body_string_contains("turn-a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(
                    "{\"type\":\"text_delta\",\"content\":\"from-a\"}\n{\"type\":\"done\"}\n",
                    "application/x-ndjson",
                )
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let (engine, _writes) = engine_for(&server, Vec::new(), "unused");
    let mut events = engine.subscribe();

    let stream_a = engine.send_turn("turn-a");
    // Let turn A open its stream before B supersedes it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stream_b = engine.send_turn("turn-b");

    let b_events: Vec<StreamEvent> =
        tokio::time::timeout(Duration::from_secs(2), stream_b.collect())
            .await
            .expect("turn B timed out");
    assert!(b_events.contains(&StreamEvent::TextDelta("from-b".into())));
    assert_eq!(b_events.last(), Some(&StreamEvent::Done(None)));

    // Turn A's consumer stream ends without its delayed events.
    let a_events: Vec<StreamEvent> =
        tokio::time::timeout(Duration::from_secs(2), stream_a.collect())
            .await
            .expect("turn A timed out");
    assert!(a_events.is_empty());

    // No broadcast effect carries turn A's text either.
    let mut saw_b = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TextDelta { content, .. } = event {
            assert_ne!(content, "from-a");
            saw_b = saw_b || content == "from-b";
        }
    }
    assert!(saw_b);
    engine.shutdown();
}

#[tokio::test]
async fn reply_audio_is_played_in_arrival_order() {
    let server = MockServer::start().await;
    // Two PCM16 frames: +0.5 then -0.5.
    Mock::given(method("POST"))
        .and(path("/v1/turn"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            concat!(
                "{\"type\":\"audio\",\"data\":\"AEA=\"}\n",
                "{\"type\":\"audio\",\"data\":\"AMA=\"}\n",
                "{\"type\":\"done\"}\n",
            ),
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;

    let (engine, writes) = engine_for(&server, Vec::new(), "unused");
    let mut events = engine.subscribe();

    let turn_events: Vec<StreamEvent> =
        tokio::time::timeout(Duration::from_secs(2), engine.send_turn("play me").collect())
            .await
            .expect("turn timed out");
    assert_eq!(turn_events.last(), Some(&StreamEvent::Done(None)));

    // Wait for the sequencer to signal playback finished.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(EngineEvent::PlaybackFinished { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("playback never finished");

    let written = writes.lock().unwrap();
    assert_eq!(written.len(), 2);
    assert!((written[0][0] - 0.5).abs() < 1e-3);
    assert!((written[1][0] + 0.5).abs() < 1e-3);
    drop(written);
    engine.shutdown();
}

#[tokio::test]
async fn stream_error_drops_queued_reply_audio() {
    let server = MockServer::start().await;
    // Six audio frames, then the transport closes without a done frame.
    Mock::given(method("POST"))
        .and(path("/v1/turn"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"type\":\"audio\",\"data\":\"AEA=\"}\n".repeat(6),
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;

    let writes = Arc::new(Mutex::new(Vec::new()));
    let output = Box::new(SlowOutput {
        writes: Arc::clone(&writes),
    });
    let engine = engine_with_output(&server, output, Vec::new(), "unused");

    let events: Vec<StreamEvent> =
        tokio::time::timeout(Duration::from_secs(2), engine.send_turn("play me").collect())
            .await
            .expect("turn timed out");
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));

    // Long enough for the worker to play every frame if none were dropped.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let written = writes.lock().unwrap();
    assert!(
        written.len() <= 2,
        "queued frames from the failed turn kept playing: {} writes",
        written.len()
    );
    drop(written);
    engine.shutdown();
}

#[tokio::test]
async fn hands_free_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/turn"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "{\"type\":\"text_delta\",\"content\":\"pong\"}\n{\"type\":\"done\"}\n",
            "application/x-ndjson",
        ))
        .mount(&server)
        .await;

    // 20 speech blocks, then enough silence to close the utterance.
    let mut blocks = Vec::new();
    for _ in 0..20 {
        blocks.push(vec![0.5f32; 512]);
    }
    for _ in 0..10 {
        blocks.push(vec![0.0f32; 512]);
    }

    let (engine, _writes) = engine_for(&server, blocks, "ping");
    let mut events = engine.subscribe();
    let mut state = engine.state();

    engine.set_hands_free_enabled(true);

    // The captured utterance becomes a turn whose reply text is broadcast.
    let reply = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(EngineEvent::TextDelta { content, .. }) = events.recv().await {
                return content;
            }
        }
    })
    .await
    .expect("no reply broadcast");
    assert_eq!(reply, "pong");

    // Text-only reply: the machine settles back into Listening.
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if *state.borrow() == CoordinatorState::Listening {
                return;
            }
            state.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("never returned to Listening");

    engine.set_hands_free_enabled(false);
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if *state.borrow() == CoordinatorState::Idle {
                return;
            }
            state.changed().await.expect("state channel closed");
        }
    })
    .await
    .expect("never reached Idle");
    engine.shutdown();
}
