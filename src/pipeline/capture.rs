//! Utterance capture loop.
//!
//! While enabled, pulls fixed-size blocks from the input device, classifies
//! each via [`VoiceActivity`], and segments contiguous speech into discrete
//! utterances. [`Endpointer`] holds the segmentation state: a pre-speech
//! ring so utterance onsets are not clipped, a silence timeout that closes
//! an utterance, and a maximum-duration cap that force-closes one to bound
//! memory and latency. [`CaptureController`] owns enable/disable; both are
//! idempotent, and disabling drops the open device.

use crate::audio::AudioInputSource;
use crate::config::EndpointingConfig;
use crate::pipeline::messages::{CaptureSignal, Utterance};
use crate::vad::VoiceActivity;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Outcome of feeding one block to the endpointer.
#[derive(Debug)]
pub enum EndpointOutcome {
    /// No boundary crossed.
    None,
    /// Voice activity opened a new utterance.
    SpeechStarted,
    /// An utterance was closed and is ready for transcription.
    Utterance(Utterance),
}

/// Speech segmentation state machine.
///
/// Pure with respect to I/O: callers feed classified blocks and act on the
/// returned outcome.
pub struct Endpointer {
    sample_rate: u32,
    /// Ring of recent non-speech blocks prepended to a new utterance.
    pre_roll: VecDeque<Vec<f32>>,
    pre_roll_blocks: usize,
    speech_buffer: Vec<f32>,
    /// Samples from blocks classified as speech in the open segment; the
    /// min/max duration thresholds count these, not pre-roll or tolerated
    /// silence padding.
    speech_samples: usize,
    in_speech: bool,
    silence_blocks: u32,
    silence_threshold_blocks: u32,
    min_speech_samples: usize,
    max_speech_samples: usize,
    speech_start: Option<Instant>,
}

impl Endpointer {
    /// Create an endpointer for the given block geometry.
    pub fn new(config: &EndpointingConfig, sample_rate: u32, block_size: usize) -> Self {
        let block_ms = (block_size as u32 * 1_000) / sample_rate.max(1);
        let block_ms = block_ms.max(1);
        let silence_threshold_blocks = (config.silence_timeout_ms / block_ms).max(1);
        let pre_roll_blocks = (config.pre_roll_ms / block_ms) as usize;
        let min_speech_samples =
            (config.min_speech_duration_ms as usize * sample_rate as usize) / 1_000;
        let max_speech_samples =
            (config.max_speech_duration_ms as usize * sample_rate as usize) / 1_000;

        info!(
            "endpointer: silence_threshold={silence_threshold_blocks} blocks, \
             pre_roll={pre_roll_blocks} blocks, min_speech={}ms, max_speech={}ms",
            config.min_speech_duration_ms, config.max_speech_duration_ms
        );

        Self {
            sample_rate,
            pre_roll: VecDeque::new(),
            pre_roll_blocks,
            speech_buffer: Vec::new(),
            speech_samples: 0,
            in_speech: false,
            silence_blocks: 0,
            silence_threshold_blocks,
            min_speech_samples,
            max_speech_samples,
            speech_start: None,
        }
    }

    /// Feed one classified block.
    pub fn push_block(&mut self, block: &[f32], is_speech: bool) -> EndpointOutcome {
        if is_speech {
            let started = if self.in_speech {
                false
            } else {
                self.in_speech = true;
                self.speech_start = Some(Instant::now());
                self.speech_buffer.clear();
                for pre in self.pre_roll.drain(..) {
                    self.speech_buffer.extend_from_slice(&pre);
                }
                true
            };
            self.silence_blocks = 0;
            self.speech_buffer.extend_from_slice(block);
            self.speech_samples += block.len();

            if self.speech_samples >= self.max_speech_samples {
                debug!("utterance hit max duration, force closing");
                return EndpointOutcome::Utterance(self.close());
            }
            if started {
                return EndpointOutcome::SpeechStarted;
            }
            return EndpointOutcome::None;
        }

        if self.in_speech {
            self.silence_blocks += 1;
            // Silence within tolerance stays part of the utterance.
            self.speech_buffer.extend_from_slice(block);

            if self.silence_blocks >= self.silence_threshold_blocks {
                if self.speech_samples >= self.min_speech_samples {
                    return EndpointOutcome::Utterance(self.close());
                }
                debug!("discarding speech segment below minimum duration");
                self.reset_segment();
            }
            return EndpointOutcome::None;
        }

        // Idle: keep recent audio so the utterance onset is not clipped.
        if self.pre_roll_blocks > 0 {
            if self.pre_roll.len() >= self.pre_roll_blocks {
                self.pre_roll.pop_front();
            }
            self.pre_roll.push_back(block.to_vec());
        }
        EndpointOutcome::None
    }

    /// Clear all segmentation state.
    pub fn reset(&mut self) {
        self.reset_segment();
        self.pre_roll.clear();
    }

    fn close(&mut self) -> Utterance {
        let started_at = self.speech_start.take().unwrap_or_else(Instant::now);
        let utterance = Utterance {
            samples: std::mem::take(&mut self.speech_buffer),
            sample_rate: self.sample_rate,
            started_at,
            ended_at: Instant::now(),
        };
        self.speech_samples = 0;
        self.in_speech = false;
        self.silence_blocks = 0;
        utterance
    }

    fn reset_segment(&mut self) {
        self.speech_buffer.clear();
        self.speech_samples = 0;
        self.in_speech = false;
        self.silence_blocks = 0;
        self.speech_start = None;
    }
}

/// Builds a fresh classifier for each capture session.
pub type VadFactory = Arc<dyn Fn() -> Box<dyn VoiceActivity> + Send + Sync>;

/// Owns the capture loop lifecycle.
///
/// `enable` opens the input device and spawns the loop; `disable` cancels
/// it, which drops the device. Both are idempotent.
pub struct CaptureController {
    source: Arc<dyn AudioInputSource>,
    vad_factory: VadFactory,
    endpointing: EndpointingConfig,
    block_size: usize,
    signal_tx: mpsc::UnboundedSender<CaptureSignal>,
    active: Option<CancellationToken>,
}

impl CaptureController {
    /// Create a controller; the loop starts only on [`Self::enable`].
    pub fn new(
        source: Arc<dyn AudioInputSource>,
        vad_factory: VadFactory,
        endpointing: EndpointingConfig,
        block_size: usize,
        signal_tx: mpsc::UnboundedSender<CaptureSignal>,
    ) -> Self {
        Self {
            source,
            vad_factory,
            endpointing,
            block_size,
            signal_tx,
            active: None,
        }
    }

    /// Whether the capture loop is currently running.
    pub fn is_enabled(&self) -> bool {
        self.active.as_ref().is_some_and(|c| !c.is_cancelled())
    }

    /// Start capturing. No-op if already enabled.
    pub fn enable(&mut self) {
        if self.is_enabled() {
            debug!("capture already enabled");
            return;
        }

        let input = match self.source.open() {
            Ok(input) => input,
            Err(e) => {
                error!("failed to open input device: {e}");
                let _ = self
                    .signal_tx
                    .send(CaptureSignal::Failed(e.to_string()));
                return;
            }
        };

        let cancel = CancellationToken::new();
        let vad = (self.vad_factory)();
        let endpointer = Endpointer::new(&self.endpointing, input.sample_rate(), self.block_size);
        let signal_tx = self.signal_tx.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(run_capture_loop(input, vad, endpointer, signal_tx, loop_cancel));
        self.active = Some(cancel);
        info!("utterance capture enabled");
    }

    /// Stop capturing and release the device. No-op if already disabled.
    pub fn disable(&mut self) {
        match self.active.take() {
            Some(cancel) => {
                cancel.cancel();
                info!("utterance capture disabled");
            }
            None => debug!("capture already disabled"),
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.disable();
    }
}

async fn run_capture_loop(
    mut input: Box<dyn crate::audio::AudioInput>,
    mut vad: Box<dyn VoiceActivity>,
    mut endpointer: Endpointer,
    signal_tx: mpsc::UnboundedSender<CaptureSignal>,
    cancel: CancellationToken,
) {
    loop {
        let block = tokio::select! {
            () = cancel.cancelled() => break,
            block = input.read_block() => block,
        };

        let block = match block {
            Ok(block) => block,
            Err(e) => {
                error!("capture loop stopping: {e}");
                let _ = signal_tx.send(CaptureSignal::Failed(e.to_string()));
                break;
            }
        };

        let is_speech = vad.classify(&block);
        match endpointer.push_block(&block, is_speech) {
            EndpointOutcome::None => {}
            EndpointOutcome::SpeechStarted => {
                let _ = signal_tx.send(CaptureSignal::SpeechStarted);
            }
            EndpointOutcome::Utterance(utterance) => {
                debug!(
                    "utterance closed: {} samples ({:?})",
                    utterance.samples.len(),
                    utterance.duration()
                );
                let _ = signal_tx.send(CaptureSignal::UtteranceReady(utterance));
            }
        }
    }
    // Dropping `input` releases the capture device.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioInput;
    use crate::error::{EngineError, Result};
    use async_trait::async_trait;
    use std::time::Duration;

    const RATE: u32 = 16_000;
    const BLOCK: usize = 512;

    fn endpointer(config: &EndpointingConfig) -> Endpointer {
        Endpointer::new(config, RATE, BLOCK)
    }

    fn test_endpointing() -> EndpointingConfig {
        EndpointingConfig {
            silence_timeout_ms: 96, // 3 blocks of 32ms
            min_speech_duration_ms: 64,
            max_speech_duration_ms: 10_000,
            pre_roll_ms: 64, // 2 blocks
        }
    }

    fn speech_block() -> Vec<f32> {
        vec![0.5; BLOCK]
    }

    fn silence_block() -> Vec<f32> {
        vec![0.0; BLOCK]
    }

    #[test]
    fn speech_then_silence_emits_one_utterance() {
        let mut ep = endpointer(&test_endpointing());

        assert!(matches!(
            ep.push_block(&speech_block(), true),
            EndpointOutcome::SpeechStarted
        ));
        for _ in 0..4 {
            assert!(matches!(ep.push_block(&speech_block(), true), EndpointOutcome::None));
        }

        let mut utterances = 0;
        for _ in 0..10 {
            if let EndpointOutcome::Utterance(u) = ep.push_block(&silence_block(), false) {
                utterances += 1;
                // 5 speech blocks + 3 tolerated silence blocks.
                assert_eq!(u.samples.len(), 8 * BLOCK);
            }
        }
        assert_eq!(utterances, 1);
    }

    #[test]
    fn pre_roll_is_prepended() {
        let mut ep = endpointer(&test_endpointing());

        // Idle audio fills the pre-roll ring (capacity 2 blocks).
        for _ in 0..5 {
            ep.push_block(&silence_block(), false);
        }
        ep.push_block(&speech_block(), true);
        for _ in 0..4 {
            ep.push_block(&speech_block(), true);
        }

        let mut closed = None;
        for _ in 0..5 {
            if let EndpointOutcome::Utterance(u) = ep.push_block(&silence_block(), false) {
                closed = Some(u);
            }
        }
        let utterance = closed.expect("utterance emitted");
        // 2 pre-roll + 5 speech + 3 silence blocks.
        assert_eq!(utterance.samples.len(), 10 * BLOCK);
        // Pre-roll samples lead the buffer.
        assert_eq!(utterance.samples[0], 0.0);
    }

    #[test]
    fn short_blip_is_discarded() {
        let config = EndpointingConfig {
            min_speech_duration_ms: 1_000,
            ..test_endpointing()
        };
        let mut ep = endpointer(&config);

        ep.push_block(&speech_block(), true);
        for _ in 0..10 {
            if let EndpointOutcome::Utterance(_) = ep.push_block(&silence_block(), false) {
                unreachable!("blip below minimum duration must be discarded");
            }
        }
    }

    #[test]
    fn pre_roll_does_not_count_toward_min_duration() {
        let config = EndpointingConfig {
            min_speech_duration_ms: 96, // 3 blocks
            ..test_endpointing()
        };
        let mut ep = endpointer(&config);

        // Fill the pre-roll ring, then a single speech block well under
        // the minimum.
        for _ in 0..5 {
            ep.push_block(&silence_block(), false);
        }
        ep.push_block(&speech_block(), true);

        for _ in 0..10 {
            if let EndpointOutcome::Utterance(_) = ep.push_block(&silence_block(), false) {
                unreachable!("pre-roll and tolerated silence must not satisfy the minimum");
            }
        }
    }

    #[test]
    fn pre_roll_does_not_count_toward_max_duration() {
        let config = EndpointingConfig {
            max_speech_duration_ms: 128, // 4 blocks
            ..test_endpointing()
        };
        let mut ep = endpointer(&config);

        // Two pre-roll blocks retained before speech begins.
        for _ in 0..3 {
            ep.push_block(&silence_block(), false);
        }
        assert!(matches!(
            ep.push_block(&speech_block(), true),
            EndpointOutcome::SpeechStarted
        ));
        assert!(matches!(ep.push_block(&speech_block(), true), EndpointOutcome::None));
        assert!(matches!(ep.push_block(&speech_block(), true), EndpointOutcome::None));
        // The cap counts the four speech blocks; the buffer also carries
        // the two pre-roll blocks.
        match ep.push_block(&speech_block(), true) {
            EndpointOutcome::Utterance(u) => assert_eq!(u.samples.len(), 6 * BLOCK),
            other => unreachable!("expected force close, got {other:?}"),
        }
    }

    #[test]
    fn max_duration_force_closes() {
        let config = EndpointingConfig {
            max_speech_duration_ms: 128, // 4 blocks
            ..test_endpointing()
        };
        let mut ep = endpointer(&config);

        ep.push_block(&speech_block(), true);
        ep.push_block(&speech_block(), true);
        ep.push_block(&speech_block(), true);
        match ep.push_block(&speech_block(), true) {
            EndpointOutcome::Utterance(u) => assert_eq!(u.samples.len(), 4 * BLOCK),
            other => unreachable!("expected force close, got {other:?}"),
        }
    }

    /// Input fake that serves a scripted sequence of blocks, then pends.
    struct ScriptedInput {
        blocks: Vec<Vec<f32>>,
        fail_after: bool,
    }

    #[async_trait]
    impl AudioInput for ScriptedInput {
        async fn read_block(&mut self) -> Result<Vec<f32>> {
            if self.blocks.is_empty() {
                if self.fail_after {
                    return Err(EngineError::Capture("device unplugged".into()));
                }
                // No more scripted audio; park until cancelled.
                std::future::pending::<()>().await;
                unreachable!()
            }
            Ok(self.blocks.remove(0))
        }

        fn sample_rate(&self) -> u32 {
            RATE
        }
    }

    struct ScriptedSource {
        blocks: Vec<Vec<f32>>,
        fail_after: bool,
        fail_open: bool,
    }

    impl AudioInputSource for ScriptedSource {
        fn open(&self) -> Result<Box<dyn AudioInput>> {
            if self.fail_open {
                return Err(EngineError::Capture("no input device".into()));
            }
            Ok(Box::new(ScriptedInput {
                blocks: self.blocks.clone(),
                fail_after: self.fail_after,
            }))
        }
    }

    fn controller(
        source: ScriptedSource,
    ) -> (CaptureController, mpsc::UnboundedReceiver<CaptureSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let vad_config = crate::config::VadConfig::default();
        let vad_factory: VadFactory =
            Arc::new(move || Box::new(crate::vad::EnergyVad::new(&vad_config)));
        let controller = CaptureController::new(
            Arc::new(source),
            vad_factory,
            test_endpointing(),
            BLOCK,
            signal_tx,
        );
        (controller, signal_rx)
    }

    async fn recv_signal(rx: &mut mpsc::UnboundedReceiver<CaptureSignal>) -> CaptureSignal {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("signal timeout")
            .expect("signal channel closed")
    }

    #[tokio::test]
    async fn capture_loop_emits_speech_start_and_utterance() {
        let mut blocks = Vec::new();
        for _ in 0..5 {
            blocks.push(speech_block());
        }
        for _ in 0..4 {
            blocks.push(silence_block());
        }
        let (mut controller, mut signal_rx) = controller(ScriptedSource {
            blocks,
            fail_after: false,
            fail_open: false,
        });

        controller.enable();
        assert!(matches!(
            recv_signal(&mut signal_rx).await,
            CaptureSignal::SpeechStarted
        ));
        match recv_signal(&mut signal_rx).await {
            CaptureSignal::UtteranceReady(u) => assert!(!u.samples.is_empty()),
            other => unreachable!("expected utterance, got {other:?}"),
        }
        controller.disable();
    }

    #[tokio::test]
    async fn enable_and_disable_are_idempotent() {
        let (mut controller, _signal_rx) = controller(ScriptedSource {
            blocks: Vec::new(),
            fail_after: false,
            fail_open: false,
        });

        assert!(!controller.is_enabled());
        controller.enable();
        controller.enable();
        assert!(controller.is_enabled());

        controller.disable();
        controller.disable();
        assert!(!controller.is_enabled());
    }

    #[tokio::test]
    async fn open_failure_reports_capture_failed() {
        let (mut controller, mut signal_rx) = controller(ScriptedSource {
            blocks: Vec::new(),
            fail_after: false,
            fail_open: true,
        });

        controller.enable();
        assert!(!controller.is_enabled());
        match recv_signal(&mut signal_rx).await {
            CaptureSignal::Failed(message) => assert!(message.contains("no input device")),
            other => unreachable!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_failure_mid_session_reports_capture_failed() {
        let (mut controller, mut signal_rx) = controller(ScriptedSource {
            blocks: vec![silence_block()],
            fail_after: true,
            fail_open: false,
        });

        controller.enable();
        loop {
            match recv_signal(&mut signal_rx).await {
                CaptureSignal::Failed(message) => {
                    assert!(message.contains("device unplugged"));
                    break;
                }
                _ => continue,
            }
        }
    }
}
