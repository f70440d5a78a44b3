//! Ordered audio playback sequencer.
//!
//! A single worker task drains a strictly ordered frame queue to the
//! [`AudioOutput`] device, so frames are never reordered or played
//! concurrently. The worker signals [`PlaybackSignal::Started`] when the
//! first frame of a turn reaches the device and
//! [`PlaybackSignal::Finished`] once the queue drains and stays empty
//! through a grace window. `reset()` drops buffered frames (turn
//! supersession) without touching audio already handed to the device.

use crate::audio::AudioOutput;
use crate::config::TurnTakingConfig;
use crate::pipeline::messages::{AudioFrame, PlaybackSignal};
use crate::turn::TurnToken;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

enum Command {
    Enqueue(AudioFrame),
    Reset,
}

/// Handle to the playback worker.
#[derive(Clone)]
pub struct PlaybackHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PlaybackHandle {
    /// Append a frame to the playback queue.
    pub fn enqueue(&self, frame: AudioFrame) {
        if self.cmd_tx.send(Command::Enqueue(frame)).is_err() {
            debug!("playback worker gone, dropping frame");
        }
    }

    /// Clear buffered, not-yet-played frames.
    ///
    /// Frames already written to the output device play out.
    pub fn reset(&self) {
        let _ = self.cmd_tx.send(Command::Reset);
    }
}

/// Spawn the playback worker task.
pub fn spawn(
    output: Box<dyn AudioOutput>,
    config: &TurnTakingConfig,
    signal_tx: mpsc::UnboundedSender<PlaybackSignal>,
    cancel: CancellationToken,
) -> PlaybackHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let worker = Worker {
        output,
        cmd_rx,
        signal_tx,
        cancel,
        queue: VecDeque::new(),
        max_queued_frames: config.max_queued_frames,
        grace: Duration::from_millis(config.playback_grace_ms),
        playing_turn: None,
    };
    tokio::spawn(worker.run());
    PlaybackHandle { cmd_tx }
}

struct Worker {
    output: Box<dyn AudioOutput>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    signal_tx: mpsc::UnboundedSender<PlaybackSignal>,
    cancel: CancellationToken,
    queue: VecDeque<AudioFrame>,
    max_queued_frames: usize,
    grace: Duration,
    /// Turn whose audio is currently at the device, if any.
    playing_turn: Option<TurnToken>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Ingest pending commands before touching the queue, so a reset
            // issued during a device write clears frames that arrived behind
            // it on the command channel.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => self.handle(cmd),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            if let Some(frame) = self.queue.pop_front() {
                if self.playing_turn != Some(frame.turn) {
                    self.playing_turn = Some(frame.turn);
                    let _ = self.signal_tx.send(PlaybackSignal::Started(frame.turn));
                }
                if let Err(e) = self.output.write(&frame.samples).await {
                    error!("playback write failed: {e}");
                }
                continue;
            }

            // Queue empty. If a turn was playing, wait for the device to
            // drain, then hold the grace window open for late frames before
            // declaring playback finished.
            if let Some(turn) = self.playing_turn {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            Some(cmd) => self.handle(cmd),
                            None => break,
                        }
                        continue;
                    }
                    res = self.output.flush() => {
                        if let Err(e) = res {
                            error!("playback flush failed: {e}");
                        }
                    }
                }

                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            Some(cmd) => self.handle(cmd),
                            None => break,
                        }
                    }
                    () = tokio::time::sleep(self.grace) => {
                        self.playing_turn = None;
                        let _ = self.signal_tx.send(PlaybackSignal::Finished(turn));
                    }
                }
                continue;
            }

            // Nothing queued, nothing playing: wait for work.
            tokio::select! {
                () = self.cancel.cancelled() => break,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => break,
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(frame) => {
                if self.queue.len() >= self.max_queued_frames {
                    // Stale audio is worse than a brief gap.
                    warn!(
                        "playback queue at cap ({}), dropping oldest unplayed frame",
                        self.max_queued_frames
                    );
                    self.queue.pop_front();
                }
                self.queue.push_back(frame);
            }
            Command::Reset => {
                if !self.queue.is_empty() {
                    debug!("resetting playback queue, dropping {} frames", self.queue.len());
                }
                self.queue.clear();
            }
        }
    }
}
