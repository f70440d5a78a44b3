//! Incremental decoder for newline-delimited JSON response frames.
//!
//! The conversation service streams its reply as one JSON object per line.
//! [`NdjsonLineParser`] turns arbitrary byte chunks into complete lines,
//! tolerating frames split across read boundaries and skipping blank
//! keep-alive lines. [`decode_frame`] maps one line to a [`StreamEvent`];
//! a malformed frame decodes to `None` with a debug log rather than
//! aborting an otherwise healthy stream.
//!
//! # Wire format
//!
//! ```text
//! {"type":"text_delta","content":"Hi"}
//! {"type":"audio","data":"<base64 pcm>"}
//! {"type":"text_complete"}
//! {"type":"done","result":{"usage":{"tokens":42}}}
//! ```
//!
//! A bare `[DONE]` line is accepted as an alternate terminator.

use crate::pipeline::messages::StreamEvent;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

/// Terminator accepted in place of a `done` frame.
const DONE_SENTINEL: &str = "[DONE]";

/// One frame as it appears on the wire.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    TextDelta {
        content: String,
    },
    Audio {
        /// Base64-encoded decoded-audio payload.
        data: String,
    },
    TextComplete,
    Done {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
}

/// Decode a single frame line into a [`StreamEvent`].
///
/// Returns `None` for frames that should be skipped: blank keep-alives,
/// unparseable JSON, or an audio frame whose payload fails to decode.
pub fn decode_frame(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line == DONE_SENTINEL {
        return Some(StreamEvent::Done(None));
    }

    let frame: WireFrame = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("skipping malformed frame: {e}");
            return None;
        }
    };

    match frame {
        WireFrame::TextDelta { content } => Some(StreamEvent::TextDelta(content)),
        WireFrame::Audio { data } => {
            match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(bytes) => Some(StreamEvent::AudioChunk(bytes::Bytes::from(bytes))),
                Err(e) => {
                    debug!("skipping audio frame with invalid payload: {e}");
                    None
                }
            }
        }
        WireFrame::TextComplete => Some(StreamEvent::TextComplete),
        WireFrame::Done { result } => Some(StreamEvent::Done(result)),
        WireFrame::Error { message } => Some(StreamEvent::Error {
            message,
            status: None,
        }),
    }
}

/// Incrementally split response bytes into complete frame lines.
///
/// Feed chunks via [`NdjsonLineParser::push`] and collect the complete
/// lines; call [`NdjsonLineParser::flush`] when the transport closes to
/// recover a trailing line that arrived without a newline. Buffers raw
/// bytes and decodes only complete lines, so a multi-byte UTF-8 character
/// split across read boundaries is reassembled intact.
#[derive(Debug, Default)]
pub struct NdjsonLineParser {
    line_buffer: Vec<u8>,
}

impl NdjsonLineParser {
    /// Create a new incremental line parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes, returning any complete non-blank lines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                let bytes = std::mem::take(&mut self.line_buffer);
                if let Some(line) = decode_line(&bytes) {
                    lines.push(line);
                }
            } else {
                self.line_buffer.push(byte);
            }
        }

        lines
    }

    /// Flush any buffered partial line when the stream ends.
    pub fn flush(&mut self) -> Option<String> {
        let bytes = std::mem::take(&mut self.line_buffer);
        decode_line(&bytes)
    }
}

/// Decode one complete line, stripping a trailing `\r` and dropping blank
/// keep-alives.
fn decode_line(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.strip_suffix('\r').unwrap_or(&text);
    if line.trim().is_empty() {
        return None;
    }
    Some(line.to_owned())
}

/// Extract a human-readable message from an error response body.
///
/// Prefers `{"error": "..."}` or `{"error": {"message": "..."}}`; falls back
/// to a prefix of the raw body when it is not valid JSON.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
            return message.to_owned();
        }
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_owned();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_owned();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty error body".to_owned();
    }
    trimmed.chars().take(200).collect()
}
