//! HTTP client for the conversation service.
//!
//! One streaming POST per turn. The response body is a chunked stream of
//! newline-delimited JSON frames which [`TurnClient::send_turn`] decodes
//! into an ordered sequence of [`StreamEvent`]s. Failures never surface as
//! `Err`: a connection failure, non-2xx status, or premature close becomes
//! a single terminal [`StreamEvent::Error`] so every consumer handles one
//! uniform event sequence.

pub mod ndjson;

use crate::config::StreamConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::messages::StreamEvent;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

/// Boxed event stream returned by [`TurnClient::send_turn`].
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A single message in the conversation history.
#[derive(Debug, Clone, serde::Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

/// Client for the conversation service's streaming turn endpoint.
///
/// Maintains the conversation history sent as context with each turn.
pub struct TurnClient {
    config: StreamConfig,
    client: reqwest::Client,
    history: Vec<ChatMessage>,
}

impl TurnClient {
    /// Create a new client from stream configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Transport(format!("HTTP client init failed: {e}")))?;

        info!("turn client configured: {}", config.base_url);

        Ok(Self {
            config: config.clone(),
            client,
            history: Vec::new(),
        })
    }

    /// Send one conversation turn and stream back its decoded events.
    ///
    /// The user message is appended to the history before sending. The
    /// returned stream yields events in transport order and terminates with
    /// exactly one of [`StreamEvent::Done`] or [`StreamEvent::Error`];
    /// transport close without a `done` frame yields the implicit
    /// unexpected-end error.
    pub fn send_turn(&mut self, user_input: &str) -> EventStream {
        self.history.push(ChatMessage {
            role: "user",
            content: user_input.to_owned(),
        });
        self.trim_history();

        let base = self.config.base_url.trim_end_matches('/');
        let url = format!("{base}/v1/turn");

        let body = serde_json::json!({
            "messages": self.history,
            "voice": self.config.voice_reply,
        });

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        Box::pin(async_stream::stream! {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield StreamEvent::Error {
                        message: format!("request failed: {e}"),
                        status: None,
                    };
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield StreamEvent::Error {
                    message: ndjson::extract_error_message(&body),
                    status: Some(status.as_u16()),
                };
                return;
            }

            let mut parser = ndjson::NdjsonLineParser::new();
            let mut byte_stream = response.bytes_stream();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield StreamEvent::Error {
                            message: format!("stream read error: {e}"),
                            status: None,
                        };
                        return;
                    }
                };

                for line in parser.push(&chunk) {
                    if let Some(event) = ndjson::decode_frame(&line) {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
            }

            // Transport closed. A trailing unterminated line may still hold
            // the final frame.
            if let Some(line) = parser.flush()
                && let Some(event) = ndjson::decode_frame(&line)
            {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }

            debug!("transport closed without done frame");
            yield StreamEvent::Error {
                message: "unexpected end of stream".to_owned(),
                status: None,
            };
        })
    }

    /// Record the assistant's completed reply in the history.
    ///
    /// Call once per turn after `Done`, with the accumulated reply text.
    /// Whitespace-only replies are not recorded.
    pub fn record_reply(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.history.push(ChatMessage {
            role: "assistant",
            content: text.to_owned(),
        });
        self.trim_history();
    }

    /// Clear the conversation history (conversation reset / switch).
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn trim_history(&mut self) {
        let max = self.config.max_history_messages;
        if max == 0 {
            return;
        }
        if self.history.len() > max {
            let drain_end = self.history.len() - max;
            self.history.drain(..drain_end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_max(max: usize) -> TurnClient {
        let config = StreamConfig {
            max_history_messages: max,
            ..StreamConfig::default()
        };
        TurnClient::new(&config).expect("client")
    }

    #[test]
    fn record_reply_appends_assistant_message() {
        let mut client = client_with_max(0);
        client.record_reply("Hello there");
        assert_eq!(client.history.len(), 1);
        assert_eq!(client.history[0].role, "assistant");
    }

    #[test]
    fn record_reply_skips_whitespace_only() {
        let mut client = client_with_max(0);
        client.record_reply("   \n");
        assert!(client.history.is_empty());
    }

    #[test]
    fn history_trimmed_to_configured_max() {
        let mut client = client_with_max(4);
        for i in 0..10 {
            client.record_reply(&format!("reply {i}"));
        }
        assert_eq!(client.history.len(), 4);
        assert_eq!(client.history[0].content, "reply 6");
        assert_eq!(client.history[3].content, "reply 9");
    }

    #[test]
    fn clear_history_empties_context() {
        let mut client = client_with_max(0);
        client.record_reply("one");
        client.clear_history();
        assert!(client.history.is_empty());
    }
}
