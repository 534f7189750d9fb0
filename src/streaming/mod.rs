//! Server-sent event parsing for chat completions.
//!
//! Turns the raw byte stream of a `stream: true` completion into a push-based
//! sequence of [`StreamEvent`]s: zero or more `Delta`s followed by exactly one
//! `Done`, or an error. Frames are split on blank lines, never on byte-chunk
//! boundaries, so a frame split across any number of chunks decodes the same
//! as one delivered whole.
//!
//! A `data:` payload that is not valid JSON is skipped as keep-alive noise.
//! The stream completes on the literal `[DONE]` terminator or on a frame that
//! carries `usage` without a delta.
//!
//! The non-streaming response shape is handled by [`parse_completion`].

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

use crate::cancellation::CancellationToken;
use crate::error::QuillError;
use crate::types::{ChatResponse, Usage};
use crate::Result;

/// Event produced while consuming a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text, in arrival order
    Delta { text: String },
    /// Terminal event carrying the concatenation of every delta
    Done {
        text: String,
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

/// Boxed stream of parsed events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

const TERMINATOR: &str = "[DONE]";

/// Incremental decoder that buffers bytes and yields complete frame payloads
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    // Bytes already searched for a frame boundary
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the `data:` payloads of every frame it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // CR never appears unescaped inside JSON payloads, so dropping it
        // normalises CRLF framing even when the pair is split across chunks.
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer, self.scanned) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if let Some(payload) = frame_payload(&frame[..end]) {
                payloads.push(payload);
            }
        }
        // A boundary may straddle the next chunk, so the last byte is rescanned
        self.scanned = self.buffer.len().saturating_sub(1);
        payloads
    }

    /// Payload of a trailing frame left without its blank line at end of input
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        frame_payload(&rest)
    }
}

fn find_frame_end(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|offset| from + offset)
}

fn frame_payload(frame: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(frame);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

/// Per-call accumulation of streamed text
#[derive(Debug, Default)]
pub struct StreamState {
    pub text: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub closed: bool,
    pub deltas: usize,
}

impl StreamState {
    /// Apply one frame payload, returning the events it produces
    pub fn apply(&mut self, payload: &str) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }

        if payload.trim() == TERMINATOR {
            return vec![self.close()];
        }

        let json: serde_json::Value = match serde_json::from_str(payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::trace!(error = %e, len = payload.len(), "Skipping malformed stream frame");
                return Vec::new();
            }
        };

        let choice = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first());

        if let Some(reason) = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(|r| r.as_str())
        {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .filter(|text| !text.is_empty());

        let usage = json
            .get("usage")
            .filter(|u| !u.is_null())
            .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

        let mut events = Vec::new();
        match delta {
            Some(text) => {
                self.text.push_str(text);
                self.deltas += 1;
                if usage.is_some() {
                    self.usage = usage;
                }
                events.push(StreamEvent::Delta {
                    text: text.to_string(),
                });
            }
            None if usage.is_some() => {
                self.usage = usage;
                events.push(self.close());
            }
            None => {}
        }
        events
    }

    fn close(&mut self) -> StreamEvent {
        self.closed = true;
        StreamEvent::Done {
            text: self.text.clone(),
            usage: self.usage,
            finish_reason: self.finish_reason.clone(),
        }
    }
}

/// Parse a raw byte stream into completion events.
///
/// A transport error ends the stream with that error. End of input without a
/// terminator completes with the accumulated text if any delta arrived, and is
/// a `MalformedResponse` otherwise.
pub fn parse_event_stream<S, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<QuillError> + Send + 'static,
{
    let events = async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut state = StreamState::default();
        let mut bytes = Box::pin(bytes);
        let mut chunks = 0usize;

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    chunks += 1;
                    for payload in decoder.push(&chunk) {
                        for event in state.apply(&payload) {
                            yield Ok(event);
                        }
                    }
                    if state.closed {
                        break;
                    }
                }
                Err(e) => {
                    let error: QuillError = e.into();
                    tracing::debug!(error = %error, chunks, "Stream transport error");
                    yield Err(error);
                    return;
                }
            }
        }

        if !state.closed {
            if let Some(payload) = decoder.finish() {
                for event in state.apply(&payload) {
                    yield Ok(event);
                }
            }
        }

        if !state.closed {
            if state.deltas > 0 {
                tracing::debug!(chunks, deltas = state.deltas, "Stream ended without terminator");
                yield Ok(state.close());
            } else {
                yield Err(QuillError::malformed_response(
                    "stream ended before any content was received",
                ));
            }
        }
    };

    Box::pin(events)
}

/// Drive an event stream to completion.
///
/// `on_delta` is called for every delta in arrival order. Returns the trimmed
/// final response. The token is checked while waiting for each event; when it
/// fires the stream is dropped, which closes the underlying connection.
///
/// Once any delta has been delivered, a failure other than a caller abort is
/// reported as `StreamInterrupted`, which is not retryable, so text the caller
/// already saw is never sent twice.
pub async fn consume<F>(
    mut events: EventStream,
    token: &CancellationToken,
    mut on_delta: F,
) -> Result<ChatResponse>
where
    F: FnMut(&str),
{
    let mut delivered_chars = 0usize;

    let interrupted = |error: QuillError, delivered_chars: usize| -> QuillError {
        if delivered_chars == 0 || error.is_cancellation() {
            error
        } else {
            QuillError::StreamInterrupted {
                delivered_chars,
                message: error.to_string(),
            }
        }
    };

    loop {
        let next = match token.run_until_cancelled(events.next()).await {
            Ok(next) => next,
            Err(reason) => return Err(interrupted(reason.into_error(), delivered_chars)),
        };

        match next {
            Some(Ok(StreamEvent::Delta { text })) => {
                delivered_chars += text.chars().count();
                on_delta(&text);
            }
            Some(Ok(StreamEvent::Done {
                text,
                usage,
                finish_reason,
            })) => {
                return Ok(ChatResponse {
                    content: text.trim().to_string(),
                    finish_reason,
                    usage,
                    metadata: Default::default(),
                });
            }
            Some(Err(error)) => return Err(interrupted(error, delivered_chars)),
            None => {
                return Err(interrupted(
                    QuillError::malformed_response("stream closed without a completion event"),
                    delivered_chars,
                ))
            }
        }
    }
}

/// Parse a non-streaming completion body
pub fn parse_completion(body: &serde_json::Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| QuillError::malformed_response("missing choices array"))?;

    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| QuillError::malformed_response("missing message content"))?;

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(str::to_string);

    let usage = body
        .get("usage")
        .filter(|u| !u.is_null())
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok());

    let mut metadata = std::collections::HashMap::new();
    if let Some(model) = body.get("model").and_then(|m| m.as_str()) {
        metadata.insert(
            "model".to_string(),
            serde_json::Value::String(model.to_string()),
        );
    }

    Ok(ChatResponse {
        content: content.trim().to_string(),
        finish_reason,
        usage,
        metadata,
    })
}
