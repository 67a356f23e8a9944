//! Streaming translation from Cloud Code SSE to Messages API events
//!
//! `StreamTranslator` is a pure state machine: it takes decoded Gemini
//! payloads and returns the outbound events they imply. `spawn_translator`
//! drives it from the upstream byte stream on a detached task and pushes
//! events into a bounded channel that the HTTP body drains.
//!
//! Every stream produced here starts with exactly one `message_start` and
//! ends with exactly one terminal event: `message_stop` or `error`. An error
//! terminal caused by the upstream is also reported on a oneshot so the
//! dispatcher can cool down or invalidate the account that served it.

use std::time::Duration;

use futures_util::StreamExt;
use provider::{ByteStream, ClassifiedError, ErrorKind, UpstreamError, classify};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::translate::{Usage, message_id, stop_reason, tool_use_id};

/// Events buffered between the upstream reader and the client writer.
pub const STREAM_BUFFER: usize = 16;

/// How long a terminal event may wait for channel space on shutdown.
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// One outbound stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: Value,
        usage: Usage,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::MessageStop | StreamEvent::Error { .. })
    }

    /// `event: <type>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type(), data)
    }

    pub fn error(error: &ClassifiedError) -> Self {
        StreamEvent::Error {
            error: ErrorBody {
                kind: error.kind,
                message: error.message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// Incremental Gemini -> Messages API translator.
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    message_id: String,
    next_index: usize,
    open: Option<(usize, BlockKind)>,
    saw_tool_use: bool,
    finish_reason: Option<String>,
    usage: Usage,
    started: bool,
    finished: bool,
    /// Upstream failure behind the error terminal, if any
    failure: Option<ClassifiedError>,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: message_id(),
            next_index: 0,
            open: None,
            saw_tool_use: false,
            finish_reason: None,
            usage: Usage::default(),
            started: false,
            finished: false,
            failure: None,
        }
    }

    /// The `message_start` event. Emitted once.
    pub fn start(&mut self) -> Option<StreamEvent> {
        if self.started {
            return None;
        }
        self.started = true;
        Some(StreamEvent::MessageStart {
            message: json!({
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": 0, "output_tokens": 0 },
            }),
        })
    }

    /// A terminal event has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The upstream reported a finish reason.
    pub fn saw_finish(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Events implied by one decoded upstream payload.
    pub fn push(&mut self, payload: &Value) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events: Vec<StreamEvent> = self.start().into_iter().collect();

        if let Some(error) = payload.get("error") {
            let status = error
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok());
            let upstream = UpstreamError {
                status,
                body: Some(payload.to_string()),
                message: "upstream reported an error mid-stream".into(),
            };
            events.push(self.fail_upstream(classify(&upstream)));
            return events;
        }

        if let Some(metadata) = payload.get("usageMetadata") {
            self.usage = Usage::from_metadata(metadata);
        }

        let candidate = payload.get("candidates").and_then(|c| c.get(0));
        let parts = candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(Value::as_array);

        for part in parts.into_iter().flatten() {
            self.translate_part(part, &mut events);
        }

        if let Some(reason) = candidate
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
        {
            self.finish_reason = Some(reason.to_string());
        }
        events
    }

    fn translate_part(&mut self, part: &Value, events: &mut Vec<StreamEvent>) {
        if let Some(call) = part.get("functionCall") {
            self.close_block(events);
            self.saw_tool_use = true;
            let index = self.next_index;
            self.next_index += 1;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(tool_use_id);
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            events.push(StreamEvent::ContentBlockStart {
                index,
                content_block: json!({
                    "type": "tool_use",
                    "id": id,
                    "name": call.get("name").and_then(Value::as_str).unwrap_or_default(),
                    "input": {},
                }),
            });
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: args.to_string(),
                },
            });
            events.push(StreamEvent::ContentBlockStop { index });
            return;
        }

        let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
        let signature = part
            .get("thoughtSignature")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            let index = self.ensure_block(BlockKind::Thinking, events);
            if !text.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::ThinkingDelta {
                        thinking: text.to_string(),
                    },
                });
            }
            if let Some(signature) = signature {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::SignatureDelta {
                        signature: signature.to_string(),
                    },
                });
            }
            return;
        }

        // A bare signature closes out the thinking block it belongs to
        if text.is_empty() {
            if let (Some(signature), Some((index, BlockKind::Thinking))) = (signature, self.open) {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::SignatureDelta {
                        signature: signature.to_string(),
                    },
                });
            }
            return;
        }

        let index = self.ensure_block(BlockKind::Text, events);
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> usize {
        if let Some((index, open_kind)) = self.open
            && open_kind == kind
        {
            return index;
        }
        self.close_block(events);
        let index = self.next_index;
        self.next_index += 1;
        let content_block = match kind {
            BlockKind::Text => json!({ "type": "text", "text": "" }),
            BlockKind::Thinking => json!({ "type": "thinking", "thinking": "" }),
        };
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        self.open = Some((index, kind));
        index
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some((index, _)) = self.open.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// Normal completion: close the open block, report the stop reason and
    /// usage, then `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events: Vec<StreamEvent> = self.start().into_iter().collect();
        self.close_block(&mut events);
        events.push(StreamEvent::MessageDelta {
            delta: json!({
                "stop_reason": stop_reason(self.finish_reason.as_deref(), self.saw_tool_use),
                "stop_sequence": null,
            }),
            usage: self.usage,
        });
        events.push(StreamEvent::MessageStop);
        self.finished = true;
        events
    }

    /// Error termination. Open blocks are left as they are; the error event
    /// is the last thing the client sees.
    pub fn fail(&mut self, error: &ClassifiedError) -> StreamEvent {
        self.finished = true;
        StreamEvent::error(error)
    }

    /// `fail` for an error the upstream caused. The error is kept for
    /// `take_failure`.
    pub fn fail_upstream(&mut self, error: ClassifiedError) -> StreamEvent {
        let event = self.fail(&error);
        self.failure = Some(error);
        event
    }

    pub fn take_failure(&mut self) -> Option<ClassifiedError> {
        self.failure.take()
    }
}

/// Splits raw SSE bytes into decoded `data:` payloads.
///
/// Lines may be split across chunks at any byte, including inside a UTF-8
/// sequence, so bytes are buffered until a newline arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads completed by `chunk`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = decode_line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Payload left in an unterminated final line, if any.
    pub fn finish(&mut self) -> Option<Value> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Option<Value> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => Some(cloudcode::unwrap_response(value)),
        Err(e) => {
            warn!(error = %e, "skipping undecodable upstream SSE line");
            None
        }
    }
}

/// Read `upstream` on a detached task and emit translated events.
///
/// The channel is bounded, so the reader never runs ahead of the client.
/// Dropping the receiver (client gone) stops the reader and drops the
/// upstream stream. Flipping `shutdown` to true ends the stream with an
/// error event.
///
/// The oneshot resolves with the classified error when the stream ends on
/// an upstream failure. It is dropped without a value otherwise.
pub fn spawn_translator(
    mut upstream: ByteStream,
    model: String,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<StreamEvent>, oneshot::Receiver<ClassifiedError>) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let (failure_tx, failure_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut translator = StreamTranslator::new(model);
        let mut decoder = SseDecoder::new();

        if let Some(start) = translator.start()
            && tx.send(start).await.is_err()
        {
            return;
        }

        if *shutdown.borrow_and_update() {
            let _ = tx.send(translator.fail(&shutting_down())).await;
            return;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => {
                    debug!("client disconnected, cancelling upstream read");
                    return;
                }
                Ok(()) = shutdown.changed() => {
                    if *shutdown.borrow_and_update() {
                        let event = translator.fail(&shutting_down());
                        let _ = tokio::time::timeout(TERMINAL_SEND_TIMEOUT, tx.send(event)).await;
                        return;
                    }
                    continue;
                }
                chunk = upstream.next() => chunk,
            };

            let events = match next {
                Some(Ok(bytes)) => decoder
                    .push(&bytes)
                    .iter()
                    .flat_map(|payload| translator.push(payload))
                    .collect::<Vec<_>>(),
                Some(Err(e)) => {
                    warn!(error = %e, "upstream stream failed");
                    vec![translator.fail_upstream(classify(&e))]
                }
                None => {
                    let mut events: Vec<StreamEvent> = decoder
                        .finish()
                        .map(|payload| translator.push(&payload))
                        .unwrap_or_default();
                    if !translator.is_finished() {
                        if translator.saw_finish() {
                            events.extend(translator.finish());
                        } else {
                            warn!("upstream stream ended without a finish reason");
                            events.push(translator.fail_upstream(ClassifiedError::new(
                                ErrorKind::Upstream,
                                "upstream stream ended unexpectedly",
                            )));
                        }
                    }
                    events
                }
            };

            // Reported even if the client hangs up on the error terminal
            if let Some(failure) = translator.take_failure() {
                let _ = failure_tx.send(failure);
                for event in events {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                return;
            }
            for event in events {
                if tx.send(event).await.is_err() {
                    debug!("client disconnected, cancelling upstream read");
                    return;
                }
            }
            if translator.is_finished() {
                return;
            }
        }
    });

    (rx, failure_rx)
}

fn shutting_down() -> ClassifiedError {
    ClassifiedError::new(ErrorKind::Upstream, "server is shutting down").with_status(503)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    fn chunk(parts: Value, finish: Option<&str>) -> Value {
        let mut candidate = json!({ "content": { "role": "model", "parts": parts } });
        if let Some(reason) = finish {
            candidate["finishReason"] = json!(reason);
        }
        json!({ "candidates": [candidate] })
    }

    fn sse(payload: &Value) -> Bytes {
        Bytes::from(format!("data: {}\r\n\r\n", json!({ "response": payload })))
    }

    fn byte_stream(items: Vec<Result<Bytes, UpstreamError>>) -> ByteStream {
        Box::pin(stream::iter(items))
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn types(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_type).collect()
    }

    fn assert_well_formed(events: &[StreamEvent]) {
        assert_eq!(events.first().map(StreamEvent::event_type), Some("message_start"));
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "exactly one terminal event: {:?}", types(events));
        assert!(events.last().unwrap().is_terminal());
    }

    #[test]
    fn sse_encoding_matches_wire_format() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta { text: "Hi".into() },
        };
        assert_eq!(
            event.to_sse(),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n"
        );
        assert_eq!(
            StreamEvent::MessageStop.to_sse(),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }

    #[test]
    fn error_event_uses_wire_kind() {
        let event = StreamEvent::error(&ClassifiedError::new(ErrorKind::RateLimit, "quota"));
        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({"type": "error", "error": {"type": "rate_limit_error", "message": "quota"}}));
    }

    #[test]
    fn decoder_handles_split_lines_and_envelopes() {
        let mut decoder = SseDecoder::new();
        let line = "data: {\"response\":{\"candidates\":[]}}\n";
        let (a, b) = line.as_bytes().split_at(10);
        assert!(decoder.push(a).is_empty());
        let payloads = decoder.push(b);
        assert_eq!(payloads, vec![json!({"candidates": []})]);

        assert!(decoder.push(b": keep-alive comment\n\n").is_empty());
        assert!(decoder.push(b"data: not-json\n").is_empty());

        decoder.push(b"data: {\"x\":1}");
        assert_eq!(decoder.finish(), Some(json!({"x": 1})));
    }

    #[test]
    fn decoder_keeps_multibyte_characters_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let line = "data: {\"text\":\"h\u{e9}\"}\n".as_bytes().to_vec();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![json!({"text": "h\u{e9}"})]);
    }

    #[test]
    fn text_stream_produces_block_sequence() {
        let mut t = StreamTranslator::new("claude-3-5-sonnet-20241022");
        let mut events = Vec::new();
        events.extend(t.push(&chunk(json!([{"text": "Hel"}]), None)));
        events.extend(t.push(&chunk(json!([{"text": "lo"}]), Some("STOP"))));
        assert!(t.saw_finish());
        events.extend(t.finish());

        assert_eq!(
            types(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let StreamEvent::MessageDelta { delta, .. } = &events[5] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta["stop_reason"], "end_turn");
        assert_well_formed(&events);
    }

    #[test]
    fn thinking_then_text_opens_two_blocks() {
        let mut t = StreamTranslator::new("m");
        let mut events = Vec::new();
        events.extend(t.push(&chunk(
            json!([{"text": "plan", "thought": true}, {"text": "", "thoughtSignature": "sig-1"}]),
            None,
        )));
        events.extend(t.push(&chunk(json!([{"text": "answer"}]), Some("STOP"))));
        events.extend(t.finish());

        let deltas: Vec<&Delta> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta { delta, .. } => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(
            deltas,
            vec![
                &Delta::ThinkingDelta { thinking: "plan".into() },
                &Delta::SignatureDelta { signature: "sig-1".into() },
                &Delta::TextDelta { text: "answer".into() },
            ]
        );
        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ContentBlockStart { .. }))
            .count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn function_call_is_a_complete_tool_use_block() {
        let mut t = StreamTranslator::new("m");
        let mut events = t.push(&chunk(
            json!([{"functionCall": {"id": "call_1", "name": "get_weather", "args": {"city": "Oslo"}}}]),
            Some("STOP"),
        ));
        events.extend(t.finish());

        let StreamEvent::ContentBlockStart { content_block, .. } = &events[1] else {
            panic!("expected content_block_start");
        };
        assert_eq!(content_block["type"], "tool_use");
        assert_eq!(content_block["id"], "call_1");
        assert_eq!(
            events[2],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: "{\"city\":\"Oslo\"}".into()
                }
            }
        );
        let StreamEvent::MessageDelta { delta, .. } = &events[events.len() - 2] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta["stop_reason"], "tool_use");
    }

    #[test]
    fn usage_is_reported_on_message_delta() {
        let mut t = StreamTranslator::new("m");
        let mut payload = chunk(json!([{"text": "x"}]), Some("MAX_TOKENS"));
        payload["usageMetadata"] = json!({"promptTokenCount": 10, "candidatesTokenCount": 4});
        t.push(&payload);
        let events = t.finish();
        let StreamEvent::MessageDelta { delta, usage } = &events[events.len() - 2] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta["stop_reason"], "max_tokens");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 4);
    }

    #[test]
    fn nothing_is_emitted_after_a_terminal_event() {
        let mut t = StreamTranslator::new("m");
        t.push(&chunk(json!([{"text": "x"}]), None));
        let _ = t.fail(&ClassifiedError::new(ErrorKind::Upstream, "boom"));
        assert!(t.push(&chunk(json!([{"text": "y"}]), Some("STOP"))).is_empty());
        assert!(t.finish().is_empty());
    }

    #[tokio::test]
    async fn spawned_translator_completes_normally() {
        let (_tx, shutdown) = watch::channel(false);
        let upstream = byte_stream(vec![
            Ok(sse(&chunk(json!([{"text": "Hello"}]), None))),
            Ok(sse(&chunk(json!([{"text": " world"}]), Some("STOP")))),
        ]);
        let events = collect(spawn_translator(upstream, "m".into(), shutdown).0).await;

        assert_well_formed(&events);
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_single_error_event() {
        let (_tx, shutdown) = watch::channel(false);
        let upstream = byte_stream(vec![
            Ok(sse(&chunk(json!([{"text": "partial"}]), None))),
            Err(UpstreamError::transport("connection reset by peer")),
            Ok(sse(&chunk(json!([{"text": "never seen"}]), Some("STOP")))),
        ]);
        let events = collect(spawn_translator(upstream, "m".into(), shutdown).0).await;

        assert_well_formed(&events);
        assert_eq!(events.last().unwrap().event_type(), "error");
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockDelta { delta: Delta::TextDelta { text }, .. } if text == "never seen"
        )));
    }

    #[tokio::test]
    async fn abrupt_end_without_finish_reason_is_an_error() {
        let (_tx, shutdown) = watch::channel(false);
        let upstream = byte_stream(vec![Ok(sse(&chunk(json!([{"text": "cut"}]), None)))]);
        let events = collect(spawn_translator(upstream, "m".into(), shutdown).0).await;

        assert_well_formed(&events);
        let StreamEvent::Error { error } = events.last().unwrap() else {
            panic!("expected error terminal");
        };
        assert_eq!(error.kind, ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn upstream_error_payload_is_classified() {
        let (_tx, shutdown) = watch::channel(false);
        let error_payload = json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota exhausted"}});
        let upstream = byte_stream(vec![Ok(Bytes::from(format!("data: {error_payload}\n\n")))]);
        let events = collect(spawn_translator(upstream, "m".into(), shutdown).0).await;

        assert_well_formed(&events);
        let StreamEvent::Error { error } = events.last().unwrap() else {
            panic!("expected error terminal");
        };
        assert_eq!(error.kind, ErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn upstream_failure_is_reported_to_dispatcher() {
        let (_tx, shutdown) = watch::channel(false);
        let error_payload = json!({"error": {"code": 429, "status": "RESOURCE_EXHAUSTED", "message": "quota exhausted"}});
        let upstream = byte_stream(vec![
            Ok(sse(&chunk(json!([{"text": "partial"}]), None))),
            Ok(Bytes::from(format!("data: {error_payload}\n\n"))),
        ]);
        let (rx, failure) = spawn_translator(upstream, "m".into(), shutdown);
        let events = collect(rx).await;

        assert_well_formed(&events);
        let failure = failure.await.unwrap();
        assert_eq!(failure.kind, ErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn clean_stream_reports_no_failure() {
        let (_tx, shutdown) = watch::channel(false);
        let upstream = byte_stream(vec![Ok(sse(&chunk(json!([{"text": "ok"}]), Some("STOP"))))]);
        let (rx, failure) = spawn_translator(upstream, "m".into(), shutdown);
        collect(rx).await;

        assert!(failure.await.is_err());
    }

    #[tokio::test]
    async fn shutdown_is_not_reported_as_upstream_failure() {
        let (tx, shutdown) = watch::channel(false);
        let upstream: ByteStream = Box::pin(stream::pending());
        let (mut rx, failure) = spawn_translator(upstream, "m".into(), shutdown);
        assert_eq!(rx.recv().await.unwrap().event_type(), "message_start");

        tx.send(true).unwrap();
        assert_eq!(rx.recv().await.unwrap().event_type(), "error");
        assert!(failure.await.is_err());
    }

    #[tokio::test]
    async fn shutdown_terminates_open_stream() {
        let (tx, shutdown) = watch::channel(false);
        let upstream: ByteStream = Box::pin(
            stream::iter(vec![Ok(sse(&chunk(json!([{"text": "hi"}]), None)))])
                .chain(stream::pending()),
        );
        let (mut rx, _failure) = spawn_translator(upstream, "m".into(), shutdown);

        assert_eq!(rx.recv().await.unwrap().event_type(), "message_start");
        assert_eq!(rx.recv().await.unwrap().event_type(), "content_block_start");
        assert_eq!(rx.recv().await.unwrap().event_type(), "content_block_delta");

        tx.send(true).unwrap();
        let last = rx.recv().await.unwrap();
        assert_eq!(last.event_type(), "error");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_reader() {
        let (_tx, shutdown) = watch::channel(false);
        let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);
        // The stream's state owns guard_tx; it is dropped with the stream
        let upstream: ByteStream = Box::pin(stream::unfold(guard_tx, |guard| async move {
            std::future::pending::<()>().await;
            Some((Ok(Bytes::new()), guard))
        }));
        let (mut rx, _failure) = spawn_translator(upstream, "m".into(), shutdown);
        assert_eq!(rx.recv().await.unwrap().event_type(), "message_start");
        drop(rx);

        let closed = tokio::time::timeout(Duration::from_secs(2), guard_rx.recv()).await;
        assert!(matches!(closed, Ok(None)), "upstream stream should be dropped");
    }
}
