//! Converse stream events → Anthropic SSE.

use std::collections::HashSet;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};

use super::eventstream::EventStreamDecoder;
use super::response::parse_usage;
use crate::models::messages::Usage;
use crate::proxy::adapter::{ByteStream, StreamError};

/// Render one Anthropic SSE event.
pub fn to_sse(event: &Value) -> Bytes {
    let kind = event.get("type").and_then(|t| t.as_str()).unwrap_or("message");
    Bytes::from(format!("event: {}\ndata: {}\n\n", kind, event))
}

/// Tracks message and block lifecycle so the emitted SSE is well formed even
/// when Bedrock omits `contentBlockStart` for text and reasoning blocks.
pub struct ConverseStreamTranslator {
    message_id: String,
    model: String,
    started: bool,
    stopped: bool,
    stop_reason: Option<String>,
    usage: Option<Usage>,
    open_blocks: HashSet<u64>,
}

impl ConverseStreamTranslator {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            started: false,
            stopped: false,
            stop_reason: None,
            usage: None,
            open_blocks: HashSet::new(),
        }
    }

    pub fn on_event(&mut self, event_type: &str, payload: &Value) -> Vec<Value> {
        let mut out = Vec::new();
        match event_type {
            "messageStart" => {
                if !self.started {
                    self.started = true;
                    out.push(json!({
                        "type": "message_start",
                        "message": {
                            "id": self.message_id,
                            "type": "message",
                            "role": "assistant",
                            "content": [],
                            "model": self.model,
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": {"input_tokens": 0, "output_tokens": 0},
                        }
                    }));
                }
            }
            "contentBlockStart" => {
                let index = block_index(payload);
                if let Some(tool) = payload.pointer("/start/toolUse") {
                    self.open_blocks.insert(index);
                    out.push(json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {
                            "type": "tool_use",
                            "id": tool.get("toolUseId").cloned().unwrap_or(Value::Null),
                            "name": tool.get("name").cloned().unwrap_or(Value::Null),
                            "input": {},
                        }
                    }));
                }
                // Text and reasoning blocks are opened by their first delta.
            }
            "contentBlockDelta" => {
                let index = block_index(payload);
                let Some(delta) = payload.get("delta") else {
                    return out;
                };
                if !self.open_blocks.contains(&index) {
                    self.open_blocks.insert(index);
                    out.push(json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": block_for_first_delta(delta),
                    }));
                }
                out.extend(map_delta(delta).into_iter().map(|d| {
                    json!({"type": "content_block_delta", "index": index, "delta": d})
                }));
            }
            "contentBlockStop" => {
                let index = block_index(payload);
                if !self.open_blocks.remove(&index) {
                    out.push(json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""},
                    }));
                }
                out.push(json!({"type": "content_block_stop", "index": index}));
            }
            "messageStop" => {
                self.stop_reason = payload
                    .get("stopReason")
                    .and_then(|s| s.as_str())
                    .map(String::from);
                if self.usage.is_some() {
                    self.flush_message_delta(&mut out);
                    self.emit_message_stop(&mut out);
                }
            }
            "metadata" => {
                self.usage = Some(parse_usage(payload.get("usage")));
                if self.stop_reason.is_some() {
                    self.flush_message_delta(&mut out);
                    self.emit_message_stop(&mut out);
                }
            }
            other => tracing::debug!(event_type = other, "ignoring converse stream event"),
        }
        out
    }

    /// Events owed at end of stream.
    pub fn finish(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        self.flush_message_delta(&mut out);
        if self.started && !self.stopped {
            self.emit_message_stop(&mut out);
        }
        out
    }

    fn flush_message_delta(&mut self, out: &mut Vec<Value>) {
        if self.stop_reason.is_none() && self.usage.is_none() {
            return;
        }
        let usage = self.usage.take().unwrap_or_default();
        out.push(json!({
            "type": "message_delta",
            "delta": {"stop_reason": self.stop_reason.take(), "stop_sequence": null},
            "usage": usage,
        }));
    }

    fn emit_message_stop(&mut self, out: &mut Vec<Value>) {
        if !self.stopped {
            self.stopped = true;
            out.push(json!({"type": "message_stop"}));
        }
    }
}

fn block_index(payload: &Value) -> u64 {
    payload
        .get("contentBlockIndex")
        .and_then(|i| i.as_u64())
        .unwrap_or(0)
}

fn block_for_first_delta(delta: &Value) -> Value {
    if delta.get("reasoningContent").is_some() {
        json!({"type": "thinking", "thinking": ""})
    } else if delta.get("toolUse").is_some() {
        json!({"type": "tool_use", "id": null, "name": null, "input": {}})
    } else {
        json!({"type": "text", "text": ""})
    }
}

fn map_delta(delta: &Value) -> Vec<Value> {
    if let Some(text) = delta.get("text") {
        return vec![json!({"type": "text_delta", "text": text})];
    }
    if let Some(tool) = delta.get("toolUse") {
        let partial = tool.get("input").cloned().unwrap_or_else(|| json!(""));
        return vec![json!({"type": "input_json_delta", "partial_json": partial})];
    }
    if let Some(reasoning) = delta.get("reasoningContent") {
        let mut out = Vec::new();
        if let Some(text) = reasoning.get("text") {
            out.push(json!({"type": "thinking_delta", "thinking": text}));
        }
        if let Some(sig) = reasoning.get("signature") {
            out.push(json!({"type": "signature_delta", "signature": sig}));
        }
        return out;
    }
    Vec::new()
}

struct TranslateState {
    upstream: BoxStream<'static, Result<Bytes, String>>,
    decoder: EventStreamDecoder,
    translator: ConverseStreamTranslator,
    pending_error: Option<StreamError>,
    finished: bool,
}

/// Decode a Converse event stream and re-emit it as Anthropic SSE bytes.
///
/// An `exception` frame ends the stream with an error after everything
/// decoded before it has been yielded.
pub fn translate_converse_stream<S, E>(upstream: S, message_id: String, model: String) -> ByteStream
where
    S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display,
{
    let state = TranslateState {
        upstream: upstream.map(|r| r.map_err(|e| e.to_string())).boxed(),
        decoder: EventStreamDecoder::new(),
        translator: ConverseStreamTranslator::new(message_id, model),
        pending_error: None,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(err) = st.pending_error.take() {
                st.finished = true;
                return Some((Err(err), st));
            }
            if st.finished {
                return None;
            }

            match st.upstream.next().await {
                Some(Ok(chunk)) => {
                    let frames = match st.decoder.feed(&chunk) {
                        Ok(frames) => frames,
                        Err(e) => {
                            st.finished = true;
                            return Some((Err(StreamError::EventStream(e)), st));
                        }
                    };
                    let mut out = BytesMut::new();
                    for frame in frames {
                        if frame.is_exception() {
                            let message = frame
                                .payload
                                .get("message")
                                .and_then(|m| m.as_str())
                                .map(String::from)
                                .unwrap_or_else(|| frame.payload.to_string());
                            st.pending_error = Some(StreamError::Exception {
                                kind: frame.event_type,
                                message,
                            });
                            break;
                        }
                        for event in st.translator.on_event(&frame.event_type, &frame.payload) {
                            out.extend_from_slice(&to_sse(&event));
                        }
                    }
                    if !out.is_empty() {
                        return Some((Ok(out.freeze()), st));
                    }
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(StreamError::Transport(e)), st));
                }
                None => {
                    st.finished = true;
                    let mut out = BytesMut::new();
                    for event in st.translator.finish() {
                        out.extend_from_slice(&to_sse(&event));
                    }
                    if out.is_empty() {
                        return None;
                    }
                    return Some((Ok(out.freeze()), st));
                }
            }
        }
    })
    .boxed()
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::converse::eventstream::encode_event_frame;

    fn types(events: &[Value]) -> Vec<&str> {
        events.iter().map(|e| e["type"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_text_message_lifecycle() {
        let mut t = ConverseStreamTranslator::new("msg_req_1", "claude-sonnet-4-5");
        let mut events = Vec::new();
        events.extend(t.on_event("messageStart", &json!({"role": "assistant"})));
        events.extend(t.on_event("contentBlockDelta", &json!({"contentBlockIndex": 0, "delta": {"text": "Hel"}})));
        events.extend(t.on_event("contentBlockDelta", &json!({"contentBlockIndex": 0, "delta": {"text": "lo"}})));
        events.extend(t.on_event("contentBlockStop", &json!({"contentBlockIndex": 0})));
        events.extend(t.on_event("messageStop", &json!({"stopReason": "end_turn"})));
        assert_eq!(types(&events).last(), Some(&"content_block_stop"));
        events.extend(t.on_event("metadata", &json!({"usage": {"inputTokens": 10, "outputTokens": 5}})));
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
        assert_eq!(events[0]["message"]["id"], "msg_req_1");
        assert_eq!(events[1]["content_block"]["type"], "text");
        assert_eq!(events[2]["delta"], json!({"type": "text_delta", "text": "Hel"}));
        assert_eq!(events[5]["delta"]["stop_reason"], "end_turn");
        assert_eq!(events[5]["usage"]["input_tokens"], 10);
        assert_eq!(events[5]["usage"]["output_tokens"], 5);
    }

    #[test]
    fn test_reasoning_and_tool_blocks() {
        let mut t = ConverseStreamTranslator::new("msg_x", "m");
        let mut events = t.on_event("messageStart", &json!({}));
        events.extend(t.on_event(
            "contentBlockDelta",
            &json!({"contentBlockIndex": 0, "delta": {"reasoningContent": {"text": "think"}}}),
        ));
        events.extend(t.on_event(
            "contentBlockDelta",
            &json!({"contentBlockIndex": 0, "delta": {"reasoningContent": {"signature": "sig"}}}),
        ));
        events.extend(t.on_event("contentBlockStop", &json!({"contentBlockIndex": 0})));
        events.extend(t.on_event(
            "contentBlockStart",
            &json!({"contentBlockIndex": 1, "start": {"toolUse": {"toolUseId": "tu_1", "name": "calc"}}}),
        ));
        events.extend(t.on_event(
            "contentBlockDelta",
            &json!({"contentBlockIndex": 1, "delta": {"toolUse": {"input": "{\"a\":"}}}),
        ));

        assert_eq!(events[1]["content_block"]["type"], "thinking");
        assert_eq!(events[2]["delta"]["type"], "thinking_delta");
        assert_eq!(events[3]["delta"], json!({"type": "signature_delta", "signature": "sig"}));
        assert_eq!(events[5]["content_block"]["type"], "tool_use");
        assert_eq!(events[5]["content_block"]["id"], "tu_1");
        // No duplicate start for a block opened by contentBlockStart.
        assert_eq!(events[6]["type"], "content_block_delta");
        assert_eq!(events[6]["delta"]["partial_json"], "{\"a\":");
    }

    #[test]
    fn test_finish_closes_unstopped_message() {
        let mut t = ConverseStreamTranslator::new("msg_x", "m");
        t.on_event("messageStart", &json!({}));
        t.on_event("messageStop", &json!({"stopReason": "max_tokens"}));
        let tail = t.finish();
        assert_eq!(types(&tail), vec!["message_delta", "message_stop"]);
        assert_eq!(tail[0]["usage"]["output_tokens"], 0);
        assert!(t.finish().is_empty());
    }

    #[test]
    fn test_sse_rendering() {
        let bytes = to_sse(&json!({"type": "message_stop"}));
        assert_eq!(&bytes[..], b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }

    #[tokio::test]
    async fn test_translate_stream_surfaces_exception() {
        let mut body = encode_event_frame("messageStart", "event", &json!({"role": "assistant"}));
        body.extend(encode_event_frame("throttlingException", "exception", &json!({"message": "slow down"})));
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);

        let mut out = translate_converse_stream(upstream, "msg_1".into(), "m".into());
        let first = out.next().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&first).unwrap().starts_with("event: message_start"));
        match out.next().await {
            Some(Err(StreamError::Exception { kind, message })) => {
                assert_eq!(kind, "throttlingException");
                assert_eq!(message, "slow down");
            }
            other => panic!("expected exception, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(out.next().await.is_none());
    }
}
