//! Extracts token usage from an Anthropic SSE stream as it passes through.

use serde_json::Value;

use crate::models::messages::Usage;

#[derive(Debug, Default)]
pub struct StreamingUsageCollector {
    buf: Vec<u8>,
    start_input_tokens: u64,
    start_cache_read: Option<u64>,
    start_cache_creation: Option<u64>,
    usage: Option<Usage>,
}

impl StreamingUsageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `chunk` and process every complete event in it. Bytes of an
    /// incomplete event, including a split UTF-8 sequence, wait for the next
    /// call.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        while let Some(pos) = find_event_end(&self.buf) {
            let event: Vec<u8> = self.buf.drain(..pos + 2).collect();
            self.process_event(&String::from_utf8_lossy(&event));
        }
    }

    /// `None` until a `message_delta` carrying `output_tokens` has been seen.
    pub fn get_usage(&self) -> Option<Usage> {
        self.usage
    }

    fn process_event(&mut self, event: &str) {
        for line in event.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(json) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            match json.get("type").and_then(|t| t.as_str()) {
                Some("message_start") => self.on_message_start(&json),
                Some("message_delta") => self.on_message_delta(&json),
                _ => {}
            }
        }
    }

    fn on_message_start(&mut self, json: &Value) {
        let Some(usage) = json.pointer("/message/usage") else {
            return;
        };
        self.start_input_tokens = u64_field(usage, "input_tokens").unwrap_or(0);
        self.start_cache_read = u64_field(usage, "cache_read_input_tokens");
        self.start_cache_creation = u64_field(usage, "cache_creation_input_tokens");
    }

    fn on_message_delta(&mut self, json: &Value) {
        let Some(usage) = json.get("usage") else {
            return;
        };
        let Some(output_tokens) = u64_field(usage, "output_tokens") else {
            return;
        };
        let input_tokens = u64_field(usage, "input_tokens")
            .filter(|n| *n > 0)
            .unwrap_or(self.start_input_tokens);

        self.usage = Some(Usage {
            input_tokens,
            output_tokens,
            cache_read_input_tokens: u64_field(usage, "cache_read_input_tokens").or(self.start_cache_read),
            cache_creation_input_tokens: u64_field(usage, "cache_creation_input_tokens")
                .or(self.start_cache_creation),
        });
    }
}

fn find_event_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn u64_field(obj: &Value, name: &str) -> Option<u64> {
    obj.get(name).and_then(|v| v.as_u64())
}

// ── Tests ───────────────────────────────────────────────────────
