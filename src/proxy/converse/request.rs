//! Anthropic Messages request → Bedrock Converse request body.

use serde_json::{json, Map, Value};

use crate::models::messages::MessagesRequest;

pub const MAX_CACHE_POINTS: usize = 4;
const MAX_METADATA_ENTRIES: usize = 16;
const MAX_METADATA_LEN: usize = 256;

/// Appends `cachePoint` markers after blocks tagged `cache_control: ephemeral`,
/// capped per request.
struct CachePoints {
    used: usize,
}

impl CachePoints {
    fn new() -> Self {
        Self { used: 0 }
    }

    fn after(&mut self, source: &Value, out: &mut Vec<Value>) {
        if !has_ephemeral_cache_control(source) || self.used >= MAX_CACHE_POINTS {
            return;
        }
        out.push(json!({"cachePoint": {"type": "default"}}));
        self.used += 1;
    }
}

fn has_ephemeral_cache_control(block: &Value) -> bool {
    block
        .get("cache_control")
        .and_then(|c| c.get("type"))
        .and_then(|t| t.as_str())
        == Some("ephemeral")
}

pub fn build_converse_request(req: &MessagesRequest) -> Value {
    let mut cache = CachePoints::new();
    let mut body = Map::new();

    let messages: Vec<Value> = req
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "content": content_blocks(&m.content, &mut cache),
            })
        })
        .collect();
    body.insert("messages".into(), Value::Array(messages));

    if let Some(system) = &req.system {
        let blocks = system_blocks(system, &mut cache);
        if !blocks.is_empty() {
            body.insert("system".into(), Value::Array(blocks));
        }
    }

    let inference = inference_config(req);
    if !inference.is_empty() {
        body.insert("inferenceConfig".into(), Value::Object(inference));
    }

    if let Some(tool_config) = tool_config(req, &mut cache) {
        body.insert("toolConfig".into(), tool_config);
    }

    if let Some(metadata) = request_metadata(req.metadata.as_ref()) {
        body.insert("requestMetadata".into(), Value::Object(metadata));
    }

    if let Some(thinking) = req.thinking.as_ref().filter(|t| !t.is_null()) {
        body.insert(
            "additionalModelRequestFields".into(),
            json!({ "thinking": thinking }),
        );
    }

    Value::Object(body)
}

fn content_blocks(content: &Value, cache: &mut CachePoints) -> Vec<Value> {
    match content {
        Value::Null => Vec::new(),
        Value::String(s) => vec![json!({ "text": s })],
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(content_block(item));
                cache.after(item, &mut out);
            }
            out
        }
        Value::Object(_) => {
            let mut out = vec![content_block(content)];
            cache.after(content, &mut out);
            out
        }
        other => vec![json!({ "text": other.to_string() })],
    }
}

fn content_block(block: &Value) -> Value {
    let obj = match block {
        Value::String(s) => return json!({ "text": s }),
        Value::Object(obj) => obj,
        other => return json!({ "text": other.to_string() }),
    };

    match obj.get("type").and_then(|t| t.as_str()) {
        Some("text") => json!({ "text": obj.get("text").cloned().unwrap_or_else(|| json!("")) }),
        Some("tool_use") => json!({
            "toolUse": {
                "toolUseId": obj.get("id").cloned().unwrap_or(Value::Null),
                "name": obj.get("name").cloned().unwrap_or(Value::Null),
                "input": obj.get("input").cloned().unwrap_or_else(|| json!({})),
            }
        }),
        Some("tool_result") => {
            let tool_use_id = obj
                .get("tool_use_id")
                .or_else(|| obj.get("toolUseId"))
                .cloned()
                .unwrap_or(Value::Null);
            let is_error = obj.get("is_error").and_then(|e| e.as_bool()).unwrap_or(false);
            json!({
                "toolResult": {
                    "toolUseId": tool_use_id,
                    "content": tool_result_content(obj.get("content")),
                    "status": if is_error { "error" } else { "success" },
                }
            })
        }
        Some("thinking") => {
            let text = obj
                .get("thinking")
                .or_else(|| obj.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let mut reasoning = Map::new();
            reasoning.insert("text".into(), json!(text));
            if let Some(sig) = obj.get("signature").filter(|s| !s.is_null()) {
                reasoning.insert("signature".into(), sig.clone());
            }
            json!({ "reasoningContent": { "reasoningText": reasoning } })
        }
        Some("redacted_thinking") => json!({
            "reasoningContent": {
                "redactedContent": obj.get("data").cloned().unwrap_or_else(|| json!(""))
            }
        }),
        _ => {
            // Already in Converse shape.
            if let Some(rc) = obj.get("reasoningContent") {
                return json!({ "reasoningContent": rc });
            }
            if obj.contains_key("toolUse") || obj.contains_key("toolResult") {
                return block.clone();
            }
            if let Some(text) = obj.get("text") {
                return json!({ "text": text });
            }
            json!({ "text": block.to_string() })
        }
    }
}

fn tool_result_content(content: Option<&Value>) -> Vec<Value> {
    match content {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![json!({ "text": s })],
        Some(Value::Array(items)) => items.iter().map(content_block).collect(),
        Some(other @ Value::Object(_)) => vec![content_block(other)],
        Some(other) => vec![json!({ "text": other.to_string() })],
    }
}

fn system_blocks(system: &Value, cache: &mut CachePoints) -> Vec<Value> {
    let one = |block: &Value| -> Value {
        match block {
            Value::String(s) => json!({ "text": s }),
            Value::Object(obj) if obj.contains_key("text") => json!({ "text": obj["text"] }),
            other => json!({ "text": other.to_string() }),
        }
    };

    match system {
        Value::Null => Vec::new(),
        Value::String(s) => vec![json!({ "text": s })],
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(one(item));
                cache.after(item, &mut out);
            }
            out
        }
        other => {
            let mut out = vec![one(other)];
            cache.after(other, &mut out);
            out
        }
    }
}

fn inference_config(req: &MessagesRequest) -> Map<String, Value> {
    let mut cfg = Map::new();
    if let Some(max_tokens) = req.max_tokens {
        cfg.insert("maxTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        cfg.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        cfg.insert("topP".into(), json!(top_p));
    }
    if let Some(top_k) = req.top_k {
        cfg.insert("topK".into(), json!(top_k));
    }
    if let Some(stops) = req.stop_sequences.as_ref().filter(|s| !s.is_empty()) {
        cfg.insert("stopSequences".into(), json!(stops));
    }
    cfg
}

fn tool_config(req: &MessagesRequest, cache: &mut CachePoints) -> Option<Value> {
    let tools = req.tools.as_ref().filter(|t| !t.is_empty())?;

    let mut specs = Vec::with_capacity(tools.len());
    for tool in tools {
        specs.push(tool_spec(tool));
        cache.after(tool, &mut specs);
    }

    let mut cfg = Map::new();
    cfg.insert("tools".into(), Value::Array(specs));
    if let Some(choice) = req.tool_choice.as_ref().and_then(tool_choice) {
        cfg.insert("toolChoice".into(), choice);
    }
    Some(Value::Object(cfg))
}

fn tool_spec(tool: &Value) -> Value {
    if let Some(spec) = tool.get("toolSpec") {
        return json!({ "toolSpec": spec });
    }
    if tool.get("type").and_then(|t| t.as_str()) == Some("function") {
        if let Some(func) = tool.get("function") {
            return json!({
                "toolSpec": {
                    "name": func.get("name").or_else(|| tool.get("name")).cloned().unwrap_or(Value::Null),
                    "description": func.get("description").cloned().unwrap_or(Value::Null),
                    "inputSchema": { "json": func.get("parameters").cloned().unwrap_or_else(|| json!({})) },
                }
            });
        }
    }
    json!({
        "toolSpec": {
            "name": tool.get("name").cloned().unwrap_or(Value::Null),
            "description": tool.get("description").cloned().unwrap_or(Value::Null),
            "inputSchema": { "json": tool.get("input_schema").cloned().unwrap_or_else(|| json!({})) },
        }
    })
}

fn tool_choice(choice: &Value) -> Option<Value> {
    let kind = match choice {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("type").and_then(|t| t.as_str()).unwrap_or(""),
        _ => return None,
    };
    match kind {
        "auto" => Some(json!({ "auto": {} })),
        "any" | "required" => Some(json!({ "any": {} })),
        "tool" => choice
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .map(|name| json!({ "tool": { "name": name } })),
        _ => choice
            .get("tool")
            .or_else(|| choice.get("function"))
            .and_then(|t| t.get("name"))
            .and_then(|n| n.as_str())
            .filter(|n| !n.is_empty())
            .map(|name| json!({ "tool": { "name": name } })),
    }
}

/// Converse only accepts short string pairs, at most 16 of them.
fn request_metadata(metadata: Option<&Map<String, Value>>) -> Option<Map<String, Value>> {
    let metadata = metadata?;
    let mut cleaned = Map::new();
    for (key, value) in metadata {
        if cleaned.len() >= MAX_METADATA_ENTRIES {
            break;
        }
        let Some(value) = value.as_str() else {
            continue;
        };
        let key_len = key.chars().count();
        if (1..=MAX_METADATA_LEN).contains(&key_len) && value.chars().count() <= MAX_METADATA_LEN {
            cleaned.insert(key.clone(), json!(value));
        }
    }
    (!cleaned.is_empty()).then_some(cleaned)
}

// ── Tests ───────────────────────────────────────────────────────
