//! Bedrock Converse response body → Anthropic Messages response.

use serde_json::{json, Value};

use crate::models::messages::{MessagesResponse, Usage};

pub fn parse_converse_response(data: &Value, model: &str, message_id: &str) -> (MessagesResponse, Usage) {
    let content = data
        .pointer("/output/message/content")
        .and_then(|c| c.as_array())
        .map(|blocks| blocks.iter().filter_map(output_block).collect())
        .unwrap_or_default();

    let usage = parse_usage(data.get("usage"));

    let response = MessagesResponse {
        id: data
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or(message_id)
            .to_string(),
        kind: "message".into(),
        role: "assistant".into(),
        content,
        model: model.to_string(),
        stop_reason: data.get("stopReason").and_then(|s| s.as_str()).map(String::from),
        stop_sequence: None,
        usage,
    };
    (response, usage)
}

/// Converse `usage` / stream `metadata.usage` object.
pub fn parse_usage(raw: Option<&Value>) -> Usage {
    let field = |name: &str| raw.and_then(|u| u.get(name)).and_then(|v| v.as_u64());
    Usage {
        input_tokens: field("inputTokens").unwrap_or(0),
        output_tokens: field("outputTokens").unwrap_or(0),
        cache_read_input_tokens: field("cacheReadInputTokens"),
        cache_creation_input_tokens: field("cacheWriteInputTokens").or_else(|| field("cacheCreationInputTokens")),
    }
}

fn output_block(block: &Value) -> Option<Value> {
    if let Some(text) = block.get("text") {
        return Some(json!({ "type": "text", "text": text }));
    }
    if let Some(tool) = block.get("toolUse") {
        return Some(json!({
            "type": "tool_use",
            "id": tool.get("toolUseId").cloned().unwrap_or(Value::Null),
            "name": tool.get("name").cloned().unwrap_or(Value::Null),
            "input": tool.get("input").cloned().unwrap_or_else(|| json!({})),
        }));
    }
    if let Some(result) = block.get("toolResult") {
        let content: Vec<Value> = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("text"))
                    .map(|t| json!({ "type": "text", "text": t }))
                    .collect()
            })
            .unwrap_or_default();
        return Some(json!({
            "type": "tool_result",
            "tool_use_id": result.get("toolUseId").cloned().unwrap_or(Value::Null),
            "content": content,
            "is_error": result.get("status").and_then(|s| s.as_str()) == Some("error"),
        }));
    }
    if let Some(reasoning) = block.get("reasoningContent") {
        if let Some(rt) = reasoning.get("reasoningText") {
            let mut out = json!({
                "type": "thinking",
                "thinking": rt.get("text").cloned().unwrap_or_else(|| json!("")),
            });
            if let Some(sig) = rt.get("signature").filter(|s| !s.is_null()) {
                out["signature"] = sig.clone();
            }
            return Some(out);
        }
        if let Some(data) = reasoning.get("redactedContent") {
            return Some(json!({ "type": "redacted_thinking", "data": data }));
        }
    }
    None
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let data = json!({
            "output": {"message": {"role": "assistant", "content": [
                {"reasoningContent": {"reasoningText": {"text": "plan", "signature": "s1"}}},
                {"reasoningContent": {"redactedContent": "blob"}},
                {"text": "answer"},
                {"toolUse": {"toolUseId": "tu_9", "name": "calc", "input": {"a": 1}}},
                {"toolResult": {"toolUseId": "tu_9", "status": "error", "content": [{"text": "boom"}, {"json": {}}]}},
                {"image": {}}
            ]}},
            "stopReason": "tool_use",
            "usage": {"inputTokens": 12, "outputTokens": 7, "cacheReadInputTokens": 3}
        });

        let (resp, usage) = parse_converse_response(&data, "claude-sonnet-4-5", "msg_req_1");

        assert_eq!(resp.id, "msg_req_1");
        assert_eq!(resp.model, "claude-sonnet-4-5");
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(resp.content.len(), 5);
        assert_eq!(resp.content[0], json!({"type": "thinking", "thinking": "plan", "signature": "s1"}));
        assert_eq!(resp.content[1], json!({"type": "redacted_thinking", "data": "blob"}));
        assert_eq!(resp.content[2], json!({"type": "text", "text": "answer"}));
        assert_eq!(resp.content[3]["type"], "tool_use");
        assert_eq!(resp.content[4]["is_error"], true);
        assert_eq!(resp.content[4]["content"], json!([{"type": "text", "text": "boom"}]));

        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_input_tokens, Some(3));
        assert_eq!(usage.cache_creation_input_tokens, None);
        assert_eq!(resp.usage, usage);
    }

    #[test]
    fn test_parse_empty_body() {
        let (resp, usage) = parse_converse_response(&json!({}), "m", "msg_x");
        assert!(resp.content.is_empty());
        assert_eq!(usage, Usage::default());
        assert_eq!(resp.stop_reason, None);
    }
}
