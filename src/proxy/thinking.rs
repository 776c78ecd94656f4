//! Keeps extended-thinking conversation history acceptable to the upstreams.
//!
//! Thinking blocks are only ever moved or dropped, never synthesized.

use serde_json::Value;

use crate::models::messages::MessagesRequest;

fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(|t| t.as_str())
}

fn is_thinking_block(block: &Value) -> bool {
    matches!(block_type(block), Some("thinking") | Some("redacted_thinking"))
}

fn is_invalid_redacted_thinking(block: &Value) -> bool {
    if block_type(block) != Some("redacted_thinking") {
        return false;
    }
    !matches!(block.get("data"), Some(Value::String(s)) if !s.is_empty())
}

fn assistant_blocks_mut(req: &mut MessagesRequest) -> impl Iterator<Item = &mut Vec<Value>> {
    req.messages
        .iter_mut()
        .filter(|m| m.role == "assistant")
        .filter_map(|m| m.content.as_array_mut())
}

/// Drop `redacted_thinking` blocks whose `data` is missing, non-string or empty.
pub fn remove_invalid_redacted_thinking(req: &mut MessagesRequest) {
    for blocks in assistant_blocks_mut(req) {
        blocks.retain(|b| !is_invalid_redacted_thinking(b));
    }
}

/// Move the first thinking block of each assistant turn to the front.
pub fn ensure_thinking_prefix(req: &mut MessagesRequest) {
    if !req.thinking_enabled() {
        return;
    }
    for blocks in assistant_blocks_mut(req) {
        if let Some(idx) = blocks.iter().position(is_thinking_block) {
            if idx > 0 {
                let block = blocks.remove(idx);
                blocks.insert(0, block);
            }
        }
    }
}

/// True when the latest assistant turn with a `tool_use` has no thinking
/// block; the upstream would reject the history with thinking enabled.
pub fn should_drop_thinking_param(req: &MessagesRequest) -> bool {
    if !req.thinking_enabled() {
        return false;
    }
    let last_with_tool_use = req
        .messages
        .iter()
        .filter(|m| m.role == "assistant")
        .filter_map(|m| m.content.as_array())
        .filter(|blocks| blocks.iter().any(|b| block_type(b) == Some("tool_use")))
        .last();

    match last_with_tool_use {
        Some(blocks) => !blocks.iter().any(is_thinking_block),
        None => false,
    }
}

/// Full normalisation applied to every inbound request.
pub fn normalize(req: &mut MessagesRequest) {
    remove_invalid_redacted_thinking(req);
    ensure_thinking_prefix(req);
    if should_drop_thinking_param(req) {
        tracing::debug!(model = %req.model, "dropping thinking param: tool_use turn without thinking");
        req.thinking = None;
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Value, thinking: Option<Value>) -> MessagesRequest {
        let mut v = json!({"model": "claude-sonnet-4-5", "messages": messages});
        if let Some(t) = thinking {
            v["thinking"] = t;
        }
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_invalid_redacted_removed_even_without_thinking() {
        let mut req = request(
            json!([{"role": "assistant", "content": [
                {"type": "redacted_thinking"},
                {"type": "redacted_thinking", "data": ""},
                {"type": "redacted_thinking", "data": 5},
                {"type": "redacted_thinking", "data": "ok"},
                {"type": "text", "text": "hi"}
            ]}]),
            None,
        );
        remove_invalid_redacted_thinking(&mut req);
        let blocks = req.messages[0].content.as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["data"], "ok");
    }

    #[test]
    fn test_thinking_moved_to_front() {
        let mut req = request(
            json!([
                {"role": "user", "content": [{"type": "text", "text": "q"}, {"type": "thinking", "thinking": "u"}]},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "a"},
                    {"type": "thinking", "thinking": "t"},
                    {"type": "redacted_thinking", "data": "r"}
                ]},
                {"role": "assistant", "content": "plain string"}
            ]),
            Some(json!({"type": "enabled", "budget_tokens": 1024})),
        );
        ensure_thinking_prefix(&mut req);

        let a = req.messages[1].content.as_array().unwrap();
        assert_eq!(a[0]["type"], "thinking");
        assert_eq!(a[1]["type"], "text");
        assert_eq!(a[2]["type"], "redacted_thinking");
        // User turns and string content untouched.
        assert_eq!(req.messages[0].content[0]["type"], "text");
        assert_eq!(req.messages[2].content, "plain string");
    }

    #[test]
    fn test_prefix_noop_when_disabled() {
        let mut req = request(
            json!([{"role": "assistant", "content": [{"type": "text", "text": "a"}, {"type": "thinking", "thinking": "t"}]}]),
            Some(json!({"type": "disabled"})),
        );
        ensure_thinking_prefix(&mut req);
        assert_eq!(req.messages[0].content[0]["type"], "text");
    }

    #[test]
    fn test_drop_when_last_tool_use_turn_lacks_thinking() {
        let thinking = Some(json!({"type": "enabled", "budget_tokens": 1024}));
        let mut req = request(
            json!([
                {"role": "assistant", "content": [{"type": "thinking", "thinking": "t"}, {"type": "tool_use", "id": "1", "name": "x", "input": {}}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "1", "content": "ok"}]},
                {"role": "assistant", "content": [{"type": "tool_use", "id": "2", "name": "x", "input": {}}]}
            ]),
            thinking.clone(),
        );
        assert!(should_drop_thinking_param(&req));
        normalize(&mut req);
        assert!(req.thinking.is_none());

        let kept = request(
            json!([{"role": "assistant", "content": [{"type": "redacted_thinking", "data": "r"}, {"type": "tool_use", "id": "1", "name": "x", "input": {}}]}]),
            thinking.clone(),
        );
        assert!(!should_drop_thinking_param(&kept));

        let no_tools = request(json!([{"role": "assistant", "content": [{"type": "text", "text": "a"}]}]), thinking);
        assert!(!should_drop_thinking_param(&no_tools));
    }
}
