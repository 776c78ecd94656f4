//! Anthropic ⇄ Converse translation seen from the outside: a request built
//! for Bedrock, echoed back as a Converse response, parses to the blocks
//! that went in.

use serde_json::{json, Value};

use plan_proxy::models::messages::MessagesRequest;
use plan_proxy::proxy::converse::{build_converse_request, parse_converse_response};

fn anthropic_request() -> MessagesRequest {
    serde_json::from_value(json!({
        "model": "claude-sonnet-4-5",
        "max_tokens": 1024,
        "system": [{"type": "text", "text": "be brief", "cache_control": {"type": "ephemeral"}}],
        "messages": [
            {"role": "user", "content": "what is 2+2?"},
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "simple sum", "signature": "sig-1"},
                {"type": "redacted_thinking", "data": "opaque"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tu_1", "name": "calc", "input": {"expr": "2+2"}},
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "tu_1",
                 "content": [{"type": "text", "text": "4"}], "is_error": false,
                 "cache_control": {"type": "ephemeral"}},
            ]},
        ],
    }))
    .unwrap()
}

/// Converse content of message `index`, without cache markers.
fn converse_blocks(body: &Value, index: usize) -> Vec<Value> {
    body["messages"][index]["content"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|b| b.get("cachePoint").is_none())
        .cloned()
        .collect()
}

fn echo(blocks: Vec<Value>) -> Value {
    json!({
        "output": {"message": {"role": "assistant", "content": blocks}},
        "stopReason": "tool_use",
        "usage": {
            "inputTokens": 120,
            "outputTokens": 30,
            "cacheReadInputTokens": 64,
            "cacheCreationInputTokens": 16,
        },
    })
}

#[test]
fn test_assistant_blocks_survive_round_trip() {
    let req = anthropic_request();
    let body = build_converse_request(&req);

    let (resp, usage) = parse_converse_response(&echo(converse_blocks(&body, 1)), &req.model, "msg_rt");

    assert_eq!(resp.id, "msg_rt");
    assert_eq!(resp.model, "claude-sonnet-4-5");
    assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
    assert_eq!(
        resp.content,
        vec![
            json!({"type": "thinking", "thinking": "simple sum", "signature": "sig-1"}),
            json!({"type": "redacted_thinking", "data": "opaque"}),
            json!({"type": "text", "text": "Let me check."}),
            json!({"type": "tool_use", "id": "tu_1", "name": "calc", "input": {"expr": "2+2"}}),
        ]
    );
    assert_eq!(usage.input_tokens, 120);
    assert_eq!(usage.output_tokens, 30);
    assert_eq!(usage.cache_read_input_tokens, Some(64));
    assert_eq!(usage.cache_creation_input_tokens, Some(16));
    assert_eq!(resp.usage, usage);
}

#[test]
fn test_tool_result_survives_round_trip() {
    let req = anthropic_request();
    let body = build_converse_request(&req);

    let (resp, _) = parse_converse_response(&echo(converse_blocks(&body, 2)), &req.model, "msg_rt");

    assert_eq!(
        resp.content,
        vec![json!({
            "type": "tool_result",
            "tool_use_id": "tu_1",
            "content": [{"type": "text", "text": "4"}],
            "is_error": false,
        })]
    );
}

#[test]
fn test_cache_markers_follow_tagged_blocks() {
    let body = build_converse_request(&anthropic_request());

    assert_eq!(body["system"][0], json!({"text": "be brief"}));
    assert_eq!(body["system"][1], json!({"cachePoint": {"type": "default"}}));

    let last = body["messages"][2]["content"].as_array().unwrap();
    assert_eq!(last.len(), 2);
    assert!(last[0].get("toolResult").is_some());
    assert_eq!(last[1], json!({"cachePoint": {"type": "default"}}));

    // Untagged messages get no marker.
    assert_eq!(body["messages"][1]["content"].as_array().unwrap().len(), 4);
}

#[test]
fn test_error_tool_result_status() {
    let req: MessagesRequest = serde_json::from_value(json!({
        "model": "claude-haiku-4-5",
        "messages": [{"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "tu_9", "content": "boom", "is_error": true},
        ]}],
    }))
    .unwrap();

    let body = build_converse_request(&req);
    assert_eq!(body["messages"][0]["content"][0]["toolResult"]["status"], "error");

    let (resp, _) = parse_converse_response(&echo(converse_blocks(&body, 0)), &req.model, "m");
    assert_eq!(resp.content[0]["is_error"], true);
    assert_eq!(resp.content[0]["content"][0]["text"], "boom");
}
