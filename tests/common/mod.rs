//! Shared helpers for tests that talk to mocked provider endpoints.

#![allow(dead_code)]

use llm_relay::models::ChatStream;
use llm_relay::Error;
use serde_json::{json, Value};

/// Joins JSON payloads into a `text/event-stream` body, one `data:` event each.
pub fn sse_body(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| format!("data: {}\n\n", event))
        .collect()
}

pub fn openai_completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12 }
    })
}

pub fn openai_stream(parts: &[&str]) -> String {
    let mut body: String = parts
        .iter()
        .map(|part| {
            let event = json!({
                "id": "chatcmpl-stream",
                "choices": [{ "index": 0, "delta": { "content": part }, "finish_reason": null }]
            });
            format!("data: {}\n\n", event)
        })
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn anthropic_message(text: &str) -> Value {
    json!({
        "id": "msg_test",
        "type": "message",
        "role": "assistant",
        "model": "claude-2",
        "content": [{ "type": "text", "text": text }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 4, "output_tokens": 6 }
    })
}

pub fn anthropic_stream(parts: &[&str]) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "event: message_start\ndata: {}\n\n",
        json!({ "type": "message_start", "message": { "id": "msg_stream" } })
    ));
    body.push_str("event: ping\ndata: {\"type\": \"ping\"}\n\n");
    for part in parts {
        body.push_str(&format!(
            "event: content_block_delta\ndata: {}\n\n",
            json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": part } })
        ));
    }
    body.push_str(&format!(
        "event: message_delta\ndata: {}\n\n",
        json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" }, "usage": { "output_tokens": 3 } })
    ));
    body.push_str("event: message_stop\ndata: {\"type\": \"message_stop\"}\n\n");
    body
}

pub fn gemini_response(text: &str, finish_reason: Option<&str>) -> Value {
    json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": text }] },
            "finishReason": finish_reason
        }],
        "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2 }
    })
}

/// Drains a stream, concatenating every delta.
pub async fn collect_stream_content(stream: &mut dyn ChatStream) -> Result<String, Error> {
    let mut content = String::new();
    while let Some(chunk) = stream.next_chunk().await? {
        content.push_str(&chunk.delta);
    }
    Ok(content)
}

/// Drains a stream until it ends or errors, returning what arrived before.
pub async fn collect_stream_with_error(stream: &mut dyn ChatStream) -> (String, Option<Error>) {
    let mut content = String::new();
    loop {
        match stream.next_chunk().await {
            Ok(Some(chunk)) => content.push_str(&chunk.delta),
            Ok(None) => return (content, None),
            Err(e) => return (content, Some(e)),
        }
    }
}
