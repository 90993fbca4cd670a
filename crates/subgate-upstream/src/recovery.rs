//! Thinking-signature recovery: when the upstream rejects the cryptographic
//! signatures on replayed thinking blocks, downgrade them to plain text and
//! retry. A second stage additionally flattens tool blocks when the error
//! implicates them.

use serde_json::{Value, json};

fn message_contents_mut(body: &mut Value) -> Vec<&mut Vec<Value>> {
    let mut out = Vec::new();
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages {
            if let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) {
                out.push(blocks);
            }
        }
    }
    out
}

/// Stage 1: `thinking` blocks become text blocks carrying their textual
/// content; `redacted_thinking` blocks (no recoverable text) are dropped.
/// Returns whether anything changed.
pub fn downgrade_thinking_blocks(body: &mut Value) -> bool {
    let mut changed = false;
    for blocks in message_contents_mut(body) {
        for block in blocks.iter_mut() {
            if block.get("type").and_then(Value::as_str) == Some("thinking") {
                let text = block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                *block = json!({"type": "text", "text": text});
                changed = true;
            }
        }
        let before = blocks.len();
        blocks.retain(|block| {
            block.get("type").and_then(Value::as_str) != Some("redacted_thinking")
        });
        changed |= blocks.len() != before;
    }
    drop_empty_messages(body);
    changed
}

/// Stage 2: flatten tool interactions into text so the transcript survives
/// without block-level validation.
pub fn downgrade_tool_blocks(body: &mut Value) -> bool {
    let mut changed = false;
    for blocks in message_contents_mut(body) {
        for block in blocks.iter_mut() {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let text = format!("[tool_use {name}: {input}]");
                    *block = json!({"type": "text", "text": text});
                    changed = true;
                }
                Some("tool_result") => {
                    let content = block.get("content").cloned().unwrap_or(Value::Null);
                    let text = match content {
                        Value::String(text) => text,
                        other => format!("[tool_result: {other}]"),
                    };
                    *block = json!({"type": "text", "text": text});
                    changed = true;
                }
                _ => {}
            }
        }
    }
    drop_empty_messages(body);
    changed
}

/// The upstream rejects messages whose content array went empty after a
/// downgrade pass.
fn drop_empty_messages(body: &mut Value) {
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        messages.retain(|message| {
            match message.get("content") {
                Some(Value::Array(blocks)) => !blocks.is_empty(),
                Some(Value::String(text)) => !text.is_empty(),
                _ => false,
            }
        });
    }
}
