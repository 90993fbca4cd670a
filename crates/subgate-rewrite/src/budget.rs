use serde_json::Value;

/// Upstream cap on `cache_control` markers across system + messages.
const CACHE_CONTROL_BUDGET: usize = 4;

fn is_thinking_block(block: &Value) -> bool {
    matches!(
        block.get("type").and_then(Value::as_str),
        Some("thinking") | Some("redacted_thinking")
    )
}

fn has_cache_control(block: &Value) -> bool {
    block.get("cache_control").is_some()
}

fn strip_cache_control(block: &mut Value) {
    if let Some(obj) = block.as_object_mut() {
        obj.remove("cache_control");
    }
}

/// Enforce the ≤4 `cache_control` budget.
///
/// Thinking blocks are stripped unconditionally (the upstream rejects the
/// marker there regardless of budget). Over budget, message markers go
/// first head-to-tail, then system markers tail-to-head; when mimicking the
/// leading banner block is protected.
pub fn enforce_cache_control_budget(body: &mut Value, protect_banner: bool) {
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages.iter_mut() {
            if let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) {
                for block in blocks {
                    if is_thinking_block(block) {
                        strip_cache_control(block);
                    }
                }
            }
        }
    }

    let mut total = count_markers(body);
    if total <= CACHE_CONTROL_BUDGET {
        return;
    }

    // Messages head-to-tail first: older turns lose their markers before
    // the system prompt does.
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        'outer: for message in messages.iter_mut() {
            let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) else {
                continue;
            };
            for block in blocks {
                if total <= CACHE_CONTROL_BUDGET {
                    break 'outer;
                }
                if has_cache_control(block) {
                    strip_cache_control(block);
                    total -= 1;
                }
            }
        }
    }

    if total <= CACHE_CONTROL_BUDGET {
        return;
    }

    if let Some(system) = body.get_mut("system").and_then(Value::as_array_mut) {
        let protected = usize::from(protect_banner);
        for index in (protected..system.len()).rev() {
            if total <= CACHE_CONTROL_BUDGET {
                break;
            }
            if has_cache_control(&system[index]) {
                strip_cache_control(&mut system[index]);
                total -= 1;
            }
        }
    }
}

/// Markers that count against the budget: everything except thinking
/// blocks, which are invalid carriers rather than budget entries.
pub fn count_markers(body: &Value) -> usize {
    let mut total = 0;
    if let Some(system) = body.get("system").and_then(Value::as_array) {
        total += system.iter().filter(|b| has_cache_control(b)).count();
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                total += blocks
                    .iter()
                    .filter(|b| !is_thinking_block(b) && has_cache_control(b))
                    .count();
            }
        }
    }
    total
}
