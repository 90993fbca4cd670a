use serde_json::{Value, json};

/// Canonical Claude-Code system banner. OAuth upstreams expect requests to
/// open with it (or one of the known variants below).
pub const CLAUDE_CODE_BANNER: &str = "You are Claude Code, Anthropic's official CLI for Claude";

/// Every prelude the official clients are known to send. A system prompt
/// starting with any of these is left alone.
const KNOWN_PRELUDES: &[&str] = &[
    CLAUDE_CODE_BANNER,
    "You are Claude Code, Anthropic's official CLI for Claude.",
    "You are a Claude agent, built on Anthropic's Claude Agent SDK.",
    "You are an interactive CLI tool that helps users with software engineering tasks",
];

const OPENCODE_SENTENCE: &str = "You are OpenCode, the best coding agent on the planet.";

/// System-block prefixes injected by client-side tooling that must never
/// reach the upstream (billing metadata and quota annotations).
const SYSTEM_PREFIX_BLACKLIST: &[&str] = &["[billing-metadata]", "[usage-quota]"];

fn system_blocks_mut(body: &mut Value) -> Option<&mut Vec<Value>> {
    body.get_mut("system")?.as_array_mut()
}

fn block_text(block: &Value) -> Option<&str> {
    block.get("text").and_then(Value::as_str)
}

/// Whether the request already opens with a known Claude-Code prelude.
pub fn system_includes_claude_code_prompt(body: &Value) -> bool {
    match body.get("system") {
        Some(Value::String(text)) => starts_with_known_prelude(text),
        Some(Value::Array(blocks)) => blocks
            .first()
            .and_then(block_text)
            .map(starts_with_known_prelude)
            .unwrap_or(false),
        _ => false,
    }
}

fn starts_with_known_prelude(text: &str) -> bool {
    KNOWN_PRELUDES
        .iter()
        .any(|prelude| text.starts_with(prelude))
}

/// Prepend the canonical banner as an ephemeral-cached text block and merge
/// the banner prefix into the following block, matching what the official
/// CLI's requests look like on the wire.
///
/// Haiku traffic (background/summarization calls) is never prefixed.
pub fn inject_claude_code_prompt(body: &mut Value, model: &str) {
    if crate::body::is_haiku(model) {
        return;
    }
    if system_includes_claude_code_prompt(body) {
        return;
    }

    let banner_block = json!({
        "type": "text",
        "text": CLAUDE_CODE_BANNER,
        "cache_control": {"type": "ephemeral"},
    });

    let existing = body.get("system").cloned();
    let blocks = match existing {
        None | Some(Value::Null) => vec![banner_block],
        Some(Value::String(text)) => {
            vec![banner_block, json!({"type": "text", "text": merged_text(&text)})]
        }
        Some(Value::Array(mut blocks)) => {
            if let Some(first) = blocks.first_mut()
                && let Some(text) = block_text(first)
                && !text.starts_with(CLAUDE_CODE_BANNER)
            {
                let merged = merged_text(text);
                if let Some(obj) = first.as_object_mut() {
                    obj.insert("text".to_string(), Value::String(merged));
                }
            }
            blocks.insert(0, banner_block);
            blocks
        }
        Some(other) => vec![banner_block, other],
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("system".to_string(), Value::Array(blocks));
    }
}

fn merged_text(text: &str) -> String {
    format!("{CLAUDE_CODE_BANNER}\n\n{text}")
}

/// Replace the OpenCode identity sentence in system text with the canonical
/// banner. System blocks only: user instructions may legitimately mention
/// the word OpenCode, so no blanket keyword substitution.
pub fn erase_opencode_identity(body: &mut Value) {
    match body.get_mut("system") {
        Some(Value::String(text)) => {
            if text.contains(OPENCODE_SENTENCE) {
                *text = text.replace(OPENCODE_SENTENCE, CLAUDE_CODE_BANNER);
            }
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                let Some(text) = block_text(block) else {
                    continue;
                };
                if text.contains(OPENCODE_SENTENCE) {
                    let replaced = text.replace(OPENCODE_SENTENCE, CLAUDE_CODE_BANNER);
                    if let Some(obj) = block.as_object_mut() {
                        obj.insert("text".to_string(), Value::String(replaced));
                    }
                }
            }
        }
        _ => {}
    }
}

/// Drop system blocks injected by client-side tooling, after all additions
/// so the banner cannot be shadowed by a late insert.
pub fn filter_blacklisted_system_blocks(body: &mut Value) {
    let Some(blocks) = system_blocks_mut(body) else {
        return;
    };
    blocks.retain(|block| {
        block_text(block)
            .map(|text| {
                !SYSTEM_PREFIX_BLACKLIST
                    .iter()
                    .any(|prefix| text.starts_with(prefix))
            })
            .unwrap_or(true)
    });
}
