use serde_json::{Value, json};

use subgate_core::{Account, Fingerprint, session_uuid_for_account};

pub(crate) fn is_haiku(model: &str) -> bool {
    model.to_ascii_lowercase().contains("haiku")
}

/// OAuth body normalization: the subscription endpoint rejects sampling and
/// tool-choice overrides, requires a tools array, and expects a Claude-CLI
/// shaped `metadata.user_id`.
pub fn normalize_for_oauth(
    body: &mut Value,
    account: &Account,
    fingerprint: Option<&Fingerprint>,
    session_hash: &str,
    mimic: bool,
) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    obj.remove("temperature");
    obj.remove("tool_choice");
    if !obj.contains_key("tools") {
        obj.insert("tools".to_string(), Value::Array(Vec::new()));
    }

    if mimic {
        strip_system_cache_control(body);
    }

    if let Some(fingerprint) = fingerprint {
        apply_metadata_user_id(body, account, fingerprint, session_hash);
    }
}

/// Strip `cache_control` from pre-existing system blocks when mimicking;
/// the injected banner block (recognizably the first block carrying the
/// banner text) keeps its marker.
fn strip_system_cache_control(body: &mut Value) {
    let Some(blocks) = body.get_mut("system").and_then(Value::as_array_mut) else {
        return;
    };
    for block in blocks {
        let is_banner = block
            .get("text")
            .and_then(Value::as_str)
            .map(|text| text == crate::system::CLAUDE_CODE_BANNER)
            .unwrap_or(false);
        if is_banner {
            continue;
        }
        if let Some(obj) = block.as_object_mut() {
            obj.remove("cache_control");
        }
    }
}

/// Ensure `metadata.user_id` matches the account's disguised identity:
/// `user_<clientID>_account_<accountUUID>_session_<uuid>`. A client-provided
/// value keeps its session UUID but is re-keyed to the fingerprint; absent
/// metadata is synthesized from the session hash.
fn apply_metadata_user_id(
    body: &mut Value,
    account: &Account,
    fingerprint: &Fingerprint,
    session_hash: &str,
) {
    let existing_session = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(Value::as_str)
        .and_then(extract_session_suffix)
        .map(str::to_string);

    let session_uuid = match existing_session {
        Some(uuid) => uuid,
        None => session_uuid_for_account(account.id, session_hash),
    };
    let user_id = synthesize_metadata_user_id(account, &fingerprint.client_id, &session_uuid);

    let Some(obj) = body.as_object_mut() else {
        return;
    };
    match obj.get_mut("metadata") {
        Some(Value::Object(metadata)) => {
            metadata.insert("user_id".to_string(), Value::String(user_id));
        }
        _ => {
            obj.insert("metadata".to_string(), json!({"user_id": user_id}));
        }
    }
}

fn extract_session_suffix(user_id: &str) -> Option<&str> {
    let pos = user_id.rfind("session_")?;
    let candidate = &user_id[pos + "session_".len()..];
    (candidate.len() == 36).then_some(candidate)
}

/// `user_<clientID>_account_<accountUUID>_session_<uuid>`, falling back to
/// the legacy empty-account form when the account has no UUID on file.
pub fn synthesize_metadata_user_id(
    account: &Account,
    client_id: &str,
    session_uuid: &str,
) -> String {
    let account_uuid = account.credential("account_uuid").unwrap_or("");
    format!("user_{client_id}_account_{account_uuid}_session_{session_uuid}")
}

/// Field-level substitution of the model id; the rest of the body is not
/// re-shaped.
pub fn rewrite_model_field(body: &mut Value, model: &str) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.to_string()));
    }
}
