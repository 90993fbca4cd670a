use bytes::Bytes;
use serde_json::Value;

use subgate_common::ApiKeyId;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("request body must be a json object")]
    NotAnObject,
    #[error("missing model field")]
    MissingModel,
}

/// Inbound transport facts attached to a request; used for session-hash
/// fallback derivation and logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub client_ip: String,
    pub user_agent: String,
    pub api_key_id: ApiKeyId,
}

/// A decoded Anthropic-shape messages request.
///
/// The body is kept as a JSON object so rewrites can substitute individual
/// fields without re-modeling every content-block variant; the canonical
/// serialization is computed once and reused across retries.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    body: Value,
    bytes: Bytes,
    pub model: String,
    pub stream: bool,
    pub metadata_user_id: Option<String>,
    pub session: SessionContext,
}

impl ParsedRequest {
    pub fn from_bytes(raw: &[u8], session: SessionContext) -> Result<Self, ProtocolError> {
        let body: Value = serde_json::from_slice(raw)?;
        Self::from_value(body, session)
    }

    pub fn from_value(body: Value, session: SessionContext) -> Result<Self, ProtocolError> {
        let obj = body.as_object().ok_or(ProtocolError::NotAnObject)?;
        let model = obj
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or(ProtocolError::MissingModel)?
            .to_string();
        let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let metadata_user_id = obj
            .get("metadata")
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let bytes = Bytes::from(serde_json::to_vec(&body)?);
        Ok(Self {
            body,
            bytes,
            model,
            stream,
            metadata_user_id,
            session,
        })
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Canonical serialization of the unmodified inbound body.
    pub fn body_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn system(&self) -> Option<&Value> {
        self.body.get("system")
    }

    pub fn messages(&self) -> &[Value] {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Concatenated plain text of the system prompt (string form or blocks).
    pub fn system_text(&self) -> String {
        match self.system() {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => {
                let mut out = String::new();
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        out.push_str(text);
                    }
                }
                out
            }
            _ => String::new(),
        }
    }

    /// Concatenated plain text of every message content block.
    pub fn message_texts(&self) -> String {
        let mut out = String::new();
        for message in self.messages() {
            match message.get("content") {
                Some(Value::String(text)) => out.push_str(text),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            out.push_str(text);
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Text of every content block tagged `cache_control.type == "ephemeral"`,
    /// system blocks first, then message blocks in order. This is the
    /// strongest cross-SDK conversation-identity signal.
    pub fn ephemeral_cached_text(&self) -> String {
        let mut out = String::new();
        if let Some(Value::Array(blocks)) = self.system() {
            for block in blocks {
                append_ephemeral_text(block, &mut out);
            }
        }
        for message in self.messages() {
            if let Some(Value::Array(blocks)) = message.get("content") {
                for block in blocks {
                    append_ephemeral_text(block, &mut out);
                }
            }
        }
        out
    }

    pub fn uses_tools(&self) -> bool {
        self.body
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| !tools.is_empty())
            .unwrap_or(false)
    }

    pub fn uses_thinking(&self) -> bool {
        self.body
            .get("thinking")
            .map(|t| !t.is_null())
            .unwrap_or(false)
    }
}

fn append_ephemeral_text(block: &Value, out: &mut String) {
    let is_ephemeral = block
        .get("cache_control")
        .and_then(|cc| cc.get("type"))
        .and_then(Value::as_str)
        == Some("ephemeral");
    if !is_ephemeral {
        return;
    }
    if let Some(text) = block.get("text").and_then(Value::as_str) {
        out.push_str(text);
    }
}
