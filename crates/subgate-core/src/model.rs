/// Short → dated Anthropic model ids. OAuth upstreams reject the undated
/// aliases that api-key endpoints accept.
const ANTHROPIC_MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-opus-4-0", "claude-opus-4-20250514"),
    ("claude-opus-4-1", "claude-opus-4-1-20250805"),
    ("claude-opus-4-5", "claude-opus-4-5-20251101"),
    ("claude-opus-4-6", "claude-opus-4-6-20260120"),
    ("claude-sonnet-4-0", "claude-sonnet-4-20250514"),
    ("claude-sonnet-4-5", "claude-sonnet-4-5-20250929"),
    ("claude-haiku-4-5", "claude-haiku-4-5-20251001"),
    ("claude-3-7-sonnet-latest", "claude-3-7-sonnet-20250219"),
    ("claude-3-5-haiku-latest", "claude-3-5-haiku-20241022"),
];

/// Requested-model → antigravity upstream model defaults. Accounts may
/// override per entry through their own mapping table.
const ANTIGRAVITY_DEFAULT_MODELS: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "claude-sonnet-4-5"),
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5"),
    ("claude-opus-4-5", "claude-opus-4-5"),
    ("claude-opus-4-6", "claude-opus-4-6"),
    ("claude-haiku-4-5", "claude-haiku-4-5"),
    ("gemini-3-pro-preview", "gemini-3-pro-preview"),
    ("gemini-3-flash-preview", "gemini-3-flash-preview"),
    ("gemini-2.5-pro", "gemini-2.5-pro"),
    ("gemini-2.5-flash", "gemini-2.5-flash"),
];

pub fn normalize_anthropic_model(model: &str) -> Option<&'static str> {
    ANTHROPIC_MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, dated)| *dated)
}

pub fn antigravity_upstream_model(model: &str) -> Option<&'static str> {
    ANTIGRAVITY_DEFAULT_MODELS
        .iter()
        .find(|(requested, _)| *requested == model)
        .map(|(_, upstream)| *upstream)
}

pub fn is_haiku_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("haiku")
}
