use serde_json::Value;

use crate::{RewriteContext, RewriteError};

pub type Headers = Vec<(String, String)>;

pub fn set_header(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    match headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(&name))
    {
        Some((_, existing)) => *existing = value,
        None => headers.push((name.to_ascii_lowercase(), value)),
    }
}

pub fn get_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn remove_header(headers: &mut Headers, name: &str) -> Option<String> {
    let index = headers
        .iter()
        .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
    Some(headers.remove(index).1)
}

/// Client headers forwarded upstream. Everything else is dropped.
const PROPAGATED_HEADERS: [&str; 18] = [
    "accept",
    "accept-language",
    "content-type",
    "user-agent",
    "anthropic-version",
    "anthropic-beta",
    "anthropic-dangerous-direct-browser-access",
    "x-app",
    "x-stainless-arch",
    "x-stainless-lang",
    "x-stainless-os",
    "x-stainless-package-version",
    "x-stainless-retry-count",
    "x-stainless-runtime",
    "x-stainless-runtime-version",
    "x-stainless-timeout",
    "x-stainless-helper-method",
    "x-stainless-async",
];

const OAUTH_BETA: &str = "oauth-2025-04-20";
const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
/// Beta families stripped when impersonating: the OAuth endpoint rejects
/// them for disguised traffic.
const MIMIC_DROPPED_BETA_PREFIXES: &[&str] = &["claude-code", "context-1m"];

pub(crate) fn propagate_whitelisted(client_headers: &Headers) -> Headers {
    let mut out = Vec::new();
    for name in PROPAGATED_HEADERS {
        if let Some(value) = get_header(client_headers, name) {
            out.push((name.to_string(), value.to_string()));
        }
    }
    out
}

pub(crate) fn strip_inbound_auth(headers: &mut Headers) {
    for name in ["authorization", "x-api-key", "x-goog-api-key", "cookie"] {
        remove_header(headers, name);
    }
}

pub(crate) fn apply_defaults(headers: &mut Headers) {
    if get_header(headers, "anthropic-version").is_none() {
        set_header(headers, "anthropic-version", "2023-06-01");
    }
    if get_header(headers, "content-type").is_none() {
        set_header(headers, "content-type", "application/json");
    }
    if get_header(headers, "accept").is_none() {
        set_header(headers, "accept", "application/json");
    }
}

/// Build the outgoing header set: whitelist propagation, auth mode,
/// fingerprint override for OAuth identities, and the `anthropic-beta`
/// computation.
pub fn build_headers(
    client_headers: &Headers,
    ctx: &RewriteContext<'_>,
    body: &Value,
    mimic: bool,
    model: &str,
) -> Result<Headers, RewriteError> {
    let account = ctx.account;
    let mut headers = propagate_whitelisted(client_headers);
    strip_inbound_auth(&mut headers);

    if account.is_oauth() {
        let token = account
            .credential("access_token")
            .ok_or(RewriteError::MissingCredential("access_token"))?;
        set_header(&mut headers, "authorization", format!("Bearer {token}"));

        if let Some(fingerprint) = ctx.fingerprint {
            set_header(&mut headers, "user-agent", &fingerprint.user_agent);
            set_header(&mut headers, "x-app", &fingerprint.x_app);
            for (name, value) in &fingerprint.stainless {
                set_header(&mut headers, name.clone(), value.clone());
            }
        }
    } else {
        let token = account
            .credential("api_key")
            .ok_or(RewriteError::MissingCredential("api_key"))?;
        set_header(&mut headers, "x-api-key", token);
    }

    apply_beta_header(&mut headers, ctx, body, mimic, model);
    apply_defaults(&mut headers);
    Ok(headers)
}

fn body_needs_beta(body: &Value) -> bool {
    let has_tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| !tools.is_empty())
        .unwrap_or(false);
    let has_thinking = body.get("thinking").map(|t| !t.is_null()).unwrap_or(false);
    has_tools || has_thinking
}

fn apply_beta_header(
    headers: &mut Headers,
    ctx: &RewriteContext<'_>,
    body: &Value,
    mimic: bool,
    model: &str,
) {
    let incoming: Vec<String> = get_header(headers, "anthropic-beta")
        .map(|value| {
            value
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if ctx.account.is_oauth() {
        let mut values: Vec<String> = if mimic {
            incoming
                .into_iter()
                .filter(|token| {
                    !MIMIC_DROPPED_BETA_PREFIXES
                        .iter()
                        .any(|prefix| token.starts_with(prefix))
                })
                .collect()
        } else {
            incoming
        };
        ensure_token(&mut values, OAUTH_BETA);
        if mimic && !crate::body::is_haiku(model) {
            ensure_token(&mut values, INTERLEAVED_THINKING_BETA);
        }
        set_header(headers, "anthropic-beta", values.join(","));
        return;
    }

    // API-key accounts: the beta header goes out only when the body needs
    // it and injection is enabled.
    remove_header(headers, "anthropic-beta");
    if ctx.config.inject_beta_for_api_key && body_needs_beta(body) {
        let values = if incoming.is_empty() {
            vec![INTERLEAVED_THINKING_BETA.to_string()]
        } else {
            incoming
        };
        set_header(headers, "anthropic-beta", values.join(","));
    }
}

fn ensure_token(values: &mut Vec<String>, token: &str) {
    if !values.iter().any(|v| v.eq_ignore_ascii_case(token)) {
        values.push(token.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use subgate_common::{Platform, RewriteConfig};
    use subgate_core::{Account, Fingerprint};

    fn account(kind: &str) -> Account {
        let mut account: Account = serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": "acct-7",
            "platform": Platform::Anthropic.as_str(),
            "kind": kind,
            "priority": 10,
            "concurrency": 4,
            "schedulable": true,
            "status": "active",
        }))
        .unwrap();
        account.set_credential("access_token", "tok");
        account.set_credential("api_key", "sk-key");
        account
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            client_id: "f".repeat(32),
            user_agent: "claude-cli/2.1.27 (external, cli)".to_string(),
            x_app: "cli".to_string(),
            stainless: vec![("x-stainless-os".to_string(), "Linux".to_string())],
        }
    }

    fn ctx<'a>(
        account: &'a Account,
        fingerprint: Option<&'a Fingerprint>,
        config: &'a RewriteConfig,
    ) -> RewriteContext<'a> {
        RewriteContext {
            account,
            fingerprint,
            session_hash: "h",
            config,
        }
    }

    #[test]
    fn whitelist_drops_unknown_headers() {
        let client = vec![
            ("accept".to_string(), "application/json".to_string()),
            ("x-forwarded-for".to_string(), "1.2.3.4".to_string()),
            ("cookie".to_string(), "secret".to_string()),
        ];
        let out = propagate_whitelisted(&client);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "accept");
    }

    #[test]
    fn mimic_beta_drops_claude_code_and_keeps_oauth() {
        let account = account("oauth");
        let config = RewriteConfig::default();
        let fp = fingerprint();
        let client = vec![(
            "anthropic-beta".to_string(),
            "claude-code-20250219,context-1m-2025-08-07,fine-grained-tool-streaming-2025-05-14"
                .to_string(),
        )];
        let headers = build_headers(
            &client,
            &ctx(&account, Some(&fp), &config),
            &json!({}),
            true,
            "claude-sonnet-4-5",
        )
        .unwrap();
        let beta = get_header(&headers, "anthropic-beta").unwrap();
        assert!(!beta.contains("claude-code"));
        assert!(!beta.contains("context-1m"));
        assert!(beta.contains("oauth-2025-04-20"));
        assert!(beta.contains("interleaved-thinking-2025-05-14"));
        assert!(beta.contains("fine-grained-tool-streaming-2025-05-14"));
    }

    #[test]
    fn oauth_auth_is_bearer_with_fingerprint_override() {
        let account = account("oauth");
        let config = RewriteConfig::default();
        let fp = fingerprint();
        let client = vec![("user-agent".to_string(), "curl/8".to_string())];
        let headers = build_headers(
            &client,
            &ctx(&account, Some(&fp), &config),
            &json!({}),
            true,
            "claude-sonnet-4-5",
        )
        .unwrap();
        assert_eq!(get_header(&headers, "authorization"), Some("Bearer tok"));
        assert_eq!(
            get_header(&headers, "user-agent"),
            Some("claude-cli/2.1.27 (external, cli)")
        );
        assert_eq!(get_header(&headers, "x-stainless-os"), Some("Linux"));
        assert_eq!(get_header(&headers, "anthropic-version"), Some("2023-06-01"));
    }

    #[test]
    fn api_key_account_gets_no_beta_by_default() {
        let account = account("api_key");
        let config = RewriteConfig::default();
        let client = vec![(
            "anthropic-beta".to_string(),
            "interleaved-thinking-2025-05-14".to_string(),
        )];
        let headers = build_headers(
            &client,
            &ctx(&account, None, &config),
            &json!({"tools": [{"name": "t"}]}),
            false,
            "claude-sonnet-4-5",
        )
        .unwrap();
        assert_eq!(get_header(&headers, "anthropic-beta"), None);
        assert_eq!(get_header(&headers, "x-api-key"), Some("sk-key"));
    }

    #[test]
    fn api_key_beta_injected_when_flag_and_needed() {
        let account = account("api_key");
        let config = RewriteConfig {
            inject_beta_for_api_key: true,
        };
        let headers = build_headers(
            &[],
            &ctx(&account, None, &config),
            &json!({"thinking": {"type": "enabled", "budget_tokens": 1024}}),
            false,
            "claude-sonnet-4-5",
        )
        .unwrap();
        assert_eq!(
            get_header(&headers, "anthropic-beta"),
            Some("interleaved-thinking-2025-05-14")
        );

        // Body without tools/thinking: still nothing.
        let headers = build_headers(
            &[],
            &ctx(&account, None, &config),
            &json!({"tools": []}),
            false,
            "claude-sonnet-4-5",
        )
        .unwrap();
        assert_eq!(get_header(&headers, "anthropic-beta"), None);
    }
}
