//! Upstream error taxonomy: which failures retry in place, which downgrade
//! the body, which exclude the account, and which surface to the client.

use subgate_common::AccountKind;

/// Statuses that exclude the account for this request and re-enter the
/// scheduler.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 529) || (500..600).contains(&status)
}

/// Thinking-signature rejection patterns inside a 400 body. Matching any of
/// these triggers the in-request block-downgrade retry.
pub fn is_thinking_signature_400(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    if lowered.contains("signature") {
        return true;
    }
    if lowered.contains("expected") && lowered.contains("thinking or redacted_thinking") {
        return true;
    }
    if lowered.contains("thinking") && lowered.contains("cannot be modified") {
        return true;
    }
    lowered.contains("non-empty content")
}

/// Whether the 400 message implicates tool blocks, gating the second
/// downgrade stage.
pub fn implicates_tools(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("tool_use") || lowered.contains("tool_result") || lowered.contains("functioncall")
}

/// Upstream glitches that are worth re-trying on the *same* account before
/// any failover: Google's intermittent 400s and contentless 502s.
pub fn is_retryable_on_same_account(status: u16, body: &str) -> bool {
    match status {
        400 => {
            let lowered = body.to_ascii_lowercase();
            lowered.contains("internal error") || lowered.contains("please try again")
        }
        502 => body.trim().is_empty(),
        _ => false,
    }
}

/// Best-effort detection of 400s caused by beta/tool/thinking compatibility
/// rather than the request content. Substring heuristics; unmatched bodies
/// never imply failover, which is why the gate ships opt-in.
pub fn is_compat_400(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    const NEEDLES: &[&str] = &[
        "beta header",
        "not supported with",
        "is incompatible with",
        "extended thinking is not",
    ];
    NEEDLES.iter().any(|needle| lowered.contains(needle))
}

/// In-budget backoff retries on the same account: OAuth upstreams only ever
/// recover from 403 churn; api-key accounts retry anything outside their
/// handled list.
pub fn is_http_retryable(kind: AccountKind, status: u16, handled: &[u16]) -> bool {
    match kind {
        AccountKind::OAuth | AccountKind::SetupToken => status == 403,
        AccountKind::ApiKey => !handled.contains(&status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_signature_patterns() {
        assert!(is_thinking_signature_400("Invalid 'signature' in 'thinking' block"));
        assert!(is_thinking_signature_400(
            "expected a block of type thinking or redacted_thinking"
        ));
        assert!(is_thinking_signature_400("thinking blocks cannot be modified"));
        assert!(is_thinking_signature_400("must contain non-empty content"));
        assert!(!is_thinking_signature_400("model not found"));
    }

    #[test]
    fn tool_implication() {
        assert!(implicates_tools("unexpected tool_use block at index 3"));
        assert!(implicates_tools("functionCall is malformed"));
        assert!(!implicates_tools("just a thinking problem"));
    }

    #[test]
    fn same_account_retry_patterns() {
        assert!(is_retryable_on_same_account(400, "Internal error encountered."));
        assert!(is_retryable_on_same_account(502, "  "));
        assert!(!is_retryable_on_same_account(502, "<html>bad gateway</html>"));
        assert!(!is_retryable_on_same_account(400, "invalid model"));
    }

    #[test]
    fn failover_statuses() {
        for status in [401, 403, 429, 500, 503, 529, 599] {
            assert!(is_failover_status(status), "{status}");
        }
        for status in [200, 400, 404, 413] {
            assert!(!is_failover_status(status), "{status}");
        }
    }

    #[test]
    fn retryable_set_per_account_kind() {
        let handled = [400, 401, 403, 404];
        assert!(is_http_retryable(AccountKind::OAuth, 403, &handled));
        assert!(!is_http_retryable(AccountKind::OAuth, 500, &handled));
        assert!(is_http_retryable(AccountKind::ApiKey, 500, &handled));
        assert!(!is_http_retryable(AccountKind::ApiKey, 404, &handled));
    }
}
