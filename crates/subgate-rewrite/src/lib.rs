use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use subgate_common::{RewriteConfig, debug_claude_mimic};
use subgate_core::{Account, Fingerprint, is_claude_cli_client};
use subgate_protocol::ParsedRequest;

mod body;
mod budget;
mod headers;
mod system;

pub use body::{normalize_for_oauth, rewrite_model_field, synthesize_metadata_user_id};
pub use budget::enforce_cache_control_budget;
pub use headers::{
    Headers, build_headers, get_header, remove_header, set_header,
};
pub use system::{
    CLAUDE_CODE_BANNER, erase_opencode_identity, filter_blacklisted_system_blocks,
    inject_claude_code_prompt, system_includes_claude_code_prompt,
};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("account {0} is missing credential material")]
    MissingCredential(&'static str),
    #[error("body serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct RewriteContext<'a> {
    pub account: &'a Account,
    /// Present for OAuth accounts; drives the identity disguise.
    pub fingerprint: Option<&'a Fingerprint>,
    pub session_hash: &'a str,
    pub config: &'a RewriteConfig,
}

#[derive(Debug)]
pub struct RewrittenRequest {
    pub body: Bytes,
    pub headers: Headers,
    pub original_model: String,
    pub upstream_model: String,
    /// Claude-Code impersonation was applied.
    pub mimic: bool,
}

/// The ordered rewrite pipeline. Sequence matters: the banner must exist
/// before the blacklist filter and budget enforcement run, and the model is
/// mapped after all content edits so retries can re-run body stages safely.
pub fn rewrite_request(
    req: &ParsedRequest,
    client_headers: &Headers,
    ctx: &RewriteContext<'_>,
) -> Result<RewrittenRequest, RewriteError> {
    let account = ctx.account;
    let original_model = req.model.clone();

    // API-key passthrough: fresh auth header, body untouched apart from an
    // explicit per-account model mapping.
    if account.api_key_passthrough {
        let token = account
            .credential("api_key")
            .ok_or(RewriteError::MissingCredential("api_key"))?;
        let mut headers = headers::propagate_whitelisted(client_headers);
        headers::strip_inbound_auth(&mut headers);
        set_header(&mut headers, "x-api-key", token);
        headers::apply_defaults(&mut headers);

        let mut body = req.body().clone();
        let upstream_model = match account.model_mapping.get(&original_model) {
            Some(mapped) => {
                rewrite_model_field(&mut body, mapped);
                mapped.clone()
            }
            None => original_model.clone(),
        };
        return Ok(RewrittenRequest {
            body: Bytes::from(serde_json::to_vec(&body)?),
            headers,
            original_model,
            upstream_model,
            mimic: false,
        });
    }

    let mimic = account.is_oauth()
        && !is_claude_cli_client(
            Some(req.session.user_agent.as_str()),
            req.metadata_user_id.is_some(),
        );
    if debug_claude_mimic() {
        debug!(account = account.id, mimic, model = %original_model, "mimic decision");
    }

    let mut body = req.body().clone();

    if mimic {
        system::inject_claude_code_prompt(&mut body, &original_model);
        system::erase_opencode_identity(&mut body);
    }

    if account.is_oauth() {
        normalize_for_oauth(&mut body, account, ctx.fingerprint, ctx.session_hash, mimic);
    }

    system::filter_blacklisted_system_blocks(&mut body);
    enforce_cache_control_budget(&mut body, mimic);

    let upstream_model = account.upstream_model(&original_model);
    if upstream_model != original_model {
        rewrite_model_field(&mut body, &upstream_model);
    }

    let headers = build_headers(client_headers, ctx, &body, mimic, &original_model)?;

    Ok(RewrittenRequest {
        body: Bytes::from(serde_json::to_vec(&body)?),
        headers,
        original_model,
        upstream_model,
        mimic,
    })
}

/// Re-apply the body stages to an already-rewritten body value. Used by the
/// forwarder when a retry mutates content (thinking-block downgrade) and the
/// cache budget must be re-checked.
pub fn reenforce_budget(body: &mut Value, mimic: bool) {
    enforce_cache_control_budget(body, mimic);
}
