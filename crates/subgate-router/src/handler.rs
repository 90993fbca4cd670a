use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use subgate_billing::BillingInput;
use subgate_common::GroupId;
use subgate_core::{
    Acquired, ClientInfo, ScheduleError, ScheduleRequest, derive_session_hash,
    digest_chain_for_messages,
};
use subgate_protocol::{ParsedRequest, SessionContext};
use subgate_rewrite::{Headers, RewriteContext, get_header, rewrite_request};
use subgate_upstream::{
    ForwardError, ForwardOutcome, ForwardResult, ForwardTask, count_tokens_endpoint,
    forward_count_tokens, messages_endpoint,
};

use crate::respond::{buffered_response, sanitized_error_response, sse_response};
use crate::{GatewayState, RequestIdentity};

/// Upper bound for buffered inbound bodies.
const MAX_INBOUND_BODY: usize = 20 * 1024 * 1024;
/// Cross-account failover attempts per client request.
const MAX_ACCOUNT_SWITCHES: usize = 3;

pub(crate) async fn messages(
    State(state): State<Arc<GatewayState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let identity = parts.extensions.get::<RequestIdentity>().cloned();
    let raw = match to_bytes(body, MAX_INBOUND_BODY).await {
        Ok(raw) => raw,
        Err(_) => return sanitized_error_response(413, "invalid_request_error", "body too large"),
    };
    let client_headers = headers_to_vec(&parts.headers);
    let session = session_context(&parts.headers, identity.as_ref());

    let parsed = match ParsedRequest::from_bytes(&raw, session) {
        Ok(parsed) => parsed,
        Err(err) => {
            // Validation errors never touch an account.
            return sanitized_error_response(400, "invalid_request_error", &err.to_string());
        }
    };

    serve_messages(state, identity, client_headers, parsed).await
}

async fn serve_messages(
    state: Arc<GatewayState>,
    identity: Option<RequestIdentity>,
    client_headers: Headers,
    parsed: ParsedRequest,
) -> Response {
    let mut session_hash = derive_session_hash(&parsed).unwrap_or_default();
    let group_id = identity.as_ref().and_then(|identity| identity.group_id);

    // Remember the pre-request binding: a flip mid-conversation drives
    // force-cache billing.
    let mut prev_binding = if session_hash.is_empty() {
        None
    } else {
        state
            .scheduler
            .sessions()
            .bound_account(group_id, &session_hash)
            .await
    };

    // Digest-chain recovery: clients that cannot carry a sticky key derive
    // a different hash every turn as the transcript grows. Match the
    // conversation by its previous-turn content digest instead.
    if !session_hash.is_empty() && prev_binding.is_none() {
        let texts = per_message_texts(&parsed);
        for prefix_len in [texts.len().saturating_sub(1), texts.len().saturating_sub(2)] {
            if prefix_len == 0 {
                continue;
            }
            let Some(chain) = digest_chain_for_messages(&texts[..prefix_len]) else {
                continue;
            };
            if let Some((session_uuid, account)) = state
                .scheduler
                .sessions()
                .digest_lookup(group_id, &chain)
                .await
            {
                debug!(account, "recovered session via digest chain");
                session_hash = session_uuid;
                prev_binding = Some(account);
                state
                    .scheduler
                    .sessions()
                    .bind(group_id, &session_hash, account)
                    .await;
                break;
            }
        }
    }

    let mut excluded: HashSet<i64> = HashSet::new();
    let mut last_failover_status: u16 = 502;

    for _ in 0..MAX_ACCOUNT_SWITCHES {
        let schedule_request = ScheduleRequest {
            group_id,
            session_hash: (!session_hash.is_empty()).then(|| session_hash.clone()),
            model: Some(parsed.model.clone()),
            excluded: excluded.clone(),
            forced_platform: None,
            client: ClientInfo {
                user_agent: Some(parsed.session.user_agent.clone()),
                has_metadata_user_id: parsed.metadata_user_id.is_some(),
            },
        };
        let acquired = match state.scheduler.schedule(&schedule_request).await {
            Ok(acquired) => acquired,
            Err(err) => return schedule_error_response(&err),
        };
        let account = acquired.account.clone();

        let fingerprint = if account.is_oauth() {
            Some(state.fingerprints.for_account(account.id).await)
        } else {
            None
        };
        let rewritten = match rewrite_request(
            &parsed,
            &client_headers,
            &RewriteContext {
                account: &account,
                fingerprint: fingerprint.as_ref(),
                session_hash: &session_hash,
                config: &state.config.rewrite,
            },
        ) {
            Ok(rewritten) => rewritten,
            Err(err) => {
                warn!(account = account.id, error = %err, "rewrite failed");
                return sanitized_error_response(500, "api_error", "request rewrite failed");
            }
        };

        let (sink_tx, sink_rx) = if parsed.stream {
            let (tx, rx) = mpsc::channel(state.config.stream.channel_capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let task = ForwardTask {
            account: account.clone(),
            url: messages_endpoint(&account),
            headers: rewritten.headers,
            body: rewritten.body,
            original_model: rewritten.original_model,
            upstream_model: rewritten.upstream_model,
            mimic: rewritten.mimic,
            stream: parsed.stream,
            sink: sink_tx,
        };

        match state.forwarder.forward(task).await {
            Ok(ForwardOutcome::NonStream {
                status,
                headers,
                body,
                result,
            }) => {
                finish_success(
                    &state,
                    identity.as_ref(),
                    &acquired,
                    group_id,
                    &session_hash,
                    prev_binding,
                    &parsed,
                    result,
                )
                .await;
                return buffered_response(status, &headers, body);
            }
            Ok(ForwardOutcome::Stream {
                status: _,
                headers,
                result,
            }) => {
                let Some(rx) = sink_rx else {
                    return sanitized_error_response(500, "api_error", "stream setup failed");
                };
                let request_id = get_header(&headers, "x-request-id").map(str::to_string);

                // The completion task owns the slot until the upstream is
                // fully drained, so release pairs with acquire even on
                // client disconnect.
                let state_bg = state.clone();
                let identity_bg = identity.clone();
                let parsed_bg = parsed.clone();
                let session_hash_bg = session_hash.clone();
                tokio::spawn(async move {
                    match result.await {
                        Ok(forward_result) => {
                            finish_success(
                                &state_bg,
                                identity_bg.as_ref(),
                                &acquired,
                                group_id,
                                &session_hash_bg,
                                prev_binding,
                                &parsed_bg,
                                forward_result,
                            )
                            .await;
                        }
                        Err(err) => {
                            warn!(error = %err, "stream relay task failed");
                        }
                    }
                    acquired.slot.release();
                });

                let body =
                    Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
                return sse_response(request_id.as_deref(), body);
            }
            Err(ForwardError::Failover(failover)) => {
                acquired.slot.release();
                debug!(
                    account = account.id,
                    status = failover.status,
                    "failover; re-entering scheduler"
                );
                if failover.model_rate_limited && !session_hash.is_empty() {
                    state
                        .scheduler
                        .sessions()
                        .unbind(group_id, &session_hash)
                        .await;
                }
                excluded.insert(account.id);
                last_failover_status = failover.status;
                continue;
            }
            Err(ForwardError::Fatal { status, message }) => {
                return sanitized_error_response(client_status(status), "api_error", &message);
            }
            Err(ForwardError::Transport(_)) => {
                return sanitized_error_response(502, "api_error", "upstream transport error");
            }
            Err(ForwardError::ResponseTooLarge) => {
                return sanitized_error_response(502, "api_error", "upstream response too large");
            }
            Err(ForwardError::MissingSink) => {
                return sanitized_error_response(500, "api_error", "stream setup failed");
            }
        }
    }

    sanitized_error_response(
        client_status(last_failover_status),
        "api_error",
        "no upstream account could serve the request",
    )
}

pub(crate) async fn count_tokens(
    State(state): State<Arc<GatewayState>>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let identity = parts.extensions.get::<RequestIdentity>().cloned();
    let raw = match to_bytes(body, MAX_INBOUND_BODY).await {
        Ok(raw) => raw,
        Err(_) => return sanitized_error_response(413, "invalid_request_error", "body too large"),
    };
    let client_headers = headers_to_vec(&parts.headers);
    let session = session_context(&parts.headers, identity.as_ref());
    let parsed = match ParsedRequest::from_bytes(&raw, session) {
        Ok(parsed) => parsed,
        Err(err) => {
            return sanitized_error_response(400, "invalid_request_error", &err.to_string());
        }
    };

    let session_hash = derive_session_hash(&parsed).unwrap_or_default();
    let schedule_request = ScheduleRequest {
        group_id: identity.as_ref().and_then(|identity| identity.group_id),
        session_hash: (!session_hash.is_empty()).then(|| session_hash.clone()),
        model: Some(parsed.model.clone()),
        excluded: HashSet::new(),
        forced_platform: None,
        client: ClientInfo {
            user_agent: Some(parsed.session.user_agent.clone()),
            has_metadata_user_id: parsed.metadata_user_id.is_some(),
        },
    };
    let acquired = match state.scheduler.schedule(&schedule_request).await {
        Ok(acquired) => acquired,
        Err(err) => return schedule_error_response(&err),
    };
    let account = acquired.account.clone();

    let fingerprint = if account.is_oauth() {
        Some(state.fingerprints.for_account(account.id).await)
    } else {
        None
    };
    let rewritten = match rewrite_request(
        &parsed,
        &client_headers,
        &RewriteContext {
            account: &account,
            fingerprint: fingerprint.as_ref(),
            session_hash: &session_hash,
            config: &state.config.rewrite,
        },
    ) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(account = account.id, error = %err, "rewrite failed");
            return sanitized_error_response(500, "api_error", "request rewrite failed");
        }
    };

    let outcome = forward_count_tokens(
        state.upstream.as_ref(),
        count_tokens_endpoint(&account),
        rewritten.headers,
        rewritten.body,
        account.tls_fingerprint_enabled && account.is_oauth(),
    )
    .await;
    acquired.slot.release();

    match outcome {
        Ok((status, body)) => buffered_response(status, &Vec::new(), body),
        Err(_) => sanitized_error_response(502, "api_error", "upstream transport error"),
    }
}

/// Post-forward bookkeeping: digest-chain advance and billing. Sticky
/// binding was already written by the scheduler at admission time.
#[allow(clippy::too_many_arguments)]
async fn finish_success(
    state: &Arc<GatewayState>,
    identity: Option<&RequestIdentity>,
    acquired: &Acquired,
    group_id: Option<GroupId>,
    session_hash: &str,
    prev_binding: Option<i64>,
    parsed: &ParsedRequest,
    result: ForwardResult,
) {
    let account = &acquired.account;

    // Advance the digest-chain index so keyless clients can recover this
    // conversation next turn.
    if !session_hash.is_empty() {
        let texts = per_message_texts(parsed);
        if let Some(chain) = digest_chain_for_messages(&texts) {
            let old_chain = if texts.len() > 1 {
                digest_chain_for_messages(&texts[..texts.len() - 1]).map(|key| key.chain)
            } else {
                None
            };
            // The stored session id is the hash in use, so a recovery next
            // turn lands on the same sticky binding.
            state
                .scheduler
                .sessions()
                .digest_save(group_id, &chain, old_chain.as_deref(), session_hash, account.id)
                .await;
        }
    }

    let (Some(recorder), Some(identity)) = (&state.recorder, identity) else {
        return;
    };
    let sticky_account_flipped = prev_binding
        .map(|previous| previous != account.id)
        .unwrap_or(false);
    let group = identity.group_id.and_then(|id| state.registry.group(id));
    let input = BillingInput {
        result,
        account: account.clone(),
        group,
        user: identity.user.clone(),
        api_key_id: identity.api_key_id,
        key_quota_enabled: identity.key_quota_enabled,
        subscription: identity.subscription,
        sticky_account_flipped,
    };
    if let Err(err) = recorder.record(input).await {
        warn!(account = account.id, error = %err, "billing record failed");
    }
}

fn per_message_texts(parsed: &ParsedRequest) -> Vec<String> {
    parsed
        .messages()
        .iter()
        .map(|message| match message.get("content") {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(serde_json::Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(serde_json::Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        })
        .collect()
}

fn schedule_error_response(err: &ScheduleError) -> Response {
    match err {
        ScheduleError::NoAvailableAccounts => {
            sanitized_error_response(503, "overloaded_error", "no available accounts")
        }
        ScheduleError::ClaudeCodeOnly => sanitized_error_response(
            403,
            "permission_error",
            "this group requires a claude code client",
        ),
        ScheduleError::FallbackCycle => {
            sanitized_error_response(500, "api_error", "fallback group cycle")
        }
    }
}

/// Which upstream statuses are meaningful to echo back; everything else is
/// a 502 from the client's point of view.
fn client_status(status: u16) -> u16 {
    match status {
        400 | 404 | 413 | 422 | 429 => status,
        _ => 502,
    }
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn session_context(headers: &HeaderMap, identity: Option<&RequestIdentity>) -> SessionContext {
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_default();
    let user_agent = headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    SessionContext {
        client_ip,
        user_agent,
        api_key_id: identity.map(|identity| identity.api_key_id).unwrap_or(0),
    }
}
