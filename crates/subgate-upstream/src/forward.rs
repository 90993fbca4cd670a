use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use subgate_common::{ForwardConfig, RetryConfig, StreamConfig};
use subgate_core::{Account, AccountRegistry};
use subgate_protocol::{ClaudeUsage, response_usage, rewrite_event_cache_buckets};
use subgate_rewrite::{Headers, get_header};

use crate::classify::{
    implicates_tools, is_compat_400, is_failover_status, is_http_retryable,
    is_retryable_on_same_account, is_thinking_signature_400,
};
use crate::client::{UpstreamBody, UpstreamClient, UpstreamRequest};
use crate::recovery::{downgrade_thinking_blocks, downgrade_tool_blocks};
use crate::stream::{StreamParams, StreamReason, relay_stream};

/// Typed failover signal: the caller excludes this account and re-enters
/// the scheduler.
#[derive(Debug, Clone)]
pub struct UpstreamFailover {
    pub status: u16,
    pub body: Bytes,
    pub headers: Headers,
    /// Bounded same-account retries are still worthwhile (Google glitch
    /// patterns) before switching accounts.
    pub retryable_on_same_account: bool,
    /// The rate-limit service scoped the penalty to the requested model;
    /// sticky bindings for it must be evicted.
    pub model_rate_limited: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream failover (status {})", .0.status)]
    Failover(Box<UpstreamFailover>),
    #[error("upstream transport error")]
    Transport(String),
    #[error("upstream response too large")]
    ResponseTooLarge,
    #[error("upstream error (status {status})")]
    Fatal { status: u16, message: String },
    #[error("streaming requested without a client sink")]
    MissingSink,
}

/// Billing-relevant facts about one completed forward.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub request_id: Option<String>,
    pub usage: ClaudeUsage,
    /// The client's model id, pre-mapping.
    pub model: String,
    pub stream: bool,
    pub duration: Duration,
    pub first_token_ms: Option<u64>,
    pub client_disconnect: bool,
    pub media_type: Option<String>,
    pub image_count: Option<u32>,
    pub image_size: Option<String>,
}

/// One upstream dispatch job, produced by the rewriter.
pub struct ForwardTask {
    pub account: Arc<Account>,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    pub original_model: String,
    pub upstream_model: String,
    pub mimic: bool,
    pub stream: bool,
    /// Client-bound SSE sink; required for streaming forwards.
    pub sink: Option<mpsc::Sender<Bytes>>,
}

pub enum ForwardOutcome {
    NonStream {
        status: u16,
        headers: Headers,
        body: Bytes,
        result: ForwardResult,
    },
    /// Events are flowing into the task's sink; the join handle resolves to
    /// the final accounting once the stream drains.
    Stream {
        status: u16,
        headers: Headers,
        result: JoinHandle<ForwardResult>,
    },
}

pub struct Forwarder {
    client: Arc<dyn UpstreamClient>,
    registry: Arc<AccountRegistry>,
    retry: RetryConfig,
    stream_cfg: StreamConfig,
    forward_cfg: ForwardConfig,
}

impl Forwarder {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        registry: Arc<AccountRegistry>,
        retry: RetryConfig,
        stream_cfg: StreamConfig,
        forward_cfg: ForwardConfig,
    ) -> Self {
        Self {
            client,
            registry,
            retry,
            stream_cfg,
            forward_cfg,
        }
    }

    /// The shared retry envelope: bounded attempts under a wall-clock cap,
    /// staged thinking-signature recovery, in-budget backoff retries, and
    /// typed failover for everything that should switch accounts.
    pub async fn forward(&self, task: ForwardTask) -> Result<ForwardOutcome, ForwardError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut same_account_used: u32 = 0;
        let mut thinking_stage: u8 = 0;
        let mut body = task.body.clone();

        loop {
            attempt += 1;
            let request = UpstreamRequest {
                url: task.url.clone(),
                headers: task.headers.clone(),
                body: body.clone(),
                stream: task.stream,
                tls_fingerprint: task.account.tls_fingerprint_enabled && task.account.is_oauth(),
            };

            let response = match self.client.send(request).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(error = %err, attempt, "upstream transport failure");
                    if self.may_retry(attempt, started) {
                        self.backoff(attempt).await;
                        continue;
                    }
                    return Err(ForwardError::Transport(err.to_string()));
                }
            };

            if (200..300).contains(&response.status) {
                return self.complete(&task, response, started).await;
            }

            let status = response.status;
            let headers = response.headers;
            let error_body = match response.body {
                UpstreamBody::Bytes(bytes) => bytes,
                UpstreamBody::Stream(_) => Bytes::new(),
            };
            let text = String::from_utf8_lossy(&error_body).to_string();

            // Thinking-signature recovery: two staged body downgrades, each
            // used at most once within the budget.
            if status == 400 && self.may_retry(attempt, started) {
                if thinking_stage == 0 && is_thinking_signature_400(&text) {
                    if let Some(next) = mutate_body(&body, task.mimic, |value| {
                        downgrade_thinking_blocks(value)
                    }) {
                        debug!(attempt, "downgrading thinking blocks after signature 400");
                        body = next;
                        thinking_stage = 1;
                        continue;
                    }
                } else if thinking_stage == 1
                    && is_thinking_signature_400(&text)
                    && implicates_tools(&text)
                    && let Some(next) = mutate_body(&body, task.mimic, |value| {
                        let thinking = downgrade_thinking_blocks(value);
                        let tools = downgrade_tool_blocks(value);
                        thinking || tools
                    })
                {
                    debug!(attempt, "downgrading tool blocks after second signature 400");
                    body = next;
                    thinking_stage = 2;
                    continue;
                }
            }

            let same_account = is_retryable_on_same_account(status, &text);
            if same_account
                && same_account_used < self.retry.same_account_retries
                && self.may_retry(attempt, started)
            {
                same_account_used += 1;
                self.backoff(attempt).await;
                continue;
            }

            if is_http_retryable(task.account.kind, status, &task.account.handled_error_codes)
                && self.may_retry(attempt, started)
            {
                self.backoff(attempt).await;
                continue;
            }

            let failover = is_failover_status(status)
                || (self.forward_cfg.failover_on_400 && status == 400 && is_compat_400(&text));
            if failover {
                let retry_after = parse_retry_after(&headers);
                let disposition = self
                    .registry
                    .note_upstream_failure(
                        task.account.id,
                        Some(task.original_model.as_str()),
                        status,
                        retry_after,
                    )
                    .await;
                return Err(ForwardError::Failover(Box::new(UpstreamFailover {
                    status,
                    body: error_body,
                    headers,
                    retryable_on_same_account: same_account,
                    model_rate_limited: disposition.model_rate_limited,
                })));
            }

            // Terminal: a sanitized message reaches the client, the account
            // is untouched.
            return Err(ForwardError::Fatal {
                status,
                message: sanitized_message(status),
            });
        }
    }

    async fn complete(
        &self,
        task: &ForwardTask,
        response: crate::client::UpstreamResponse,
        started: Instant,
    ) -> Result<ForwardOutcome, ForwardError> {
        let request_id = get_header(&response.headers, "x-request-id").map(str::to_string);

        match response.body {
            UpstreamBody::Bytes(bytes) => {
                if bytes.len() > self.stream_cfg.nonstream_body_cap {
                    return Err(ForwardError::ResponseTooLarge);
                }
                let (body, usage) = self.finish_nonstream(task, bytes);
                Ok(ForwardOutcome::NonStream {
                    status: response.status,
                    headers: response.headers,
                    body,
                    result: ForwardResult {
                        request_id,
                        usage,
                        model: task.original_model.clone(),
                        stream: false,
                        duration: started.elapsed().max(Duration::from_millis(1)),
                        first_token_ms: None,
                        client_disconnect: false,
                        media_type: None,
                        image_count: None,
                        image_size: None,
                    },
                })
            }
            UpstreamBody::Stream(handle) => {
                let Some(sink) = task.sink.clone() else {
                    return Err(ForwardError::MissingSink);
                };
                let params = StreamParams {
                    sink,
                    cache_ttl: task.account.cache_ttl_override,
                    idle_timeout: self.stream_cfg.idle_timeout,
                    line_buffer_max: self.stream_cfg.line_buffer_max,
                };
                let registry = self.registry.clone();
                let account_id = task.account.id;
                let model = task.original_model.clone();
                let result = tokio::spawn(async move {
                    let stats = relay_stream(handle, params).await;
                    if stats.reason == StreamReason::Timeout {
                        registry.note_stream_timeout(account_id, &model).await;
                    }
                    ForwardResult {
                        request_id,
                        usage: stats.usage,
                        model,
                        stream: true,
                        duration: started.elapsed().max(Duration::from_millis(1)),
                        first_token_ms: stats.first_token_ms,
                        client_disconnect: stats.client_disconnect,
                        media_type: None,
                        image_count: None,
                        image_size: None,
                    }
                });
                Ok(ForwardOutcome::Stream {
                    status: response.status,
                    headers: response.headers,
                    result,
                })
            }
        }
    }

    /// Parse usage, apply the cache-TTL override to struct and JSON, and
    /// rewrite the response model back to the client's original id so SDKs
    /// never see the substitution.
    fn finish_nonstream(&self, task: &ForwardTask, bytes: Bytes) -> (Bytes, ClaudeUsage) {
        let Ok(mut value) = serde_json::from_slice::<Value>(&bytes) else {
            return (bytes, ClaudeUsage::default());
        };

        let mut usage = response_usage(&value)
            .map(|wire| ClaudeUsage::from_wire(&wire))
            .unwrap_or_default();
        usage.apply_cache_ttl_override(task.account.cache_ttl_override);

        let mut changed = rewrite_event_cache_buckets(&mut value, task.account.cache_ttl_override);
        if task.upstream_model != task.original_model
            && value.get("model").is_some()
            && let Some(obj) = value.as_object_mut()
        {
            obj.insert(
                "model".to_string(),
                Value::String(task.original_model.clone()),
            );
            changed = true;
        }

        let body = if changed {
            serde_json::to_vec(&value).map(Bytes::from).unwrap_or(bytes)
        } else {
            bytes
        };
        (body, usage)
    }

    fn may_retry(&self, attempt: u32, started: Instant) -> bool {
        attempt < self.retry.max_attempts && started.elapsed() < self.retry.max_elapsed
    }

    async fn backoff(&self, attempt: u32) {
        let step = attempt.saturating_sub(1).min(6);
        let base = self.retry.backoff_base.as_millis() as u64;
        let cap = self.retry.backoff_cap.as_millis() as u64;
        let backoff = base.saturating_mul(1u64 << step).min(cap);
        let jitter = rand::random::<u64>() % (base / 3 + 1);
        tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
    }
}

fn mutate_body(bytes: &Bytes, mimic: bool, mutate: impl FnOnce(&mut Value) -> bool) -> Option<Bytes> {
    let mut value: Value = serde_json::from_slice(bytes).ok()?;
    if !mutate(&mut value) {
        return None;
    }
    subgate_rewrite::reenforce_budget(&mut value, mimic);
    serde_json::to_vec(&value).ok().map(Bytes::from)
}

fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = get_header(headers, "retry-after")?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Client-facing error text; raw upstream bodies never leak here.
fn sanitized_message(status: u16) -> String {
    match status {
        400 => "upstream rejected the request".to_string(),
        404 => "upstream endpoint not found".to_string(),
        413 => "request too large for upstream".to_string(),
        _ => format!("upstream returned status {status}"),
    }
}
