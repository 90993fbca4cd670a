use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};

use subgate_common::{ForwardConfig, RetryConfig, StreamConfig};
use subgate_core::{Account, AccountRegistry};
use subgate_upstream::{
    ForwardError, ForwardOutcome, ForwardTask, Forwarder, TransportError, UpstreamBody,
    UpstreamClient, UpstreamRequest, UpstreamResponse,
};

struct ScriptedClient {
    responses: Mutex<VecDeque<(u16, Vec<(String, String)>, &'static str)>>,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedClient {
    fn new(script: Vec<(u16, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(
                script
                    .into_iter()
                    .map(|(status, body)| (status, Vec::new(), body))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_bodies(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|req| serde_json::from_slice(&req.body).unwrap())
            .collect()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(req);
            let (status, headers, body) = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
            })
        })
    }
}

fn account(kind: &str) -> Arc<Account> {
    Arc::new(
        serde_json::from_value(json!({
            "id": 7,
            "name": "acct-7",
            "platform": "anthropic",
            "kind": kind,
            "priority": 10,
            "concurrency": 4,
            "schedulable": true,
            "status": "active",
        }))
        .unwrap(),
    )
}

async fn registry_for(account: &Arc<Account>) -> Arc<AccountRegistry> {
    let registry = AccountRegistry::new();
    registry.load_accounts(vec![(**account).clone()]).await;
    registry
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        max_elapsed: Duration::from_secs(10),
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(2),
        same_account_retries: 2,
    }
}

fn forwarder(client: Arc<ScriptedClient>, registry: Arc<AccountRegistry>) -> Forwarder {
    Forwarder::new(
        client,
        registry,
        fast_retry(),
        StreamConfig::default(),
        ForwardConfig::default(),
    )
}

fn task(account: Arc<Account>, body: Value) -> ForwardTask {
    ForwardTask {
        account,
        url: "https://api.anthropic.com/v1/messages?beta=true".to_string(),
        headers: Vec::new(),
        body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        original_model: "claude-sonnet-4-5".to_string(),
        upstream_model: "claude-sonnet-4-5-20250929".to_string(),
        mimic: true,
        stream: false,
        sink: None,
    }
}

fn thinking_body() -> Value {
    json!({
        "model": "claude-sonnet-4-5-20250929",
        "messages": [
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "chain", "signature": "bad=="},
                {"type": "text", "text": "prior answer"},
            ]},
            {"role": "user", "content": "continue"},
        ],
    })
}

#[tokio::test]
async fn thinking_signature_400_downgrades_and_succeeds() {
    let client = ScriptedClient::new(vec![
        (400, "{\"error\":{\"message\":\"Invalid 'signature' in 'thinking' block\"}}"),
        (200, "{\"model\":\"claude-sonnet-4-5-20250929\",\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}"),
    ]);
    let account = account("oauth");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client.clone(), registry);

    let outcome = fwd.forward(task(account, thinking_body())).await.unwrap();
    let ForwardOutcome::NonStream { status, result, body, .. } = outcome else {
        panic!("expected non-stream outcome");
    };
    assert_eq!(status, 200);
    assert_eq!(result.usage.input_tokens, 5);

    let bodies = client.request_bodies();
    assert_eq!(bodies.len(), 2);
    // Second attempt went out with thinking downgraded to text.
    let retry_blocks = bodies[1]["messages"][0]["content"].as_array().unwrap();
    assert!(retry_blocks.iter().all(|b| b["type"] != "thinking"));
    assert_eq!(retry_blocks[0]["text"], "chain");

    // Response model mapped back to the client's id.
    let resp: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(resp["model"], "claude-sonnet-4-5");
}

#[tokio::test]
async fn second_stage_also_flattens_tool_blocks() {
    let client = ScriptedClient::new(vec![
        (400, "{\"error\":{\"message\":\"Invalid 'signature' in 'thinking' block\"}}"),
        (400, "{\"error\":{\"message\":\"signature mismatch near tool_use block\"}}"),
        (200, "{\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}"),
    ]);
    let account = account("oauth");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client.clone(), registry);

    let body = json!({
        "model": "claude-sonnet-4-5-20250929",
        "messages": [
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "t", "signature": "s"},
                {"type": "tool_use", "id": "t1", "name": "bash", "input": {"cmd": "ls"}},
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"},
            ]},
        ],
    });
    fwd.forward(task(account, body)).await.unwrap();

    let bodies = client.request_bodies();
    assert_eq!(bodies.len(), 3);
    let third = &bodies[2];
    for message in third["messages"].as_array().unwrap() {
        for block in message["content"].as_array().unwrap() {
            assert_eq!(block["type"], "text");
        }
    }
}

#[tokio::test]
async fn failover_on_529_marks_account() {
    let client = ScriptedClient::new(vec![(529, "overloaded")]);
    let account = account("oauth");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client.clone(), registry.clone());

    let err = fwd.forward(task(account, thinking_body())).await.unwrap_err();
    let ForwardError::Failover(failover) = err else {
        panic!("expected failover");
    };
    assert_eq!(failover.status, 529);
    assert!(!failover.model_rate_limited);
    // The rate-limit service made the account temporarily unschedulable.
    assert!(!registry.is_schedulable(7).await);
    assert_eq!(client.request_count(), 1);
}

#[tokio::test]
async fn rate_limit_429_scopes_to_model_and_signals_sticky_eviction() {
    let client = ScriptedClient::new(vec![(429, "rate limited")]);
    let account = account("api_key");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client, registry.clone());

    let err = fwd.forward(task(account, thinking_body())).await.unwrap_err();
    let ForwardError::Failover(failover) = err else {
        panic!("expected failover");
    };
    assert_eq!(failover.status, 429);
    assert!(failover.model_rate_limited);
    assert!(registry.is_model_rate_limited(7, "claude-sonnet-4-5").await);
    // Account-level schedulability survives a model-scoped limit.
    assert!(registry.is_schedulable(7).await);
}

#[tokio::test]
async fn oauth_403_retries_within_budget_then_fails_over() {
    let client = ScriptedClient::new(vec![
        (403, "forbidden"),
        (403, "forbidden"),
        (403, "forbidden"),
        (403, "forbidden"),
        (403, "forbidden"),
    ]);
    let account = account("oauth");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client.clone(), registry);

    let err = fwd.forward(task(account, thinking_body())).await.unwrap_err();
    assert!(matches!(err, ForwardError::Failover(f) if f.status == 403));
    // All five attempts were spent before the failover.
    assert_eq!(client.request_count(), 5);
}

#[tokio::test]
async fn api_key_handled_status_is_fatal_without_retry() {
    let client = ScriptedClient::new(vec![(404, "not found")]);
    let account = account("api_key");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client.clone(), registry.clone());

    let err = fwd.forward(task(account, thinking_body())).await.unwrap_err();
    let ForwardError::Fatal { status, message } = err else {
        panic!("expected fatal");
    };
    assert_eq!(status, 404);
    // Sanitized: no upstream body text.
    assert!(!message.contains("not found") || message == "upstream endpoint not found");
    assert_eq!(client.request_count(), 1);
    assert!(registry.is_schedulable(7).await);
}

#[tokio::test]
async fn empty_502_retries_same_account_before_failover() {
    let client = ScriptedClient::new(vec![(502, ""), (502, ""), (502, "")]);
    let account = account("oauth");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client.clone(), registry);

    let err = fwd.forward(task(account, thinking_body())).await.unwrap_err();
    let ForwardError::Failover(failover) = err else {
        panic!("expected failover");
    };
    assert_eq!(failover.status, 502);
    // Two bounded same-account retries were spent before the failover, and
    // the caller learns the glitch pattern is same-account retryable.
    assert!(failover.retryable_on_same_account);
    assert_eq!(client.request_count(), 3);
}

#[tokio::test]
async fn oversized_response_body_is_rejected() {
    let body: &'static str = Box::leak(
        format!("{{\"pad\":\"{}\"}}", "x".repeat(3 * 1024 * 1024)).into_boxed_str(),
    );
    let client = ScriptedClient::new(vec![(200, body)]);
    let account = account("oauth");
    let registry = registry_for(&account).await;
    let fwd = forwarder(client, registry);

    let err = fwd.forward(task(account, thinking_body())).await.unwrap_err();
    assert!(matches!(err, ForwardError::ResponseTooLarge));
}
