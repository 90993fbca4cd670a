use std::sync::Arc;

use axum::Router;
use axum::routing::post;

use subgate_billing::{BillingRecorder, SubscriptionRef, UserRef};
use subgate_common::{ApiKeyId, GatewayConfig, GroupId};
use subgate_core::{AccountRegistry, FingerprintStore, Scheduler};
use subgate_upstream::{Forwarder, UpstreamClient};

mod handler;
mod respond;

pub use respond::sanitized_error_response;

/// Per-request identity resolved by the host's inbound authentication
/// layer (outside this core) and attached as a request extension. Requests
/// without one are served but not billed.
#[derive(Clone)]
pub struct RequestIdentity {
    pub user: UserRef,
    pub api_key_id: ApiKeyId,
    pub key_quota_enabled: bool,
    pub subscription: Option<SubscriptionRef>,
    pub group_id: Option<GroupId>,
}

pub struct GatewayState {
    pub scheduler: Arc<Scheduler>,
    pub forwarder: Arc<Forwarder>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub registry: Arc<AccountRegistry>,
    pub fingerprints: Arc<FingerprintStore>,
    pub recorder: Option<Arc<BillingRecorder>>,
    pub config: GatewayConfig,
}

/// The Anthropic-shape inbound surface: messages plus count-tokens. The
/// host process nests this under its own auth middleware.
pub fn gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/messages", post(handler::messages))
        .route("/v1/messages/count_tokens", post(handler::count_tokens))
        .with_state(state)
}
