use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use subgate_common::{
    AccountId, AccountKind, AccountStatus, BillingKind, CacheTtlOverride, GroupId, Platform,
};

use crate::model::{antigravity_upstream_model, normalize_anthropic_model};

/// An upstream credential with its scheduling and rewrite policy.
///
/// The struct itself is immutable configuration; the mutable health bits
/// (status, temp-unschedulable deadline, model-scope rate limits, last-used)
/// live in the [`crate::AccountRegistry`] state maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub platform: Platform,
    pub kind: AccountKind,

    /// Lower is preferred.
    pub priority: i32,
    /// Max parallel in-flight requests.
    pub concurrency: u32,
    pub schedulable: bool,
    pub status: AccountStatus,

    /// Requested → upstream model id. Empty means identity (subject to
    /// per-platform normalization).
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Empty means every model is allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// 0 = unlimited concurrently active session hashes.
    #[serde(default)]
    pub max_sessions: u32,
    #[serde(default)]
    pub session_idle_timeout_minutes: u32,
    #[serde(default)]
    pub window_cost_limit: Option<f64>,
    #[serde(default)]
    pub window_start: Option<OffsetDateTime>,
    /// antigravity-only: join anthropic/gemini candidate pools.
    #[serde(default)]
    pub mixed_scheduling_enabled: bool,
    #[serde(default)]
    pub cache_ttl_override: CacheTtlOverride,
    #[serde(default)]
    pub billing_rate_multiplier: Option<f64>,
    /// Forward the stored api key verbatim, skipping all rewrites.
    #[serde(default)]
    pub api_key_passthrough: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub tls_fingerprint_enabled: bool,
    /// Upstream statuses this account "handles" by passing them through to
    /// the client; api-key retries cover everything outside this list.
    #[serde(default = "default_handled_errors")]
    pub handled_error_codes: Vec<u16>,

    /// Opaque credential material; read through [`Account::credential`].
    #[serde(default)]
    credentials: HashMap<String, String>,
}

impl Account {
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set_credential(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.credentials.insert(key.into(), value.into());
    }

    pub fn is_oauth(&self) -> bool {
        self.kind.is_oauth()
    }

    /// Whether this account can serve `model` at all, after mapping and
    /// per-platform id normalization.
    pub fn supports_model(&self, model: &str) -> bool {
        if !self.allowed_models.is_empty()
            && !self
                .allowed_models
                .iter()
                .any(|allowed| allowed == model || allowed == "*")
        {
            return false;
        }
        match self.platform {
            Platform::Antigravity => {
                self.model_mapping.contains_key(model)
                    || antigravity_upstream_model(model).is_some()
            }
            _ => true,
        }
    }

    /// The model id this account sends upstream for a requested model.
    pub fn upstream_model(&self, model: &str) -> String {
        if let Some(mapped) = self.model_mapping.get(model) {
            return mapped.clone();
        }
        match self.platform {
            Platform::Antigravity => antigravity_upstream_model(model)
                .unwrap_or(model)
                .to_string(),
            Platform::Anthropic if self.is_oauth() => normalize_anthropic_model(model)
                .unwrap_or(model)
                .to_string(),
            _ => model.to_string(),
        }
    }

    /// Rolling-window cost gating applies to anthropic subscription-style
    /// credentials only.
    pub fn window_cost_gated(&self) -> bool {
        self.platform == Platform::Anthropic
            && self.is_oauth()
            && self.window_cost_limit.map(|l| l > 0.0).unwrap_or(false)
            && self.window_start.is_some()
    }
}

fn default_handled_errors() -> Vec<u16> {
    vec![400, 401, 403, 404, 413, 422, 429]
}

/// Per-media price columns carried by a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPrices {
    pub image_price: f64,
    pub video_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub pattern: String,
    pub accounts: Vec<AccountId>,
}

impl ModelRoute {
    /// Exact match or trailing-`*` prefix; `*` alone matches everything.
    pub fn matches(&self, model: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => self.pattern == model,
        }
    }
}

/// A tenant partition: platform selection, model routing, billing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub platform: Platform,
    #[serde(default)]
    pub claude_code_only: bool,
    #[serde(default)]
    pub fallback_group_id: Option<GroupId>,
    #[serde(default)]
    pub model_routing_enabled: bool,
    #[serde(default)]
    pub model_routing: Vec<ModelRoute>,
    #[serde(default)]
    pub rate_multiplier: Option<f64>,
    pub billing_kind: BillingKind,
    #[serde(default)]
    pub media_prices: Option<MediaPrices>,
}

impl Group {
    /// Account ids routed for `model`, or None when routing does not apply.
    pub fn routed_accounts(&self, model: &str) -> Option<&[AccountId]> {
        if !self.model_routing_enabled {
            return None;
        }
        self.model_routing
            .iter()
            .find(|route| route.matches(model))
            .map(|route| route.accounts.as_slice())
            .filter(|accounts| !accounts.is_empty())
    }
}
