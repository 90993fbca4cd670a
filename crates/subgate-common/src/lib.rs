use serde::{Deserialize, Serialize};

mod config;
mod debug;

pub use config::{
    FallbackOrder, ForwardConfig, GatewayConfig, RetryConfig, RewriteConfig, SchedulerConfig,
    StreamConfig,
};
pub use debug::{debug_claude_mimic, debug_model_routing};

pub type AccountId = i64;
pub type GroupId = i64;
pub type UserId = i64;
pub type ApiKeyId = i64;

/// Upstream platform an account authenticates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    Gemini,
    Antigravity,
    Sora,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
            Platform::Sora => "sora",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(Platform::Anthropic),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            "sora" => Some(Platform::Sora),
            _ => None,
        }
    }

    /// Platforms whose candidate pools admit mixed-scheduling antigravity accounts.
    pub fn supports_mixed_pool(&self) -> bool {
        matches!(self, Platform::Anthropic | Platform::Gemini)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "setup_token")]
    SetupToken,
    #[serde(rename = "api_key")]
    ApiKey,
}

impl AccountKind {
    pub fn is_oauth(&self) -> bool {
        matches!(self, AccountKind::OAuth | AccountKind::SetupToken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Error,
    Disabled,
}

/// Billing-time collapse target for provider-reported cache-creation buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTtlOverride {
    #[default]
    None,
    FiveMinute,
    OneHour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingKind {
    Balance,
    Subscription,
}
