use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Ordering applied to the fallback wait queue (scheduler layer 3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackOrder {
    #[default]
    LastUsed,
    Random,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Waiter cap for a sticky-bound account whose slots are all busy.
    pub sticky_max_waiting: usize,
    pub sticky_wait_timeout: Duration,
    /// Bounds for the layer-3 fallback queue.
    pub fallback_wait_timeout: Duration,
    pub fallback_max_waiting: usize,
    pub fallback_order: FallbackOrder,
    /// Prefer OAuth accounts inside equal sort keys on the gemini platform.
    pub gemini_prefer_oauth: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sticky_max_waiting: 3,
            sticky_wait_timeout: Duration::from_secs(30),
            fallback_wait_timeout: Duration::from_secs(45),
            fallback_max_waiting: 10,
            fallback_order: FallbackOrder::LastUsed,
            gemini_prefer_oauth: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Wall-clock budget across all attempts of one forward.
    pub max_elapsed: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Bounded same-account retries for upstream glitches that are not
    /// worth a failover (intermittent 400, empty 502).
    pub same_account_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(10),
            backoff_base: Duration::from_millis(300),
            backoff_cap: Duration::from_secs(3),
            same_account_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Terminate the stream when nothing was read from upstream for this long.
    pub idle_timeout: Duration,
    /// SSE line-buffer cap; some upstreams emit very large single events.
    pub line_buffer_max: usize,
    /// Byte cap for buffered non-streaming response bodies.
    pub nonstream_body_cap: usize,
    /// Bounded channel between the upstream reader fiber and the writer loop.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            line_buffer_max: 40 * 1024 * 1024,
            nonstream_body_cap: 2 * 1024 * 1024,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteConfig {
    /// Inject `anthropic-beta` for api-key accounts when the body needs it.
    pub inject_beta_for_api_key: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardConfig {
    /// Opt-in: treat 400s whose body looks like a beta/tool/thinking
    /// compatibility complaint as failover-able. False positives cause
    /// account churn, so this ships off.
    pub failover_on_400: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    pub rewrite: RewriteConfig,
    pub forward: ForwardConfig,
}
