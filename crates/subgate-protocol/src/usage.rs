use serde::{Deserialize, Serialize};

use subgate_common::CacheTtlOverride;

/// Cache-creation sub-buckets as reported inside a usage object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCacheCreation {
    #[serde(default)]
    pub ephemeral_5m_input_tokens: u64,
    #[serde(default)]
    pub ephemeral_1h_input_tokens: u64,
}

/// Usage object exactly as upstreams serialize it. All fields default to
/// zero/absent so partial delta events decode without loss.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<WireCacheCreation>,
    /// OpenAI-compatible upstreams (Kimi) report the cache hit here instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
}

/// Billing-grade token counts with cache-creation TTL breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_5m_tokens: u64,
    pub cache_creation_1h_tokens: u64,
}

impl ClaudeUsage {
    pub fn from_wire(wire: &WireUsage) -> Self {
        let mut usage = Self::default();
        usage.overwrite_from_start(wire);
        usage
    }

    /// message_start semantics: the event carries the authoritative base
    /// counters, so every reported field overwrites.
    pub fn overwrite_from_start(&mut self, wire: &WireUsage) {
        self.input_tokens = wire.input_tokens;
        self.output_tokens = wire.output_tokens;
        self.cache_creation_input_tokens = wire.cache_creation_input_tokens;
        self.cache_read_input_tokens = wire.cache_read_input_tokens;
        self.apply_kimi_shim(wire);
        match wire.cache_creation {
            Some(buckets) => {
                self.cache_creation_5m_tokens = buckets.ephemeral_5m_input_tokens;
                self.cache_creation_1h_tokens = buckets.ephemeral_1h_input_tokens;
            }
            // Aggregate-only reports default into the 5m bucket.
            None => {
                self.cache_creation_5m_tokens = wire.cache_creation_input_tokens;
                self.cache_creation_1h_tokens = 0;
            }
        }
    }

    /// message_delta semantics: deltas carry only the counters that moved
    /// (typically output tokens), so zero fields must never clobber what
    /// message_start established.
    pub fn merge_delta(&mut self, wire: &WireUsage) {
        if wire.input_tokens > 0 {
            self.input_tokens = wire.input_tokens;
        }
        if wire.output_tokens > 0 {
            self.output_tokens = wire.output_tokens;
        }
        if wire.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = wire.cache_creation_input_tokens;
            if wire.cache_creation.is_none() && self.cache_creation_5m_tokens == 0 {
                self.cache_creation_5m_tokens = wire.cache_creation_input_tokens;
            }
        }
        if wire.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = wire.cache_read_input_tokens;
        }
        self.apply_kimi_shim(wire);
        if let Some(buckets) = wire.cache_creation {
            if buckets.ephemeral_5m_input_tokens > 0 {
                self.cache_creation_5m_tokens = buckets.ephemeral_5m_input_tokens;
            }
            if buckets.ephemeral_1h_input_tokens > 0 {
                self.cache_creation_1h_tokens = buckets.ephemeral_1h_input_tokens;
            }
        }
    }

    /// Kimi compatibility: copy `cached_tokens` into the cache-read counter
    /// only when the latter is still zero. Both populated non-zero would
    /// double-count, so the guard stays.
    fn apply_kimi_shim(&mut self, wire: &WireUsage) {
        if self.cache_read_input_tokens == 0
            && let Some(cached) = wire.cached_tokens
            && cached > 0
        {
            self.cache_read_input_tokens = cached;
        }
    }

    /// Collapse the 5m/1h buckets into the configured target. Idempotent.
    pub fn apply_cache_ttl_override(&mut self, ttl: CacheTtlOverride) {
        let total = self
            .cache_creation_5m_tokens
            .saturating_add(self.cache_creation_1h_tokens)
            .max(self.cache_creation_input_tokens);
        match ttl {
            CacheTtlOverride::None => {}
            CacheTtlOverride::FiveMinute => {
                self.cache_creation_input_tokens = total;
                self.cache_creation_5m_tokens = total;
                self.cache_creation_1h_tokens = 0;
            }
            CacheTtlOverride::OneHour => {
                self.cache_creation_input_tokens = total;
                self.cache_creation_5m_tokens = 0;
                self.cache_creation_1h_tokens = total;
            }
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
