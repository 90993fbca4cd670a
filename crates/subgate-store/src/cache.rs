use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetMemberOutcome {
    /// Live (non-expired) member count after the operation.
    pub members: usize,
    /// Whether the member was newly added rather than idle-refreshed.
    pub inserted: bool,
}

/// Narrow cache contract the gateway core schedules against: sticky session
/// bindings, digest chains, window-cost memoization, fingerprints and
/// per-account session sets all live behind this.
///
/// Callers treat every error as advisory (fail-open) unless documented
/// otherwise; the backend is expected to be a shared store such as Redis.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// `ttl == None` persists until overwritten or deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Positional batch get; the result has one slot per requested key.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// Add `member` to the set at `key` with a per-member idle expiry,
    /// refreshing the expiry when the member already exists.
    async fn add_set_member(
        &self,
        key: &str,
        member: &str,
        idle: Duration,
    ) -> CacheResult<SetMemberOutcome>;

    async fn remove_set_member(&self, key: &str, member: &str) -> CacheResult<()>;
}
