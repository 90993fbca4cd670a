use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use subgate_common::AccountId;
use subgate_store::CacheStore;

use crate::account::Account;

const WINDOW_COST_MEMO_TTL: Duration = Duration::from_secs(60);
const DEFAULT_SESSION_IDLE_MINUTES: u32 = 30;
/// Above this share of the window limit an account only serves
/// conversations already stuck to it.
const STICKY_ONLY_RATIO: f64 = 0.9;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error("usage query failed: {0}")]
    Backend(String),
}

/// Batched usage-log window statistics, keyed by each account's window
/// start. Backed by the usage-log repository; one round trip per miss set.
#[async_trait]
pub trait UsageWindowQuery: Send + Sync {
    async fn window_costs(
        &self,
        windows: &[(AccountId, OffsetDateTime)],
    ) -> Result<HashMap<AccountId, f64>, QueryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCostDecision {
    Schedulable,
    /// Close to the limit: only a sticky hit may still land here.
    StickyOnly,
    NotSchedulable,
}

impl WindowCostDecision {
    pub fn allows_fresh(&self) -> bool {
        matches!(self, WindowCostDecision::Schedulable)
    }

    pub fn allows_sticky(&self) -> bool {
        !matches!(self, WindowCostDecision::NotSchedulable)
    }
}

/// Rolling-window spend gate for anthropic subscription credentials.
///
/// Costs are memoized in the cache; misses are resolved with one batched
/// usage-log query. Every failure path fails open: a broken cache or
/// repository must not stop scheduling.
pub struct WindowCostGate {
    cache: Arc<dyn CacheStore>,
    usage: Arc<dyn UsageWindowQuery>,
}

impl WindowCostGate {
    pub fn new(cache: Arc<dyn CacheStore>, usage: Arc<dyn UsageWindowQuery>) -> Self {
        Self { cache, usage }
    }

    fn memo_key(account: &Account) -> Option<String> {
        let start = account.window_start?;
        Some(format!(
            "wcost:{}:{}",
            account.id,
            start.unix_timestamp()
        ))
    }

    /// Decisions for the candidate set. Ungated accounts are always
    /// `Schedulable` and never touch the cache.
    pub async fn decisions(
        &self,
        candidates: &[Arc<Account>],
    ) -> HashMap<AccountId, WindowCostDecision> {
        let mut out = HashMap::with_capacity(candidates.len());
        let mut gated: Vec<&Arc<Account>> = Vec::new();
        for account in candidates {
            if account.window_cost_gated() {
                gated.push(account);
            } else {
                out.insert(account.id, WindowCostDecision::Schedulable);
            }
        }
        if gated.is_empty() {
            return out;
        }

        let keys: Vec<String> = gated
            .iter()
            .filter_map(|account| Self::memo_key(account))
            .collect();
        let cached = match self.cache.get_many(&keys).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "window-cost cache read failed; failing open");
                vec![None; keys.len()]
            }
        };

        let mut misses: Vec<(AccountId, OffsetDateTime)> = Vec::new();
        let mut costs: HashMap<AccountId, f64> = HashMap::new();
        for (account, hit) in gated.iter().zip(cached) {
            match hit.and_then(|v| v.parse::<f64>().ok()) {
                Some(cost) => {
                    costs.insert(account.id, cost);
                }
                None => {
                    if let Some(start) = account.window_start {
                        misses.push((account.id, start));
                    }
                }
            }
        }

        if !misses.is_empty() {
            match self.usage.window_costs(&misses).await {
                Ok(queried) => {
                    for (id, start) in &misses {
                        let cost = queried.get(id).copied().unwrap_or(0.0);
                        costs.insert(*id, cost);
                        let key = format!("wcost:{}:{}", id, start.unix_timestamp());
                        let _ = self
                            .cache
                            .set(&key, &cost.to_string(), Some(WINDOW_COST_MEMO_TTL))
                            .await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "window-cost query failed; failing open");
                    for (id, _) in &misses {
                        costs.insert(*id, 0.0);
                    }
                }
            }
        }

        for account in gated {
            let limit = account.window_cost_limit.unwrap_or(0.0);
            let cost = costs.get(&account.id).copied().unwrap_or(0.0);
            let decision = if cost >= limit {
                WindowCostDecision::NotSchedulable
            } else if cost >= limit * STICKY_ONLY_RATIO {
                WindowCostDecision::StickyOnly
            } else {
                WindowCostDecision::Schedulable
            };
            out.insert(account.id, decision);
        }
        out
    }
}

/// Outcome of registering a session against an account's `max_sessions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAdmission {
    Admitted,
    /// A new session would exceed the cap; the caller must release the slot
    /// and exclude the account for this request.
    OverLimit,
}

/// Per-account active-session cap over an idle-expiring member set.
pub struct SessionLimitGate {
    cache: Arc<dyn CacheStore>,
}

impl SessionLimitGate {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Called after slot acquisition and, separately, before returning a
    /// wait plan. Existing sessions are always admitted (their idle timer
    /// refreshes); only new sessions can be rejected. Fails open.
    pub async fn register(&self, account: &Account, session_hash: &str) -> SessionAdmission {
        if account.max_sessions == 0 || session_hash.is_empty() {
            return SessionAdmission::Admitted;
        }
        let idle_minutes = match account.session_idle_timeout_minutes {
            0 => DEFAULT_SESSION_IDLE_MINUTES,
            minutes => minutes,
        };
        let idle = Duration::from_secs(u64::from(idle_minutes) * 60);
        let key = format!("sessions:{}", account.id);

        let outcome = match self.cache.add_set_member(&key, session_hash, idle).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, account = account.id, "session register failed; failing open");
                return SessionAdmission::Admitted;
            }
        };
        if outcome.inserted && outcome.members > account.max_sessions as usize {
            // Roll the rejected member back out so it does not occupy a seat.
            let _ = self.cache.remove_set_member(&key, session_hash).await;
            return SessionAdmission::OverLimit;
        }
        SessionAdmission::Admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subgate_common::{AccountKind, Platform};
    use subgate_store::MemoryCache;

    fn gated_account(id: AccountId, limit: f64) -> Arc<Account> {
        let mut account: Account = serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("acct-{id}"),
            "platform": Platform::Anthropic.as_str(),
            "kind": "oauth",
            "priority": 10,
            "concurrency": 4,
            "schedulable": true,
            "status": "active",
        }))
        .unwrap();
        account.window_cost_limit = Some(limit);
        account.window_start = Some(OffsetDateTime::UNIX_EPOCH);
        Arc::new(account)
    }

    struct FixedCosts(HashMap<AccountId, f64>);

    #[async_trait]
    impl UsageWindowQuery for FixedCosts {
        async fn window_costs(
            &self,
            windows: &[(AccountId, OffsetDateTime)],
        ) -> Result<HashMap<AccountId, f64>, QueryError> {
            Ok(windows
                .iter()
                .filter_map(|(id, _)| self.0.get(id).map(|c| (*id, *c)))
                .collect())
        }
    }

    struct FailingCosts;

    #[async_trait]
    impl UsageWindowQuery for FailingCosts {
        async fn window_costs(
            &self,
            _windows: &[(AccountId, OffsetDateTime)],
        ) -> Result<HashMap<AccountId, f64>, QueryError> {
            Err(QueryError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn thresholds_produce_three_decisions() {
        let cache = Arc::new(MemoryCache::new());
        let usage = Arc::new(FixedCosts(HashMap::from([(1, 10.0), (2, 95.0), (3, 120.0)])));
        let gate = WindowCostGate::new(cache, usage);
        let candidates = vec![
            gated_account(1, 100.0),
            gated_account(2, 100.0),
            gated_account(3, 100.0),
        ];
        let decisions = gate.decisions(&candidates).await;
        assert_eq!(decisions[&1], WindowCostDecision::Schedulable);
        assert_eq!(decisions[&2], WindowCostDecision::StickyOnly);
        assert_eq!(decisions[&3], WindowCostDecision::NotSchedulable);
        assert!(decisions[&2].allows_sticky());
        assert!(!decisions[&2].allows_fresh());
    }

    #[tokio::test]
    async fn query_results_are_memoized() {
        let cache = Arc::new(MemoryCache::new());
        let usage = Arc::new(FixedCosts(HashMap::from([(1, 50.0)])));
        let gate = WindowCostGate::new(cache.clone(), usage);
        let candidates = vec![gated_account(1, 100.0)];
        gate.decisions(&candidates).await;

        // Second pass must be served by the memo even if the repository
        // would now fail.
        let gate = WindowCostGate::new(cache, Arc::new(FailingCosts));
        let decisions = gate.decisions(&candidates).await;
        assert_eq!(decisions[&1], WindowCostDecision::Schedulable);
    }

    #[tokio::test]
    async fn query_error_fails_open() {
        let gate = WindowCostGate::new(Arc::new(MemoryCache::new()), Arc::new(FailingCosts));
        let candidates = vec![gated_account(1, 1.0)];
        let decisions = gate.decisions(&candidates).await;
        assert_eq!(decisions[&1], WindowCostDecision::Schedulable);
    }

    fn capped_account(max_sessions: u32) -> Account {
        let mut account: Account = serde_json::from_value(serde_json::json!({
            "id": 9,
            "name": "acct-9",
            "platform": "anthropic",
            "kind": "oauth",
            "priority": 10,
            "concurrency": 4,
            "schedulable": true,
            "status": "active",
        }))
        .unwrap();
        account.max_sessions = max_sessions;
        account
    }

    #[tokio::test]
    async fn session_cap_rejects_only_new_sessions() {
        let gate = SessionLimitGate::new(Arc::new(MemoryCache::new()));
        let account = capped_account(2);
        assert_eq!(gate.register(&account, "s1").await, SessionAdmission::Admitted);
        assert_eq!(gate.register(&account, "s2").await, SessionAdmission::Admitted);
        assert_eq!(gate.register(&account, "s3").await, SessionAdmission::OverLimit);
        // Existing sessions keep flowing.
        assert_eq!(gate.register(&account, "s1").await, SessionAdmission::Admitted);
        // The rejected hash did not burn a seat.
        assert_eq!(gate.register(&account, "s3").await, SessionAdmission::OverLimit);
    }

    #[tokio::test]
    async fn zero_cap_is_unlimited() {
        let gate = SessionLimitGate::new(Arc::new(MemoryCache::new()));
        let account = capped_account(0);
        for i in 0..20 {
            assert_eq!(
                gate.register(&account, &format!("s{i}")).await,
                SessionAdmission::Admitted
            );
        }
    }

    #[tokio::test]
    async fn cache_failure_fails_open() {
        let cache = Arc::new(MemoryCache::new());
        cache.poison();
        let gate = SessionLimitGate::new(cache);
        let account = capped_account(1);
        assert_eq!(gate.register(&account, "sX").await, SessionAdmission::Admitted);
    }
}
