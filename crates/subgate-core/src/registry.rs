use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use subgate_common::{AccountId, AccountStatus, GroupId, Platform};

use crate::account::{Account, Group};
use crate::recover::DeadlineQueue;

const RATE_LIMIT_FALLBACK_SECS: u64 = 30;
const SHORT_COOLDOWN_SECS: u64 = 10;
const STREAM_TIMEOUT_COOLDOWN_SECS: u64 = 60;

/// Mutable health bits of one account. Everything else about the account is
/// immutable snapshot data.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub status: AccountStatus,
    pub temp_unschedulable_until: Option<Instant>,
    pub last_used_at: Option<OffsetDateTime>,
}

/// What a recorded upstream failure did to the account, so callers can
/// decide on sticky-binding eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureDisposition {
    pub model_rate_limited: bool,
    pub account_unschedulable: bool,
}

/// In-memory schedulable-account view.
///
/// Account/group configuration is swapped wholesale by the producer
/// (repository refresh); health state mutates in place under per-account
/// serialization. Reads tolerate staleness: the scheduler re-checks
/// [`AccountRegistry::is_schedulable`] live before committing to a pick.
pub struct AccountRegistry {
    accounts: ArcSwap<HashMap<AccountId, Arc<Account>>>,
    by_platform: ArcSwap<HashMap<Platform, Vec<AccountId>>>,
    groups: ArcSwap<HashMap<GroupId, Arc<Group>>>,
    states: Arc<RwLock<HashMap<AccountId, AccountState>>>,
    model_limits: Arc<RwLock<HashMap<(AccountId, String), Instant>>>,
    mutation_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
    recover_queue: Arc<DeadlineQueue<AccountId>>,
    model_recover_queue: Arc<DeadlineQueue<(AccountId, String)>>,
}

impl AccountRegistry {
    pub fn new() -> Arc<Self> {
        let states: Arc<RwLock<HashMap<AccountId, AccountState>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let model_limits: Arc<RwLock<HashMap<(AccountId, String), Instant>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let recover: Arc<DeadlineQueue<AccountId>> = DeadlineQueue::new();
        let drain_states = states.clone();
        recover.clone().spawn_drain(move |due| {
            let states = drain_states.clone();
            async move {
                let now = Instant::now();
                let mut guard = states.write().await;
                for id in due {
                    if let Some(state) = guard.get_mut(&id)
                        && state.temp_unschedulable_until.map(|t| t <= now) == Some(true)
                    {
                        state.temp_unschedulable_until = None;
                    }
                }
            }
        });

        let model_recover: Arc<DeadlineQueue<(AccountId, String)>> = DeadlineQueue::new();
        let drain_limits = model_limits.clone();
        model_recover.clone().spawn_drain(move |due| {
            let limits = drain_limits.clone();
            async move {
                let now = Instant::now();
                let mut guard = limits.write().await;
                for key in due {
                    if guard.get(&key).map(|t| *t <= now) == Some(true) {
                        guard.remove(&key);
                    }
                }
            }
        });

        Arc::new(Self {
            accounts: ArcSwap::from_pointee(HashMap::new()),
            by_platform: ArcSwap::from_pointee(HashMap::new()),
            groups: ArcSwap::from_pointee(HashMap::new()),
            states,
            model_limits,
            mutation_locks: Mutex::new(HashMap::new()),
            recover_queue: recover,
            model_recover_queue: model_recover,
        })
    }

    /// Replace the configuration snapshot. Existing health state is kept for
    /// accounts that survive the refresh; new accounts start from their
    /// persisted status.
    pub async fn load_accounts(&self, accounts: Vec<Account>) {
        let mut map: HashMap<AccountId, Arc<Account>> = HashMap::new();
        let mut by_platform: HashMap<Platform, Vec<AccountId>> = HashMap::new();
        for account in accounts {
            by_platform
                .entry(account.platform)
                .or_default()
                .push(account.id);
            map.insert(account.id, Arc::new(account));
        }

        {
            let mut states = self.states.write().await;
            states.retain(|id, _| map.contains_key(id));
            for (id, account) in &map {
                states.entry(*id).or_insert_with(|| AccountState {
                    status: account.status,
                    temp_unschedulable_until: None,
                    last_used_at: None,
                });
            }
        }

        self.accounts.store(Arc::new(map));
        self.by_platform.store(Arc::new(by_platform));
    }

    pub fn load_groups(&self, groups: Vec<Group>) {
        let map: HashMap<GroupId, Arc<Group>> = groups
            .into_iter()
            .map(|group| (group.id, Arc::new(group)))
            .collect();
        self.groups.store(Arc::new(map));
    }

    pub fn account(&self, id: AccountId) -> Option<Arc<Account>> {
        self.accounts.load().get(&id).cloned()
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<Group>> {
        self.groups.load().get(&id).cloned()
    }

    /// The candidate pool for a platform. With `mixed`, antigravity accounts
    /// flagged for mixed scheduling join anthropic/gemini pools.
    pub fn platform_candidates(&self, platform: Platform, mixed: bool) -> Vec<Arc<Account>> {
        let accounts = self.accounts.load();
        let by_platform = self.by_platform.load();
        let mut out = Vec::new();
        if let Some(ids) = by_platform.get(&platform) {
            out.extend(ids.iter().filter_map(|id| accounts.get(id).cloned()));
        }
        if mixed
            && platform.supports_mixed_pool()
            && let Some(ids) = by_platform.get(&Platform::Antigravity)
        {
            out.extend(
                ids.iter()
                    .filter_map(|id| accounts.get(id).cloned())
                    .filter(|account| account.mixed_scheduling_enabled),
            );
        }
        out
    }

    /// Live schedulability: snapshot flag, active status, temp-unschedulable
    /// deadline passed. Snapshots can be stale, so layers re-check this
    /// right before acquiring a slot.
    pub async fn is_schedulable(&self, id: AccountId) -> bool {
        let Some(account) = self.account(id) else {
            return false;
        };
        if !account.schedulable {
            return false;
        }
        let states = self.states.read().await;
        match states.get(&id) {
            Some(state) => {
                state.status == AccountStatus::Active
                    && state
                        .temp_unschedulable_until
                        .map(|until| until <= Instant::now())
                        .unwrap_or(true)
            }
            None => false,
        }
    }

    pub async fn is_model_rate_limited(&self, id: AccountId, model: &str) -> bool {
        let limits = self.model_limits.read().await;
        match limits.get(&(id, model.to_string())) {
            Some(until) => *until > Instant::now(),
            None => false,
        }
    }

    pub async fn state(&self, id: AccountId) -> Option<AccountState> {
        self.states.read().await.get(&id).cloned()
    }

    pub async fn last_used(&self, id: AccountId) -> Option<OffsetDateTime> {
        self.states
            .read()
            .await
            .get(&id)
            .and_then(|state| state.last_used_at)
    }

    pub async fn touch_last_used(&self, id: AccountId, at: OffsetDateTime) {
        if let Some(state) = self.states.write().await.get_mut(&id) {
            state.last_used_at = Some(at);
        }
    }

    pub async fn set_temp_unschedulable(&self, id: AccountId, duration: Duration) {
        let _serial = self.mutation_lock(id).await;
        let until = Instant::now() + duration;
        if let Some(state) = self.states.write().await.get_mut(&id) {
            state.temp_unschedulable_until = Some(until);
        }
        self.recover_queue.push(until, id).await;
    }

    pub async fn mark_error(&self, id: AccountId) {
        let _serial = self.mutation_lock(id).await;
        if let Some(state) = self.states.write().await.get_mut(&id) {
            state.status = AccountStatus::Error;
        }
    }

    pub async fn reactivate(&self, id: AccountId) {
        let _serial = self.mutation_lock(id).await;
        if let Some(state) = self.states.write().await.get_mut(&id) {
            state.status = AccountStatus::Active;
            state.temp_unschedulable_until = None;
        }
    }

    pub async fn rate_limit_model(&self, id: AccountId, model: &str, duration: Duration) {
        let until = Instant::now() + duration;
        let key = (id, model.to_string());
        self.model_limits.write().await.insert(key.clone(), until);
        self.model_recover_queue.push(until, key).await;
    }

    /// Stream idle-timeouts count against the model, not the whole account.
    pub async fn note_stream_timeout(&self, id: AccountId, model: &str) -> FailureDisposition {
        self.rate_limit_model(id, model, Duration::from_secs(STREAM_TIMEOUT_COOLDOWN_SECS))
            .await;
        FailureDisposition {
            model_rate_limited: true,
            account_unschedulable: false,
        }
    }

    /// Rate-limit service entry point: translate an upstream failure status
    /// into account-health mutations.
    pub async fn note_upstream_failure(
        &self,
        id: AccountId,
        model: Option<&str>,
        status: u16,
        retry_after: Option<Duration>,
    ) -> FailureDisposition {
        match status {
            429 => {
                let duration =
                    retry_after.unwrap_or(Duration::from_secs(RATE_LIMIT_FALLBACK_SECS));
                match model {
                    Some(model) => {
                        self.rate_limit_model(id, model, duration).await;
                        FailureDisposition {
                            model_rate_limited: true,
                            account_unschedulable: false,
                        }
                    }
                    None => {
                        self.set_temp_unschedulable(id, duration).await;
                        FailureDisposition {
                            model_rate_limited: false,
                            account_unschedulable: true,
                        }
                    }
                }
            }
            401 | 403 => {
                self.mark_error(id).await;
                FailureDisposition {
                    model_rate_limited: false,
                    account_unschedulable: true,
                }
            }
            529 => {
                self.set_temp_unschedulable(id, Duration::from_secs(SHORT_COOLDOWN_SECS))
                    .await;
                FailureDisposition {
                    model_rate_limited: false,
                    account_unschedulable: true,
                }
            }
            status if (500..600).contains(&status) => {
                self.set_temp_unschedulable(id, Duration::from_secs(SHORT_COOLDOWN_SECS))
                    .await;
                FailureDisposition {
                    model_rate_limited: false,
                    account_unschedulable: true,
                }
            }
            _ => FailureDisposition::default(),
        }
    }

    async fn mutation_lock(&self, id: AccountId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.mutation_locks.lock().await;
            locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subgate_common::AccountKind;

    fn test_account(id: AccountId, platform: Platform) -> Account {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("acct-{id}"),
            "platform": platform.as_str(),
            "kind": "oauth",
            "priority": 10,
            "concurrency": 2,
            "schedulable": true,
            "status": "active",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn temp_unschedulable_recovers() {
        let registry = AccountRegistry::new();
        registry
            .load_accounts(vec![test_account(1, Platform::Anthropic)])
            .await;
        assert!(registry.is_schedulable(1).await);

        registry
            .set_temp_unschedulable(1, Duration::from_millis(40))
            .await;
        assert!(!registry.is_schedulable(1).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(registry.is_schedulable(1).await);
        // The recovery drain also clears the deadline field.
        let state = registry.state(1).await.unwrap();
        assert!(state.temp_unschedulable_until.is_none());
    }

    #[tokio::test]
    async fn model_rate_limit_is_scoped() {
        let registry = AccountRegistry::new();
        registry
            .load_accounts(vec![test_account(1, Platform::Anthropic)])
            .await;
        registry
            .rate_limit_model(1, "claude-sonnet-4-5", Duration::from_secs(30))
            .await;
        assert!(registry.is_model_rate_limited(1, "claude-sonnet-4-5").await);
        assert!(!registry.is_model_rate_limited(1, "claude-haiku-4-5").await);
        assert!(registry.is_schedulable(1).await);
    }

    #[tokio::test]
    async fn mixed_pool_requires_the_flag() {
        let registry = AccountRegistry::new();
        let mut anti = test_account(2, Platform::Antigravity);
        anti.mixed_scheduling_enabled = true;
        let plain_anti = test_account(3, Platform::Antigravity);
        registry
            .load_accounts(vec![test_account(1, Platform::Anthropic), anti, plain_anti])
            .await;

        let mixed: Vec<AccountId> = registry
            .platform_candidates(Platform::Anthropic, true)
            .iter()
            .map(|a| a.id)
            .collect();
        assert!(mixed.contains(&1));
        assert!(mixed.contains(&2));
        assert!(!mixed.contains(&3));

        let forced: Vec<AccountId> = registry
            .platform_candidates(Platform::Anthropic, false)
            .iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(forced, vec![1]);
    }

    #[tokio::test]
    async fn auth_failure_flips_status_to_error() {
        let registry = AccountRegistry::new();
        registry
            .load_accounts(vec![test_account(1, Platform::Anthropic)])
            .await;
        let disposition = registry.note_upstream_failure(1, None, 401, None).await;
        assert!(disposition.account_unschedulable);
        assert!(!registry.is_schedulable(1).await);
        assert_eq!(
            registry.state(1).await.unwrap().status,
            AccountStatus::Error
        );
    }

    #[tokio::test]
    async fn rate_limited_429_with_model_is_model_scoped() {
        let registry = AccountRegistry::new();
        registry
            .load_accounts(vec![test_account(1, Platform::Anthropic)])
            .await;
        let disposition = registry
            .note_upstream_failure(1, Some("claude-sonnet-4-5"), 429, None)
            .await;
        assert!(disposition.model_rate_limited);
        assert!(registry.is_model_rate_limited(1, "claude-sonnet-4-5").await);
        assert!(registry.is_schedulable(1).await);
    }

    #[test]
    fn account_kind_discrimination() {
        assert!(AccountKind::SetupToken.is_oauth());
        assert!(!AccountKind::ApiKey.is_oauth());
    }
}
