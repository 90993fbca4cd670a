use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use time::OffsetDateTime;
use tracing::debug;

use subgate_common::{
    AccountId, FallbackOrder, GroupId, Platform, SchedulerConfig, debug_model_routing,
};

use crate::account::{Account, Group};
use crate::limits::{SessionAdmission, SessionLimitGate, WindowCostDecision, WindowCostGate};
use crate::pool::{AccountLoad, ConcurrencyPool, SlotGuard};
use crate::registry::AccountRegistry;
use crate::session::SessionStore;

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user_agent: Option<String>,
    pub has_metadata_user_id: bool,
}

/// One scheduling question: pick an upstream account for this request.
#[derive(Debug, Clone, Default)]
pub struct ScheduleRequest {
    pub group_id: Option<GroupId>,
    pub session_hash: Option<String>,
    pub model: Option<String>,
    /// Accounts already tried (and failed) within this client request.
    pub excluded: HashSet<AccountId>,
    /// Set when the route itself names a platform; bypasses mixed pooling.
    pub forced_platform: Option<Platform>,
    pub client: ClientInfo,
}

#[derive(Debug)]
pub struct Acquired {
    pub account: Arc<Account>,
    pub slot: SlotGuard,
    /// The pick honored an existing sticky binding.
    pub sticky: bool,
}

#[derive(Debug)]
pub struct WaitPlan {
    pub account: Arc<Account>,
    pub timeout: Duration,
    pub max_waiting: usize,
    pub sticky: bool,
}

#[derive(Debug)]
pub enum Selection {
    Acquired(Acquired),
    Wait(WaitPlan),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("no available accounts")]
    NoAvailableAccounts,
    #[error("group requires a claude code client")]
    ClaudeCodeOnly,
    #[error("fallback group cycle detected")]
    FallbackCycle,
}

/// `claude-cli/<semver>` user agent plus a metadata user id marks the real
/// CLI; everything else is a third-party client.
pub fn is_claude_cli_client(user_agent: Option<&str>, has_metadata_user_id: bool) -> bool {
    if !has_metadata_user_id {
        return false;
    }
    let Some(rest) = user_agent.and_then(|ua| ua.strip_prefix("claude-cli/")) else {
        return false;
    };
    let mut parts = rest.split('.');
    let major_minor_ok = parts
        .by_ref()
        .take(2)
        .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        .count()
        == 2;
    let patch_ok = parts
        .next()
        .map(|part| part.bytes().take_while(u8::is_ascii_digit).count() > 0)
        .unwrap_or(false);
    major_minor_ok && patch_ok
}

/// Layered account selection: model routing → sticky session → load-aware →
/// fallback queue, over a candidate pool filtered by live schedulability,
/// model support, model-scope rate limits and window cost.
pub struct Scheduler {
    registry: Arc<AccountRegistry>,
    pool: Arc<ConcurrencyPool>,
    sessions: Arc<SessionStore>,
    window_gate: Arc<WindowCostGate>,
    session_gate: Arc<SessionLimitGate>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AccountRegistry>,
        pool: Arc<ConcurrencyPool>,
        sessions: Arc<SessionStore>,
        window_gate: Arc<WindowCostGate>,
        session_gate: Arc<SessionLimitGate>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            sessions,
            window_gate,
            session_gate,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<ConcurrencyPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Drive [`Scheduler::select`] to a held slot: wait plans are honored
    /// against the pool, and wait timeouts / over-limit admissions push the
    /// account into the exclusion set before re-selecting.
    pub async fn schedule(&self, req: &ScheduleRequest) -> Result<Acquired, ScheduleError> {
        let mut req = req.clone();
        loop {
            match self.select(&req).await? {
                Selection::Acquired(acquired) => return Ok(acquired),
                Selection::Wait(plan) => {
                    let account = plan.account.clone();
                    let outcome = self
                        .pool
                        .wait_for_slot(
                            account.id,
                            account.concurrency,
                            plan.timeout,
                            plan.max_waiting,
                        )
                        .await;
                    match outcome {
                        Ok(slot) => {
                            let group_id = req.group_id;
                            let hash = req.session_hash.clone().unwrap_or_default();
                            match self.admit(&account, group_id, &hash, slot, plan.sticky).await {
                                Some(acquired) => return Ok(acquired),
                                None => {
                                    req.excluded.insert(account.id);
                                }
                            }
                        }
                        Err(_) => {
                            req.excluded.insert(account.id);
                        }
                    }
                }
            }
        }
    }

    /// One selection pass. Returns a held slot or a wait plan; never blocks
    /// on slot availability itself.
    pub async fn select(&self, req: &ScheduleRequest) -> Result<Selection, ScheduleError> {
        let group = self.resolve_group(req)?;
        let platform = req
            .forced_platform
            .or(group.as_ref().map(|g| g.platform))
            .unwrap_or(Platform::Anthropic);
        let mixed = req.forced_platform.is_none() && platform.supports_mixed_pool();
        let group_id = group.as_ref().map(|g| g.id);
        let session_hash = req.session_hash.clone().unwrap_or_default();

        let mut candidates = Vec::new();
        for account in self.registry.platform_candidates(platform, mixed) {
            if req.excluded.contains(&account.id) {
                continue;
            }
            // Snapshot staleness tolerance: re-check live state here.
            if !self.registry.is_schedulable(account.id).await {
                continue;
            }
            if let Some(model) = req.model.as_deref() {
                if !account.supports_model(model) {
                    continue;
                }
                if self.registry.is_model_rate_limited(account.id, model).await {
                    continue;
                }
            }
            candidates.push(account);
        }
        if candidates.is_empty() {
            return Err(ScheduleError::NoAvailableAccounts);
        }

        let window = self.window_gate.decisions(&candidates).await;
        candidates.retain(|account| {
            window
                .get(&account.id)
                .map(WindowCostDecision::allows_sticky)
                .unwrap_or(true)
        });
        if candidates.is_empty() {
            return Err(ScheduleError::NoAvailableAccounts);
        }

        // Session-limit rejections within this pass.
        let mut rejected: HashSet<AccountId> = HashSet::new();

        // Layer 1: group model routing (anthropic groups only).
        let mut routing_applied = false;
        if platform == Platform::Anthropic
            && let Some(group) = group.as_deref()
            && let Some(model) = req.model.as_deref()
            && let Some(routed_ids) = group.routed_accounts(model)
        {
            routing_applied = true;
            if let Some(selection) = self
                .select_routed(
                    group_id,
                    routed_ids,
                    &candidates,
                    &window,
                    &session_hash,
                    req.model.as_deref(),
                    &mut rejected,
                )
                .await?
            {
                return Ok(selection);
            }
            if debug_model_routing() {
                debug!(group = group.id, model, "model routing set fully filtered; falling through");
            }
        }

        // Layer 1.5: sticky session, only when no routing applies.
        if !routing_applied
            && !session_hash.is_empty()
            && let Some(selection) = self
                .select_sticky(group_id, &candidates, &session_hash, req.model.as_deref())
                .await?
        {
            return Ok(selection);
        }

        // Layer 2: load-aware selection.
        if let Some(selection) = self
            .select_load_aware(group_id, platform, &candidates, &window, &session_hash, &mut rejected)
            .await
        {
            return Ok(selection);
        }

        // Layer 3: fallback wait queue.
        self.select_fallback(&candidates, &window, &session_hash, &rejected)
            .await
    }

    fn resolve_group(&self, req: &ScheduleRequest) -> Result<Option<Arc<Group>>, ScheduleError> {
        let Some(mut id) = req.group_id else {
            return Ok(None);
        };
        let claude_cli = is_claude_cli_client(
            req.client.user_agent.as_deref(),
            req.client.has_metadata_user_id,
        );
        let mut visited = HashSet::new();
        loop {
            if !visited.insert(id) {
                return Err(ScheduleError::FallbackCycle);
            }
            let Some(group) = self.registry.group(id) else {
                return Ok(None);
            };
            if group.claude_code_only && !claude_cli {
                match group.fallback_group_id {
                    Some(next) => {
                        id = next;
                        continue;
                    }
                    None => return Err(ScheduleError::ClaudeCodeOnly),
                }
            }
            return Ok(Some(group));
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn select_routed(
        &self,
        group_id: Option<GroupId>,
        routed_ids: &[AccountId],
        candidates: &[Arc<Account>],
        window: &HashMap<AccountId, WindowCostDecision>,
        session_hash: &str,
        model: Option<&str>,
        rejected: &mut HashSet<AccountId>,
    ) -> Result<Option<Selection>, ScheduleError> {
        let routed: Vec<Arc<Account>> = candidates
            .iter()
            .filter(|account| routed_ids.contains(&account.id))
            .cloned()
            .collect();
        if routed.is_empty() {
            return Ok(None);
        }

        // Sticky binding inside the routed set keeps its pin.
        if !session_hash.is_empty() {
            if let Some(bound) = self.sessions.bound_account(group_id, session_hash).await {
                if let Some(account) = routed.iter().find(|a| a.id == bound) {
                    return Ok(Some(
                        self.acquire_or_wait_sticky(group_id, account, session_hash)
                            .await,
                    ));
                }
                self.maybe_evict_sticky(group_id, session_hash, bound, model)
                    .await;
            }
        }

        let fresh: Vec<Arc<Account>> = routed
            .iter()
            .filter(|account| {
                window
                    .get(&account.id)
                    .map(WindowCostDecision::allows_fresh)
                    .unwrap_or(true)
                    && !rejected.contains(&account.id)
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(None);
        }

        let loads = self.load_map(&fresh);
        let ordered = self.order_candidates(fresh, &loads, None).await;
        for account in &ordered {
            if !self.registry.is_schedulable(account.id).await {
                continue;
            }
            if let Some(slot) = self.pool.try_acquire(account.id, account.concurrency) {
                match self.admit(account, group_id, session_hash, slot, false).await {
                    Some(acquired) => return Ok(Some(Selection::Acquired(acquired))),
                    None => {
                        rejected.insert(account.id);
                        continue;
                    }
                }
            }
        }

        // Every routed slot is busy: queue on the least-loaded one.
        let lowest = ordered
            .iter()
            .filter(|account| !rejected.contains(&account.id))
            .min_by_key(|account| loads.get(&account.id).map(|l| l.load_rate).unwrap_or(100));
        if let Some(account) = lowest {
            if self.session_gate.register(account, session_hash).await
                == SessionAdmission::Admitted
            {
                return Ok(Some(Selection::Wait(WaitPlan {
                    account: account.clone(),
                    timeout: self.config.fallback_wait_timeout,
                    max_waiting: self.config.fallback_max_waiting,
                    sticky: false,
                })));
            }
            rejected.insert(account.id);
        }
        Ok(None)
    }

    async fn select_sticky(
        &self,
        group_id: Option<GroupId>,
        candidates: &[Arc<Account>],
        session_hash: &str,
        model: Option<&str>,
    ) -> Result<Option<Selection>, ScheduleError> {
        let Some(bound) = self.sessions.bound_account(group_id, session_hash).await else {
            return Ok(None);
        };
        match candidates.iter().find(|account| account.id == bound) {
            Some(account) => Ok(Some(
                self.acquire_or_wait_sticky(group_id, account, session_hash)
                    .await,
            )),
            None => {
                self.maybe_evict_sticky(group_id, session_hash, bound, model)
                    .await;
                Ok(None)
            }
        }
    }

    /// The sticky account is schedulable: return it, either with a held
    /// slot or as a bounded wait plan. Never a different account.
    async fn acquire_or_wait_sticky(
        &self,
        group_id: Option<GroupId>,
        account: &Arc<Account>,
        session_hash: &str,
    ) -> Selection {
        if let Some(slot) = self.pool.try_acquire(account.id, account.concurrency)
            && let Some(acquired) = self.admit(account, group_id, session_hash, slot, true).await
        {
            return Selection::Acquired(acquired);
        }
        Selection::Wait(WaitPlan {
            account: account.clone(),
            timeout: self.config.sticky_wait_timeout,
            max_waiting: self.config.sticky_max_waiting,
            sticky: true,
        })
    }

    /// Drop a sticky binding whose account can no longer serve it.
    async fn maybe_evict_sticky(
        &self,
        group_id: Option<GroupId>,
        session_hash: &str,
        bound: AccountId,
        model: Option<&str>,
    ) {
        let unschedulable = !self.registry.is_schedulable(bound).await;
        let model_limited = match model {
            Some(model) => self.registry.is_model_rate_limited(bound, model).await,
            None => false,
        };
        if unschedulable || model_limited {
            self.sessions.unbind(group_id, session_hash).await;
        }
    }

    async fn select_load_aware(
        &self,
        group_id: Option<GroupId>,
        platform: Platform,
        candidates: &[Arc<Account>],
        window: &HashMap<AccountId, WindowCostDecision>,
        session_hash: &str,
        rejected: &mut HashSet<AccountId>,
    ) -> Option<Selection> {
        let fresh: Vec<Arc<Account>> = candidates
            .iter()
            .filter(|account| {
                window
                    .get(&account.id)
                    .map(WindowCostDecision::allows_fresh)
                    .unwrap_or(true)
                    && !rejected.contains(&account.id)
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            return None;
        }

        let loads = self.load_map(&fresh);
        let open: Vec<Arc<Account>> = fresh
            .into_iter()
            .filter(|account| {
                loads
                    .get(&account.id)
                    .map(|load| load.load_rate < 100)
                    .unwrap_or(false)
            })
            .collect();
        if open.is_empty() {
            return None;
        }

        let ordered = self.order_candidates(open, &loads, Some(platform)).await;
        for account in &ordered {
            if !self.registry.is_schedulable(account.id).await {
                continue;
            }
            let Some(slot) = self.pool.try_acquire(account.id, account.concurrency) else {
                continue;
            };
            match self.admit(account, group_id, session_hash, slot, false).await {
                Some(acquired) => return Some(Selection::Acquired(acquired)),
                None => {
                    rejected.insert(account.id);
                }
            }
        }
        None
    }

    async fn select_fallback(
        &self,
        candidates: &[Arc<Account>],
        window: &HashMap<AccountId, WindowCostDecision>,
        session_hash: &str,
        rejected: &HashSet<AccountId>,
    ) -> Result<Selection, ScheduleError> {
        let mut pool: Vec<Arc<Account>> = candidates
            .iter()
            .filter(|account| {
                window
                    .get(&account.id)
                    .map(WindowCostDecision::allows_fresh)
                    .unwrap_or(true)
                    && !rejected.contains(&account.id)
            })
            .cloned()
            .collect();
        if pool.is_empty() {
            return Err(ScheduleError::NoAvailableAccounts);
        }

        match self.config.fallback_order {
            FallbackOrder::LastUsed => {
                let mut keyed = Vec::with_capacity(pool.len());
                for account in pool {
                    let last_used = self.registry.last_used(account.id).await;
                    keyed.push((last_used, account));
                }
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                pool = keyed.into_iter().map(|(_, account)| account).collect();
            }
            FallbackOrder::Random => {
                pool.shuffle(&mut rand::rng());
            }
        }

        for account in pool {
            // The session seat is claimed before the wait plan is handed
            // out, so a full queue cannot oversubscribe the cap.
            if self.session_gate.register(&account, session_hash).await
                == SessionAdmission::Admitted
            {
                return Ok(Selection::Wait(WaitPlan {
                    account,
                    timeout: self.config.fallback_wait_timeout,
                    max_waiting: self.config.fallback_max_waiting,
                    sticky: false,
                }));
            }
        }
        Err(ScheduleError::NoAvailableAccounts)
    }

    /// Post-acquire admission: session-limit check, then sticky binding.
    /// On rejection the slot is released and the caller excludes the
    /// account.
    async fn admit(
        &self,
        account: &Arc<Account>,
        group_id: Option<GroupId>,
        session_hash: &str,
        slot: SlotGuard,
        sticky: bool,
    ) -> Option<Acquired> {
        match self.session_gate.register(account, session_hash).await {
            SessionAdmission::Admitted => {
                self.sessions.bind(group_id, session_hash, account.id).await;
                Some(Acquired {
                    account: account.clone(),
                    slot,
                    sticky,
                })
            }
            SessionAdmission::OverLimit => {
                slot.release();
                None
            }
        }
    }

    fn load_map(&self, accounts: &[Arc<Account>]) -> HashMap<AccountId, AccountLoad> {
        let caps: Vec<(AccountId, u32)> = accounts
            .iter()
            .map(|account| (account.id, account.concurrency))
            .collect();
        self.pool.batch_load(&caps)
    }

    /// Three-key sort (priority ↑, load ↑, last-used ↑) with a fair shuffle
    /// inside each equivalence class, plus the optional OAuth preference on
    /// gemini pools.
    async fn order_candidates(
        &self,
        accounts: Vec<Arc<Account>>,
        loads: &HashMap<AccountId, AccountLoad>,
        platform: Option<Platform>,
    ) -> Vec<Arc<Account>> {
        #[derive(Clone)]
        struct Entry {
            account: Arc<Account>,
            key: (i32, u32, Option<OffsetDateTime>),
        }

        let mut entries = Vec::with_capacity(accounts.len());
        for account in accounts {
            let load = loads
                .get(&account.id)
                .map(|l| l.load_rate)
                .unwrap_or(100);
            let last_used = self.registry.last_used(account.id).await;
            entries.push(Entry {
                key: (account.priority, load, last_used),
                account,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        // Shuffle each equal-key run to spread load across twins.
        let mut rng = rand::rng();
        let prefer_oauth =
            platform == Some(Platform::Gemini) && self.config.gemini_prefer_oauth;
        let mut start = 0;
        while start < entries.len() {
            let mut end = start + 1;
            while end < entries.len() && entries[end].key == entries[start].key {
                end += 1;
            }
            entries[start..end].shuffle(&mut rng);
            if prefer_oauth {
                entries[start..end].sort_by_key(|entry| !entry.account.is_oauth());
            }
            start = end;
        }

        entries.into_iter().map(|entry| entry.account).collect()
    }
}
