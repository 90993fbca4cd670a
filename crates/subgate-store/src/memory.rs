use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::{CacheError, CacheResult, CacheStore, SetMemberOutcome};

#[derive(Debug)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-process cache backend. Expiry is lazy: entries are dropped when the
/// key (or set) is next touched. Good enough for tests and single-node
/// deployments; multi-node setups plug a shared backend into the same trait.
#[derive(Debug, Default)]
pub struct MemoryCache {
    values: Mutex<HashMap<String, ValueEntry>>,
    sets: Mutex<HashMap<String, HashMap<String, Instant>>>,
    /// When set, every call fails; used to exercise fail-open paths.
    poisoned: std::sync::atomic::AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poison(&self) {
        self.poisoned
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    fn check(&self) -> CacheResult<()> {
        if self.poisoned.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CacheError::Backend("memory cache poisoned".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let mut values = self.values.lock().await;
        match values.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        let entry = ValueEntry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.values.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.check()?;
        self.values.lock().await.remove(key);
        self.sets.lock().await.remove(key);
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        self.check()?;
        let now = Instant::now();
        let mut values = self.values.lock().await;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let hit = match values.get(key) {
                Some(entry) if entry.live(now) => Some(entry.value.clone()),
                Some(_) => {
                    values.remove(key);
                    None
                }
                None => None,
            };
            out.push(hit);
        }
        Ok(out)
    }

    async fn add_set_member(
        &self,
        key: &str,
        member: &str,
        idle: Duration,
    ) -> CacheResult<SetMemberOutcome> {
        self.check()?;
        let now = Instant::now();
        let mut sets = self.sets.lock().await;
        let set = sets.entry(key.to_string()).or_default();
        set.retain(|_, deadline| *deadline > now);
        let inserted = set.insert(member.to_string(), now + idle).is_none();
        Ok(SetMemberOutcome {
            members: set.len(),
            inserted,
        })
    }

    async fn remove_set_member(&self, key: &str, member: &str) -> CacheResult<()> {
        self.check()?;
        if let Some(set) = self.sets.lock().await.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }
}
