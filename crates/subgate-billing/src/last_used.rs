use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::warn;

use subgate_common::AccountId;
use subgate_core::AccountRegistry;

/// Persistence half of the last-used bookkeeping; the in-memory half lives
/// in the registry.
#[async_trait]
pub trait AccountTouchStore: Send + Sync {
    async fn touch_accounts(&self, updates: &[(AccountId, OffsetDateTime)]);
}

/// No-op store for deployments that only need the in-memory ordering.
pub struct NullTouchStore;

#[async_trait]
impl AccountTouchStore for NullTouchStore {
    async fn touch_accounts(&self, _updates: &[(AccountId, OffsetDateTime)]) {}
}

/// Batches `LastUsedAt` updates: every successful forward notes its account
/// here; a background task flushes the newest timestamp per account on an
/// interval instead of writing one row per request.
pub struct LastUsedBatcher {
    registry: Arc<AccountRegistry>,
    store: Arc<dyn AccountTouchStore>,
    pending: Arc<Mutex<HashMap<AccountId, OffsetDateTime>>>,
}

impl LastUsedBatcher {
    pub fn new(registry: Arc<AccountRegistry>, store: Arc<dyn AccountTouchStore>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) {
        let batcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                batcher.flush().await;
            }
        });
    }

    /// The in-memory registry is updated immediately (the scheduler sorts
    /// on it); persistence waits for the next flush.
    pub async fn note(&self, account: AccountId) {
        let now = OffsetDateTime::now_utc();
        self.registry.touch_last_used(account, now).await;
        self.pending.lock().await.insert(account, now);
    }

    pub async fn flush(&self) {
        let updates: Vec<(AccountId, OffsetDateTime)> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        if updates.is_empty() {
            return;
        }
        self.store.touch_accounts(&updates).await;
    }
}

impl Drop for LastUsedBatcher {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.try_lock()
            && !pending.is_empty()
        {
            warn!(count = pending.len(), "dropping unflushed last-used updates");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingStore(StdMutex<Vec<Vec<AccountId>>>);

    #[async_trait]
    impl AccountTouchStore for RecordingStore {
        async fn touch_accounts(&self, updates: &[(AccountId, OffsetDateTime)]) {
            let mut ids: Vec<AccountId> = updates.iter().map(|(id, _)| *id).collect();
            ids.sort();
            self.0.lock().unwrap().push(ids);
        }
    }

    fn account(id: AccountId) -> subgate_core::Account {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": format!("acct-{id}"),
            "platform": "anthropic",
            "kind": "oauth",
            "priority": 10,
            "concurrency": 4,
            "schedulable": true,
            "status": "active",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn notes_coalesce_into_one_flush() {
        let registry = AccountRegistry::new();
        registry.load_accounts(vec![account(1), account(2)]).await;
        let store = Arc::new(RecordingStore(StdMutex::new(Vec::new())));
        let batcher = LastUsedBatcher::new(registry.clone(), store.clone());

        batcher.note(1).await;
        batcher.note(2).await;
        batcher.note(1).await;
        // Registry sees the update immediately.
        assert!(registry.last_used(1).await.is_some());

        batcher.flush().await;
        let flushes = store.0.lock().unwrap().clone();
        assert_eq!(flushes, vec![vec![1, 2]]);

        // Nothing pending: flush is a no-op.
        batcher.flush().await;
        assert_eq!(store.0.lock().unwrap().len(), 1);
    }
}
