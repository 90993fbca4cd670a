use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use subgate_common::AccountId;

type SlotTable = Arc<Mutex<HashMap<AccountId, AccountSlots>>>;

#[derive(Debug, Default)]
struct AccountSlots {
    in_flight: u32,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<SlotGuard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLoad {
    pub in_flight: u32,
    /// 0..=100; saturates at 100 when at or over capacity.
    pub load_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("slot wait queue is full")]
    QueueFull,
    #[error("timed out waiting for a slot")]
    Timeout,
}

/// Per-account in-flight slot accounting with an ordered wait queue.
///
/// A freed slot is handed directly to the oldest live waiter instead of
/// being returned to the pool, so waiters are served FIFO and cannot be
/// starved by fresh arrivals.
#[derive(Debug, Default)]
pub struct ConcurrencyPool {
    slots: SlotTable,
}

impl ConcurrencyPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking acquire. `cap` comes from the account snapshot at call
    /// time so concurrency edits apply to new requests immediately.
    pub fn try_acquire(&self, account: AccountId, cap: u32) -> Option<SlotGuard> {
        if cap == 0 {
            return None;
        }
        let mut table = lock(&self.slots);
        let slots = table.entry(account).or_default();
        if slots.in_flight >= cap {
            return None;
        }
        slots.in_flight += 1;
        Some(SlotGuard::new(self.slots.clone(), account))
    }

    /// Honor a scheduler wait plan: join the FIFO queue (bounded by
    /// `max_waiting`) and wait up to `timeout` for a handoff.
    pub async fn wait_for_slot(
        &self,
        account: AccountId,
        cap: u32,
        timeout: Duration,
        max_waiting: usize,
    ) -> Result<SlotGuard, WaitError> {
        let (waiter_id, rx) = {
            let mut table = lock(&self.slots);
            let slots = table.entry(account).or_default();
            if slots.in_flight < cap && slots.waiters.is_empty() {
                slots.in_flight += 1;
                return Ok(SlotGuard::new(self.slots.clone(), account));
            }
            if slots.waiters.len() >= max_waiting {
                return Err(WaitError::QueueFull);
            }
            let id = slots.next_waiter_id;
            slots.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            slots.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(guard)) => Ok(guard),
            // Sender dropped: the account entry vanished underneath us.
            Ok(Err(_)) => Err(WaitError::Timeout),
            Err(_) => {
                let mut table = lock(&self.slots);
                if let Some(slots) = table.get_mut(&account) {
                    slots.waiters.retain(|w| w.id != waiter_id);
                }
                Err(WaitError::Timeout)
            }
        }
    }

    pub fn waiting_count(&self, account: AccountId) -> usize {
        lock(&self.slots)
            .get(&account)
            .map(|slots| slots.waiters.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, account: AccountId) -> u32 {
        lock(&self.slots)
            .get(&account)
            .map(|slots| slots.in_flight)
            .unwrap_or(0)
    }

    /// One locked pass over the table for the scheduler's load sort.
    pub fn batch_load(&self, accounts: &[(AccountId, u32)]) -> HashMap<AccountId, AccountLoad> {
        let table = lock(&self.slots);
        let mut out = HashMap::with_capacity(accounts.len());
        for (id, cap) in accounts {
            let in_flight = table.get(id).map(|slots| slots.in_flight).unwrap_or(0);
            out.insert(
                *id,
                AccountLoad {
                    in_flight,
                    load_rate: load_rate(in_flight, *cap),
                },
            );
        }
        out
    }
}

fn load_rate(in_flight: u32, cap: u32) -> u32 {
    if cap == 0 {
        return 100;
    }
    ((in_flight as u64 * 100) / cap as u64).min(100) as u32
}

fn lock(table: &SlotTable) -> std::sync::MutexGuard<'_, HashMap<AccountId, AccountSlots>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases its slot exactly once: explicitly via [`SlotGuard::release`] or
/// implicitly on drop, whichever comes first.
#[derive(Debug)]
pub struct SlotGuard {
    table: SlotTable,
    account: AccountId,
    released: AtomicBool,
}

impl SlotGuard {
    fn new(table: SlotTable, account: AccountId) -> Self {
        Self {
            table,
            account,
            released: AtomicBool::new(false),
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        release_slot(&self.table, self.account);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn release_slot(table: &SlotTable, account: AccountId) {
    let mut guard = lock(table);
    let Some(slots) = guard.get_mut(&account) else {
        return;
    };
    // Hand the slot to the oldest waiter whose receiver is still alive.
    while let Some(waiter) = slots.waiters.pop_front() {
        let handoff = SlotGuard::new(table.clone(), account);
        match waiter.tx.send(handoff) {
            Ok(()) => return,
            Err(dead) => {
                // Receiver gone (timed out between queue removal races).
                // Disarm the guard while the table lock is held to avoid
                // re-entrant release.
                dead.released.store(true, Ordering::Release);
            }
        }
    }
    slots.in_flight = slots.in_flight.saturating_sub(1);
    if slots.in_flight == 0 && slots.waiters.is_empty() {
        guard.remove(&account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_respects_capacity() {
        let pool = ConcurrencyPool::new();
        let a = pool.try_acquire(1, 2).unwrap();
        let _b = pool.try_acquire(1, 2).unwrap();
        assert!(pool.try_acquire(1, 2).is_none());

        drop(a);
        assert!(pool.try_acquire(1, 2).is_some());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = ConcurrencyPool::new();
        let guard = pool.try_acquire(1, 1).unwrap();
        guard.release();
        guard.release();
        drop(guard);
        assert_eq!(pool.in_flight(1), 0);
        assert!(pool.try_acquire(1, 1).is_some());
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let pool = ConcurrencyPool::new();
        let held = pool.try_acquire(7, 1).unwrap();

        let p1 = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.wait_for_slot(7, 1, Duration::from_secs(1), 4).await
            })
        };
        // Let the first waiter enqueue before the second.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let p2 = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.wait_for_slot(7, 1, Duration::from_secs(1), 4).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.waiting_count(7), 2);

        drop(held);
        let first = p1.await.unwrap().unwrap();
        assert_eq!(pool.waiting_count(7), 1);
        drop(first);
        let _second = p2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_and_leaves_queue() {
        let pool = ConcurrencyPool::new();
        let _held = pool.try_acquire(1, 1).unwrap();
        let err = pool
            .wait_for_slot(1, 1, Duration::from_millis(30), 4)
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout);
        assert_eq!(pool.waiting_count(1), 0);
    }

    #[tokio::test]
    async fn wait_queue_is_bounded() {
        let pool = ConcurrencyPool::new();
        let _held = pool.try_acquire(1, 1).unwrap();
        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.wait_for_slot(1, 1, Duration::from_millis(200), 1).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = pool
            .wait_for_slot(1, 1, Duration::from_millis(50), 1)
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::QueueFull);
        let _ = blocked.await;
    }

    #[tokio::test]
    async fn handoff_skips_dead_waiters() {
        let pool = ConcurrencyPool::new();
        let held = pool.try_acquire(1, 1).unwrap();
        // This waiter gives up before the slot frees.
        let err = pool
            .wait_for_slot(1, 1, Duration::from_millis(20), 4)
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout);
        drop(held);
        assert_eq!(pool.in_flight(1), 0);
    }

    #[test]
    fn load_rate_saturates() {
        assert_eq!(load_rate(0, 4), 0);
        assert_eq!(load_rate(2, 4), 50);
        assert_eq!(load_rate(4, 4), 100);
        assert_eq!(load_rate(9, 4), 100);
        assert_eq!(load_rate(1, 0), 100);
    }

    #[test]
    fn batch_load_reports_per_account() {
        let pool = ConcurrencyPool::new();
        let _a = pool.try_acquire(1, 4).unwrap();
        let _b = pool.try_acquire(1, 4).unwrap();
        let loads = pool.batch_load(&[(1, 4), (2, 2)]);
        assert_eq!(loads[&1].load_rate, 50);
        assert_eq!(loads[&2].load_rate, 0);
    }
}
