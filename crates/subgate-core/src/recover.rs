use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};

/// Deadline-ordered recovery queue: keys pushed with an expiry are handed to
/// the drain callback once the deadline passes. Used for restoring
/// temp-unschedulable accounts and model-scope rate limits.
///
/// Entries are not deduplicated; drains must re-check live state, so a stale
/// entry for an extended deadline is harmless.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    heap: Mutex<BinaryHeap<Reverse<(Instant, K)>>>,
    notify: Notify,
}

impl<K> DeadlineQueue<K>
where
    K: Ord + Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        })
    }

    pub async fn push(&self, until: Instant, key: K) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, key)));
        }
        // Always notify: the drain task re-computes the next deadline.
        self.notify.notify_one();
    }

    /// Spawn the background drain. `on_due` receives every key whose
    /// deadline has passed; it is responsible for guarding against stale
    /// entries.
    pub fn spawn_drain<F, Fut>(self: Arc<Self>, mut on_due: F)
    where
        F: FnMut(Vec<K>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, _))| *t)
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some(deadline) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            // An earlier deadline may have been pushed.
                            _ = self.notify.notified() => continue,
                        }
                    }
                }

                let now = Instant::now();
                let due = {
                    let mut heap = self.heap.lock().await;
                    let mut due = Vec::new();
                    while let Some(Reverse((t, _))) = heap.peek()
                        && *t <= now
                    {
                        let Some(Reverse((_, key))) = heap.pop() else {
                            break;
                        };
                        due.push(key);
                    }
                    due
                };

                if !due.is_empty() {
                    on_due(due).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drains_in_deadline_order() {
        let queue: Arc<DeadlineQueue<i64>> = DeadlineQueue::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        queue.clone().spawn_drain(move |due| {
            let tx = tx.clone();
            async move {
                for key in due {
                    let _ = tx.send(key);
                }
            }
        });

        let now = Instant::now();
        queue.push(now + Duration::from_millis(60), 2).await;
        queue.push(now + Duration::from_millis(20), 1).await;

        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, 1);
        let second = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, 2);
    }
}
