//! Work queue with per-key serialization
//!
//! A key is never handed to two workers at once: adds that arrive while the
//! key is being processed are parked and re-queued when the worker calls
//! [`WorkQueue::done`]. Keys already waiting are not duplicated.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::ObjectKey;

/// Exponential per-key retry delay: `base * 2^failures`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `failures` (0-based)
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }

        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }

        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Record a failure for `key` and enqueue it after its backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let delay = {
            let mut state = self.state();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };

        debug!(key = %key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count for `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.state().failures.remove(key);
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` after shutdown once the queue is drained.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            // Registered before the state check so a shutdown in between still wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as finished; re-queues it if it was added while active
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake idle workers
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(200), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_collapsed() {
        let queue = WorkQueue::new(BackoffPolicy::default());
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_active_key_is_not_handed_out_twice() {
        let queue = WorkQueue::new(BackoffPolicy::default());
        queue.add(key("a"));
        let first = queue.next().await.unwrap();

        // Re-added while in flight: parked, not pending
        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&first);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_done_without_readd_leaves_queue_empty() {
        let queue = WorkQueue::new(BackoffPolicy::default());
        queue.add(key("a"));
        let k = queue.next().await.unwrap();
        queue.done(&k);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = WorkQueue::new(BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
        ));

        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(100));
        assert_eq!(queue.add_rate_limited(key("a")), Duration::from_millis(200));
        assert_eq!(queue.failures(&key("a")), 2);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(queue.next().await, Some(key("a")));

        queue.forget(&key("a"));
        assert_eq!(queue.failures(&key("a")), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_worker() {
        let queue = WorkQueue::new(BackoffPolicy::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.shutdown();
        queue.add(key("ignored"));
        assert_eq!(waiter.await.unwrap(), None);
    }
}
