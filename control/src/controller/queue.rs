//! Work queue
//!
//! Deduplicating, delayable set of logical keys shared by all workers.
//!
//! A key is in at most one of two places at a time:
//! - `queue`: waiting for a worker (also tracked in `dirty`)
//! - `processing`: handed out by [`WorkQueue::get`], not yet [`WorkQueue::done`]
//!
//! Adding a key that is being processed only marks it dirty; `done` puts it
//! back on the queue. So one key is never reconciled by two workers at once,
//! and an event that arrives mid-reconcile is never lost.

use crate::apis::metrics::{record_queue_add, record_queue_retry, set_queue_depth};
use crate::controller::rate_limiter::{safe_lock, RateLimiter};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    /// Keys waiting for a worker, in arrival order
    queue: VecDeque<String>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<String>,
    /// Keys currently held by a worker
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Rate-limited work queue of `namespace/name` keys
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: RateLimiter,
}

impl WorkQueue {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    /// Queue `key` unless it is already waiting
    ///
    /// If a worker currently holds `key`, it is redelivered after `done`.
    /// Keys added after shutdown are ignored.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = safe_lock(&self.state);

        if state.shutting_down {
            debug!("Ignoring key {} added after shutdown", key);
            return;
        }

        if !state.dirty.insert(key.clone()) {
            return;
        }

        record_queue_add();

        if state.processing.contains(&key) {
            debug!("Key {} is being processed, deferring", key);
            return;
        }

        state.queue.push_back(key);
        set_queue_depth(state.queue.len());
        drop(state);

        self.notify.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down and drained. The returned
    /// key must be released with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            // Enabled before checking state so a wakeup between the check and
            // the await is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = safe_lock(&self.state);
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    set_queue_depth(state.queue.len());
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing
    pub fn done(&self, key: &str) {
        let mut state = safe_lock(&self.state);
        state.processing.remove(key);

        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            set_queue_depth(state.queue.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`
    ///
    /// Must be called from within a tokio runtime when `delay` is non-zero.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();

        if delay.is_zero() {
            self.add(key);
            return;
        }

        if self.is_shutting_down() {
            return;
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add(key);
            }
        });
    }

    /// Queue `key` after its rate-limited delay and count one requeue
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.rate_limiter.when(key);
        record_queue_retry();
        debug!("Requeueing {} in {:?}", key, delay);
        self.add_after(key.to_string(), delay);
    }

    /// Rate-limited requeues of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Stop tracking retries for `key`
    pub fn forget(&self, key: &str) {
        self.rate_limiter.forget(key);
    }

    /// Stop accepting keys and wake every waiting worker
    ///
    /// Keys already queued are still handed out; `get` returns `None` once
    /// they are gone.
    pub fn shut_down(&self) {
        safe_lock(&self.state).shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        safe_lock(&self.state).shutting_down
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        safe_lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held by workers
    pub fn in_flight(&self) -> usize {
        safe_lock(&self.state).processing.len()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RateLimiter::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn fast_queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(RateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
            1000.0,
            1000,
        )))
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_keys() {
        let queue = WorkQueue::default();

        queue.add("default/foo");
        queue.add("default/foo");
        queue.add("default/bar");

        assert_eq!(queue.len(), 2, "Duplicate pending key should collapse");
        assert_eq!(queue.get().await.as_deref(), Some("default/foo"));
        assert_eq!(queue.get().await.as_deref(), Some("default/bar"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_deferred() {
        let queue = WorkQueue::default();

        queue.add("default/foo");
        let key = queue.get().await.unwrap();

        // Event arrives mid-reconcile
        queue.add("default/foo");
        assert_eq!(queue.len(), 0, "Key must not be handed to a second worker");
        assert_eq!(queue.in_flight(), 1);

        queue.done(&key);
        assert_eq!(queue.len(), 1, "Deferred key should be redelivered");
        assert_eq!(queue.get().await.as_deref(), Some("default/foo"));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = WorkQueue::default();

        queue.add("default/foo");
        let key = queue.get().await.unwrap();
        queue.done(&key);

        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = Arc::new(WorkQueue::default());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "get should block on an empty queue");

        queue.add("default/foo");
        let key = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get should wake up")
            .unwrap();
        assert_eq!(key.as_deref(), Some("default/foo"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_all_waiters() {
        let queue = Arc::new(WorkQueue::default());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();

        for waiter in waiters {
            let result = timeout(Duration::from_secs(1), waiter)
                .await
                .expect("shutdown should wake waiter")
                .unwrap();
            assert_eq!(result, None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_keys() {
        let queue = WorkQueue::default();

        queue.add("default/foo");
        queue.shut_down();
        queue.add("default/bar");

        assert_eq!(queue.get().await.as_deref(), Some("default/foo"));
        assert_eq!(queue.get().await, None, "Keys added after shutdown are ignored");
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_counts_and_redelivers() {
        let queue = fast_queue();

        queue.add_rate_limited("default/foo");
        queue.add_rate_limited("default/foo");
        assert_eq!(queue.num_requeues("default/foo"), 2);
        assert_eq!(queue.len(), 0, "Rate-limited adds are delayed");

        // Both delayed adds land and collapse into one entry
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);

        let key = queue.get().await;
        assert_eq!(key.as_deref(), Some("default/foo"));
        queue.done("default/foo");
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(), 0);

        queue.forget("default/foo");
        assert_eq!(queue.num_requeues("default/foo"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_delay() {
        let queue = fast_queue();

        queue.add_after("default/foo", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_back_to_back_adds_wake_separate_workers() {
        for _ in 0..200 {
            let queue = Arc::new(WorkQueue::default());

            let waiters: Vec<_> = (0..2)
                .map(|_| {
                    let queue = queue.clone();
                    tokio::spawn(async move { queue.get().await })
                })
                .collect();

            queue.add("default/foo");
            queue.add("default/bar");

            // Neither worker calls done, so each must receive its own key
            let mut keys = Vec::new();
            for waiter in waiters {
                let key = timeout(Duration::from_secs(1), waiter)
                    .await
                    .expect("Both workers should wake")
                    .unwrap();
                keys.push(key.unwrap());
            }
            keys.sort();
            assert_eq!(keys, vec!["default/bar", "default/foo"]);
            assert_eq!(queue.in_flight(), 2);
        }
    }

    #[tokio::test]
    async fn test_add_after_zero_delay_is_immediate() {
        let queue = fast_queue();

        queue.add_after("default/foo", Duration::ZERO);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_workers_never_share_a_key() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue = Arc::new(WorkQueue::default());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        queue.done(&key);
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            queue.add("default/foo");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(
            max_active.load(Ordering::SeqCst),
            1,
            "Same key must never be processed concurrently"
        );
    }
}
