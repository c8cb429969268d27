//! Rate-limited, de-duplicated work queue feeding the control loop
//!
//! Keys are parent cache keys (`namespace/name`). The queue guarantees:
//!
//! - a key is never queued twice (adds while pending are coalesced),
//! - a key held by one worker is not dispatched to another until the
//!   worker calls [`WorkQueue::done`]; adds arriving in between are
//!   delivered as a single entry afterwards,
//! - failed keys re-enter via [`WorkQueue::add_rate_limited`] with
//!   per-key exponential backoff, reset by [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Per-key exponential backoff with a ceiling.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiter {
    /// Delay of the first retry.
    pub base: Duration,
    /// Ceiling no retry delay exceeds.
    pub max: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl RateLimiter {
    /// Backoff for the given retry ordinal (0-based).
    pub fn delay(&self, retries: u32) -> Duration {
        let exponent = retries.min(30);
        self.base
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

/// De-duplicated FIFO of parent keys with rate-limited retry.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: RateLimiter,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create a queue with the default rate limiter.
    pub fn new() -> Self {
        Self::with_rate_limiter(RateLimiter::default())
    }

    /// Create a queue with a custom rate limiter (shortened in tests).
    pub fn with_rate_limiter(limiter: RateLimiter) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter,
        }
    }

    /// Enqueue a key. No-ops when the key is already pending; a key
    /// currently held by a worker is re-delivered after `done`.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.shutdown || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue a key after its per-key backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = self.limiter.delay(*failures);
            *failures += 1;
            delay
        };
        debug!(key, ?delay, "re-enqueueing with backoff");
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Number of rate-limited retries recorded for a key.
    pub fn requeues(&self, key: &str) -> u32 {
        let state = self.state.lock().expect("queue lock poisoned");
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue has been
    /// shut down and drained. The returned key is held by the caller
    /// until [`WorkQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // wake the next idle worker; a Notify stores at
                        // most one permit
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release a key after processing. If the key was re-added while
    /// held, it re-enters the queue now.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Reset the backoff for a key after a successful sync.
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.failures.remove(key);
    }

    /// Shut the queue down. Pending keys are still delivered; workers
    /// receive `None` once the queue is empty.
    pub fn shut_down(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.shutdown = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("queue lock poisoned");
        state.queue.len()
    }

    /// True when no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const KEY: &str = "default/vm-a";

    fn fast_queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::with_rate_limiter(RateLimiter {
            base: Duration::from_millis(1),
            max: Duration::from_millis(8),
        }))
    }

    #[tokio::test]
    async fn test_duplicate_adds_are_coalesced() {
        let queue = WorkQueue::new();
        queue.add(KEY);
        queue.add(KEY);
        queue.add(KEY);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get().await.as_deref(), Some(KEY));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_fifo() {
        let queue = WorkQueue::new();
        queue.add("default/vm-a");
        queue.add("default/vm-b");
        assert_eq!(queue.get().await.as_deref(), Some("default/vm-a"));
        assert_eq!(queue.get().await.as_deref(), Some("default/vm-b"));
    }

    #[tokio::test]
    async fn test_add_while_processing_delivers_after_done() {
        let queue = WorkQueue::new();
        queue.add(KEY);
        let key = queue.get().await.unwrap();

        // re-added while a worker holds it: not delivered yet
        queue.add(KEY);
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn test_get_blocks_until_add() {
        let queue = Arc::new(WorkQueue::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add(KEY);

        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get should wake up")
            .unwrap();
        assert_eq!(got.as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters_with_none() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();

        let got = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get should wake up")
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_keys() {
        let queue = WorkQueue::new();
        queue.add(KEY);
        queue.shut_down();
        assert_eq!(queue.get().await.as_deref(), Some(KEY));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_adds_after_shutdown_are_ignored() {
        let queue = WorkQueue::new();
        queue.shut_down();
        queue.add(KEY);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_add_is_delivered() {
        let queue = fast_queue();
        queue.add_rate_limited(KEY);
        let got = timeout(Duration::from_secs(1), queue.get())
            .await
            .expect("delayed add should arrive");
        assert_eq!(got.as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_forget_resets() {
        let queue = fast_queue();
        queue.add_rate_limited(KEY);
        queue.add_rate_limited(KEY);
        assert_eq!(queue.requeues(KEY), 2);

        queue.forget(KEY);
        assert_eq!(queue.requeues(KEY), 0);
    }

    #[test]
    fn test_rate_limiter_doubles_to_ceiling() {
        let limiter = RateLimiter {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        };
        assert_eq!(limiter.delay(0), Duration::from_millis(5));
        assert_eq!(limiter.delay(1), Duration::from_millis(10));
        assert_eq!(limiter.delay(4), Duration::from_millis(80));
        assert_eq!(limiter.delay(30), Duration::from_secs(1000));
        // saturation guard for absurd retry counts
        assert_eq!(limiter.delay(u32::MAX), Duration::from_secs(1000));
    }
}
