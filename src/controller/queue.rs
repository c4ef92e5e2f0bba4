//! Keyed work queue with per-key exclusivity.
//!
//! Keys are instance names. The queue guarantees:
//!
//! - a key is handed to at most one worker at a time
//! - adding a key that is already waiting is a no-op (coalescing)
//! - adding a key that is being processed marks it dirty; it is queued again
//!   exactly once when the worker calls [`WorkQueue::done`]
//! - delayed adds keep the earliest deadline per key
//!
//! Failures are tracked per key and drive exponential backoff with full
//! jitter through [`WorkQueue::requeue_with_backoff`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay ceiling for the first retry.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Ceiling for the given attempt (1-based), before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    delayed: HashMap<String, Instant>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

impl QueueState {
    fn enqueue(&mut self, key: &str) -> bool {
        if self.processing.contains(key) {
            self.dirty.insert(key.to_string());
            false
        } else if self.queued.insert(key.to_string()) {
            self.ready.push_back(key.to_string());
            true
        } else {
            false
        }
    }

    fn promote_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .delayed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.delayed.remove(&key);
            self.enqueue(&key);
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

/// Work queue shared by the watch feeders, the refresh scheduler and the
/// worker pool.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queue `key` for immediate processing.
    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        state.delayed.remove(key);
        if state.enqueue(key) {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`. An earlier pending deadline wins.
    pub async fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            return self.add(key).await;
        }
        let mut state = self.state.lock().await;
        if state.shutdown || state.queued.contains(key) {
            return;
        }
        let deadline = Instant::now() + delay;
        state
            .delayed
            .entry(key.to_string())
            .and_modify(|current| *current = (*current).min(deadline))
            .or_insert(deadline);
        // Wake a waiter so it recomputes its sleep.
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let earliest = {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                state.promote_expired(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.earliest_deadline()
            };

            match earliest {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark processing of `key` finished. A key that was added while in
    /// flight is queued again.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.enqueue(key) {
            self.notify.notify_one();
        }
    }

    /// Record a failure for `key` and queue it after a backoff delay.
    /// Returns the chosen delay.
    pub async fn requeue_with_backoff(&self, key: &str) -> Duration {
        let attempt = {
            let mut state = self.state.lock().await;
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };
        let delay = self.backoff.delay(attempt);
        self.add_after(key, delay).await;
        delay
    }

    /// Clear the failure history of `key`.
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    /// Failures recorded for `key` since the last [`WorkQueue::forget`].
    pub async fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Drop any pending (immediate or delayed) work for `key`.
    pub async fn remove(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.delayed.remove(key);
        state.dirty.remove(key);
        state.failures.remove(key);
        if state.queued.remove(key) {
            state.ready.retain(|k| k != key);
        }
    }

    /// Keys waiting for processing, immediate or delayed.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `key` is currently held by a worker.
    pub async fn is_processing(&self, key: &str) -> bool {
        self.state.lock().await.processing.contains(key)
    }

    /// Stop handing out keys. Pending work is dropped.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.notify.notify_waiters();
    }
}
