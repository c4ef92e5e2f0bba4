//! Refresh scheduling.
//!
//! [`RefreshScheduler`] keeps the next cron fire time of every instance that
//! has a refresh schedule and re-injects the instance key into the
//! [`WorkQueue`] once that time is reached. The reconciler decides what a due
//! refresh means; the scheduler only wakes it up.

pub mod cron;

pub use cron::{CronError, CronSchedule};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::controller::queue::WorkQueue;

/// Longest sleep between due checks, so a manually advanced clock is noticed.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Wall clock used for cron evaluation and status timestamps.
#[derive(Clone, Debug, Default)]
pub enum Clock {
    #[default]
    System,
    /// A clock that only moves when told to.
    Manual(Arc<StdMutex<Timestamp>>),
}

impl Clock {
    pub fn manual(start: Timestamp) -> Self {
        Clock::Manual(Arc::new(StdMutex::new(start)))
    }

    pub fn now(&self) -> Timestamp {
        match self {
            Clock::System => Timestamp::now(),
            Clock::Manual(current) => *current.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Move a manual clock forward. No effect on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(current) = self {
            let mut current = current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(next) = SignedDuration::try_from(by)
                .ok()
                .and_then(|d| current.checked_add(d).ok())
            {
                *current = next;
            }
        }
    }

    /// Set a manual clock. No effect on the system clock.
    pub fn set(&self, to: Timestamp) {
        if let Clock::Manual(current) = self {
            *current.lock().unwrap_or_else(|e| e.into_inner()) = to;
        }
    }
}

/// Time from `now` until `then`, zero if `then` has passed.
pub fn until(now: Timestamp, then: Timestamp) -> Duration {
    Duration::try_from(then.duration_since(now)).unwrap_or(Duration::ZERO)
}

/// Tracks the next refresh fire time per instance.
pub struct RefreshScheduler {
    entries: Mutex<HashMap<String, Timestamp>>,
    changed: Notify,
    clock: Clock,
}

impl RefreshScheduler {
    pub fn new(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            clock,
        }
    }

    /// Record the first fire of `schedule` after `after` for `name`,
    /// replacing any earlier registration. Returns the fire time.
    pub async fn register(
        &self,
        name: &str,
        schedule: &CronSchedule,
        after: Timestamp,
    ) -> Option<Timestamp> {
        let next = schedule.next_after(after)?;
        let previous = self.entries.lock().await.insert(name.to_string(), next);
        if previous != Some(next) {
            debug!(name = %name, next_fire = %next, "Registered refresh");
            self.changed.notify_one();
        }
        Some(next)
    }

    /// Forget `name`. Instances without a schedule are never registered.
    pub async fn unregister(&self, name: &str) {
        if self.entries.lock().await.remove(name).is_some() {
            debug!(name = %name, "Unregistered refresh");
        }
    }

    /// Registered fire time for `name`.
    pub async fn next_fire(&self, name: &str) -> Option<Timestamp> {
        self.entries.lock().await.get(name).copied()
    }

    /// Remove and return every instance whose fire time is at or before `now`.
    pub async fn take_due(&self, now: Timestamp) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, fire)| **fire <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &due {
            entries.remove(name);
        }
        due
    }

    async fn earliest(&self) -> Option<Timestamp> {
        self.entries.lock().await.values().min().copied()
    }

    /// Enqueue due instances until `token` is cancelled.
    pub async fn run(self: Arc<Self>, queue: Arc<WorkQueue>, token: CancellationToken) {
        info!("Refresh scheduler started");
        loop {
            let wait = match self.earliest().await {
                Some(fire) => until(self.clock.now(), fire).min(MAX_POLL_INTERVAL),
                None => MAX_POLL_INTERVAL,
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.changed.notified() => continue,
                _ = tokio::time::sleep(wait) => {}
            }

            for name in self.take_due(self.clock.now()).await {
                info!(name = %name, "Refresh due, enqueuing instance");
                queue.add(&name).await;
            }
        }
        info!("Refresh scheduler stopped");
    }
}
