//! Worker pool draining the work queue.
//!
//! Each worker takes one key at a time, so a key is never reconciled by two
//! workers at once. Errors are classified here:
//! - conflicts and cancellations run again at once
//! - transient errors back off until the retry budget is spent
//! - everything else marks the instance Failed

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::controller::queue::WorkQueue;
use crate::controller::reconciler::{Action, mark_failed, reconcile};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Run `workers` workers until `token` is cancelled.
pub async fn run_workers(
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    workers: usize,
    token: CancellationToken,
) {
    info!(workers = workers, "Starting reconcile workers");
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        let ctx = ctx.clone();
        let queue = queue.clone();
        set.spawn(async move {
            while let Some(key) = queue.next().await {
                process(&ctx, &queue, &key).await;
                queue.done(&key).await;
                if let Some(health) = &ctx.health_state {
                    let depth = i64::try_from(queue.len().await).unwrap_or(i64::MAX);
                    health.metrics.queue_depth.set(depth);
                }
            }
            debug!(worker = worker, "Worker stopped");
        });
    }

    token.cancelled().await;
    queue.shutdown().await;
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Worker task failed");
        }
    }
    info!("Reconcile workers stopped");
}

/// Reconcile one key and schedule its follow-up.
pub async fn process(ctx: &Context, queue: &WorkQueue, key: &str) {
    match reconcile(key, ctx).await {
        Ok(action) => {
            queue.forget(key).await;
            if let Action::Requeue(delay) = action {
                queue.add_after(key, delay).await;
            }
        }
        Err(e) if e.is_immediate_retry() => {
            debug!(name = %key, error = %e, "Retrying at once");
            queue.add(key).await;
        }
        Err(e) if e.is_retryable() => {
            let attempts = queue.num_requeues(key).await;
            if attempts < ctx.settings.retry_budget {
                let delay = queue.requeue_with_backoff(key).await;
                warn!(
                    name = %key,
                    error = %e,
                    attempt = attempts + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Transient failure, backing off"
                );
            } else {
                error!(name = %key, error = %e, attempts = attempts, "Retry budget exhausted");
                fail(ctx, queue, key, &e).await;
            }
        }
        Err(e) => {
            error!(name = %key, error = %e, "Reconciliation failed");
            fail(ctx, queue, key, &e).await;
        }
    }
}

async fn fail(ctx: &Context, queue: &WorkQueue, key: &str, err: &Error) {
    match mark_failed(key, ctx, err).await {
        Ok(()) => queue.forget(key).await,
        Err(e) => {
            warn!(name = %key, error = %e, "Could not record failure, retrying later");
            queue.requeue_with_backoff(key).await;
        }
    }
}
