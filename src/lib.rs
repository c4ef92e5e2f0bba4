//! motis-operator library crate
//!
//! This module exports the controller, CRD definitions, resource generators,
//! the instance API and the wiring that feeds watch events into the work
//! queue.

pub mod api;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod scheduler;
pub mod webhooks;

pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::{Resource, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use client::{ChangeEvent, ClientError};
use controller::context::Context;
use controller::queue::WorkQueue;
use controller::runner::run_workers;
use controller::validation::change_requested;
use crd::Motis;
use resources::common::{INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};

/// Whether an instance event needs a pass. Status-only writes are skipped;
/// a retry request counts as a change.
fn instance_needs_pass(event: &ChangeEvent<Motis>) -> bool {
    match event {
        ChangeEvent::Added(_) | ChangeEvent::Deleted(_) => true,
        ChangeEvent::Modified(obj) => {
            obj.metadata.deletion_timestamp.is_some() || change_requested(obj)
        }
    }
}

/// Instance owning an object, read from the managed-by and instance labels.
pub fn owning_instance<K: Resource>(obj: &K) -> Option<String> {
    let labels = obj.meta().labels.as_ref()?;
    if labels.get(MANAGED_BY_LABEL).map(String::as_str) != Some(MANAGED_BY) {
        return None;
    }
    labels.get(INSTANCE_LABEL).cloned()
}

async fn feed_instances(
    mut stream: BoxStream<'static, Result<ChangeEvent<Motis>, ClientError>>,
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let obj = event.object();
                let name = obj.name_any();
                let deleting =
                    matches!(event, ChangeEvent::Deleted(_)) || obj.metadata.deletion_timestamp.is_some();
                if deleting {
                    ctx.cancel(&name).await;
                }
                if instance_needs_pass(&event) {
                    debug!(name = %name, "Instance changed, enqueuing");
                    queue.add(&name).await;
                }
            }
            Some(Err(e)) => warn!(error = %e, "Instance watch error"),
            None => {
                error!("Instance watch ended");
                break;
            }
        }
    }
}

async fn feed_owned<K>(
    kind: &'static str,
    mut stream: BoxStream<'static, Result<ChangeEvent<K>, ClientError>>,
    queue: Arc<WorkQueue>,
    token: CancellationToken,
) where
    K: Resource + Send + 'static,
{
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                if let Some(instance) = owning_instance(event.object()) {
                    debug!(kind = kind, name = %instance, "Owned object changed, enqueuing owner");
                    queue.add(&instance).await;
                }
            }
            Some(Err(e)) => warn!(kind = kind, error = %e, "Watch error"),
            None => {
                error!(kind = kind, "Watch ended");
                break;
            }
        }
    }
}

/// Run the controller until `token` is cancelled.
///
/// Watches instances and every owned kind, maps events onto instance keys,
/// runs the refresh scheduler and the worker pool. Works the same against
/// the Kubernetes API and the in-memory cluster.
pub async fn run_controller(
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    workers: usize,
    token: CancellationToken,
) {
    info!(workers = workers, "Starting controller for Motis resources");

    if let Some(state) = &ctx.health_state {
        state.set_ready(true).await;
    }

    let clients = ctx.clients.clone();
    let mut tasks = JoinSet::new();
    tasks.spawn(feed_instances(
        clients.instances.watch(),
        ctx.clone(),
        queue.clone(),
        token.clone(),
    ));
    tasks.spawn(feed_owned("ConfigMap", clients.config_maps.watch(), queue.clone(), token.clone()));
    tasks.spawn(feed_owned(
        "PersistentVolumeClaim",
        clients.volumes.watch(),
        queue.clone(),
        token.clone(),
    ));
    tasks.spawn(feed_owned("Deployment", clients.workloads.watch(), queue.clone(), token.clone()));
    tasks.spawn(feed_owned("CronJob", clients.refresh_jobs.watch(), queue.clone(), token.clone()));
    tasks.spawn(feed_owned("Job", clients.jobs.watch(), queue.clone(), token.clone()));
    tasks.spawn(ctx.scheduler.clone().run(queue.clone(), token.clone()));

    run_workers(ctx.clone(), queue, workers, token).await;

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Controller task failed");
        }
    }
    if let Some(state) = &ctx.health_state {
        state.set_ready(false).await;
    }
    info!("Controller stopped");
}
