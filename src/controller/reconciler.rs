//! Reconciliation pass for Motis instances.
//!
//! One pass reads the instance and its owned objects, translates the
//! declaration into desired objects, writes only the objects that differ,
//! advances the lifecycle state machine and writes status at most once.
//! A pass over a converged instance performs no writes at all.
//!
//! Data is imported by a one-shot Job whenever the sources change. The
//! workload is only rolled onto a revision a Job has finished writing, so a
//! pending import leaves the served data untouched.

use std::future::Future;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use k8s_openapi::api::batch::v1::Job;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ResourceClient};
use crate::controller::context::{Context, FINALIZER};
use crate::controller::diff::{merged_object, object_diff};
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    ResourceEvent, ResourceStateMachine, TransitionContext, advance,
};
use crate::controller::status::{ObservedObjects, carry_transition_times, conditions_for_phase};
use crate::controller::validation::{InstanceSpec, change_requested};
use crate::crd::{Motis, MotisStatus, Phase};
use crate::resources::common::{
    Component, RETRY_ANNOTATION, component_selector, config_map_name, data_hash,
    data_volume_name, import_job_name, input_volume_name, instance_selector, is_owned_by,
    refresh_job_name, workload_name,
};
use crate::resources::import_job::import_hash;
use crate::resources::pipeline::{JobOutcome, job_outcome, job_revision};
use crate::resources::refresh_job::job_scheduled_at;
use crate::resources::translate;
use crate::resources::workload::{generate_workload, template_data_revision};
use crate::scheduler::{CronSchedule, until};

/// Fire times walked when looking for the latest missed refresh.
const MAX_MISSED_FIRES: usize = 1_000;

/// What to do with an instance after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run another pass after the delay.
    Requeue(Duration),
    /// Wait for the next watch event or scheduled refresh.
    AwaitChange,
}

/// Run a cluster call under the per-call timeout, unless the pass has been
/// cancelled.
async fn call<T, F>(ctx: &Context, token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ClientError>>,
{
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(tokio::time::timeout(ctx.settings.call_timeout, fut).await??)
}

/// Refuse to manage an object of the right name that another owner controls.
fn ensure_owned<K: Resource>(observed: &K, uid: Option<&str>) -> Result<()> {
    if is_owned_by(observed.meta(), uid) {
        return Ok(());
    }
    let name = observed.meta().name.clone().unwrap_or_default();
    Err(Error::Irrecoverable(format!(
        "name collision: {name} exists and is not owned by this instance"
    )))
}

/// Treat `NotFound` as success.
fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Reconcile the instance named `name`.
pub async fn reconcile(name: &str, ctx: &Context) -> Result<Action> {
    let start_time = Instant::now();
    let token = ctx.cancellation_token(name).await;

    let Some(instance) = call(ctx, &token, ctx.clients.instances.get_opt(name)).await? else {
        debug!(name = %name, "Instance is gone");
        ctx.scheduler.unregister(name).await;
        ctx.clear_cancellation(name).await;
        if let Some(health) = &ctx.health_state {
            health.metrics.remove_instance(name);
        }
        return Ok(Action::AwaitChange);
    };

    if instance.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&instance, ctx).await;
    }

    // A cancelled token on a live object belongs to an earlier object of
    // the same name.
    let token = if token.is_cancelled() {
        ctx.clear_cancellation(name).await;
        ctx.cancellation_token(name).await
    } else {
        token
    };

    let instance = ensure_finalizer(instance, ctx, &token).await?;
    let result = reconcile_instance(&instance, ctx, &token).await;

    let namespace = instance.namespace().unwrap_or_else(|| "default".to_string());
    if let Some(health) = &ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health.metrics.record_reconcile(&namespace, name, duration);
        if let Err(e) = &result {
            health.metrics.record_error(&namespace, name, e.reason());
        }
    }
    result
}

async fn ensure_finalizer(instance: Motis, ctx: &Context, token: &CancellationToken) -> Result<Motis> {
    if instance.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(instance);
    }
    info!(name = %instance.name_any(), "Adding finalizer");
    let mut updated = instance;
    updated.finalizers_mut().push(FINALIZER.to_string());
    call(ctx, token, ctx.clients.instances.update(&updated)).await
}

/// Delete every owned object, then release the finalizer.
///
/// Runs without cancellation checks: the token of a deleted instance is
/// always cancelled.
async fn handle_deletion(instance: &Motis, ctx: &Context) -> Result<Action> {
    let name = instance.name_any();
    info!(name = %name, "Deleting instance and owned objects");
    ctx.scheduler.unregister(&name).await;

    let token = CancellationToken::new();
    let clients = &ctx.clients;
    let uid = instance.metadata.uid.as_deref();

    delete_owned(ctx, &token, clients.refresh_jobs.as_ref(), &refresh_job_name(&name), uid).await?;
    let jobs = call(ctx, &token, clients.jobs.list(Some(&instance_selector(&name)))).await?;
    for job in jobs {
        ignore_not_found(call(ctx, &token, clients.jobs.delete(&job.name_any())).await)?;
    }
    delete_owned(ctx, &token, clients.workloads.as_ref(), &workload_name(&name), uid).await?;
    delete_owned(ctx, &token, clients.config_maps.as_ref(), &config_map_name(&name), uid).await?;
    for volume in [input_volume_name(&name), data_volume_name(&name)] {
        delete_owned(ctx, &token, clients.volumes.as_ref(), &volume, uid).await?;
    }

    if instance.finalizers().iter().any(|f| f == FINALIZER) {
        let mut released = instance.clone();
        released.finalizers_mut().retain(|f| f != FINALIZER);
        ignore_not_found(
            call(ctx, &token, clients.instances.update(&released))
                .await
                .map(|_| ()),
        )?;
    }

    ctx.clear_cancellation(&name).await;
    if let Some(health) = &ctx.health_state {
        health.metrics.remove_instance(&name);
    }
    ctx.publish_normal_event(
        instance,
        "Deleted",
        "Cleanup",
        Some("Owned objects removed".to_string()),
    )
    .await;
    Ok(Action::AwaitChange)
}

/// Delete the object `name` unless another owner controls it.
async fn delete_owned<K>(
    ctx: &Context,
    token: &CancellationToken,
    client: &dyn ResourceClient<K>,
    name: &str,
    uid: Option<&str>,
) -> Result<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    match call(ctx, token, client.get_opt(name)).await? {
        Some(object) if is_owned_by(object.meta(), uid) => {
            ignore_not_found(call(ctx, token, client.delete(name)).await)
        }
        Some(_) => {
            warn!(object = %name, "Leaving object of another owner in place");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Outcome of the refresh currently in progress.
#[derive(Debug, Default)]
struct RefreshProgress {
    job: Option<JobOutcome>,
    timed_out: bool,
    /// The Job succeeded longer than the rollout deadline ago.
    rollout_overdue: bool,
    /// Revision to roll the workload to, once the refresh Job succeeded.
    revision: Option<String>,
}

/// State of the data import for the current sources.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Import {
    /// The stored revision was built from the current sources.
    Current,
    /// The import Job is being replaced or still runs.
    Running,
    /// The import Job finished writing this revision.
    Done(String),
    Failed,
}

async fn reconcile_instance(instance: &Motis, ctx: &Context, token: &CancellationToken) -> Result<Action> {
    let name = instance.name_any();
    let now = ctx.clock.now();
    let stored = instance.status.clone().unwrap_or_default();
    let phase = stored.phase;
    let spec_changed = change_requested(instance);

    let mut spec = match InstanceSpec::from_resource(instance) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(name = %name, error = %e, "Declaration is invalid");
            let ctx_error = TransitionContext::new()
                .with_spec_changed(spec_changed)
                .with_error(e.to_string());
            ctx.scheduler.unregister(&name).await;
            return finish(instance, ctx, token, &stored, &ctx_error, None, false, now)
                .await
                .map(|_| Action::AwaitChange);
        }
    };

    if phase == Phase::Failed && !spec_changed {
        debug!(name = %name, "Failed instance waits for a spec change or retry");
        ctx.scheduler.unregister(&name).await;
        return Ok(Action::AwaitChange);
    }

    let owner_uid = spec.uid.clone();
    let uid = owner_uid.as_deref();
    let observed = observe(ctx, token, &name).await?;
    let schedule = spec.schedule();

    let refresh_due = if phase == Phase::Ready && !spec_changed {
        schedule
            .as_ref()
            .and_then(|s| latest_fire(s, refresh_base(instance, &stored), now))
    } else {
        None
    };

    let progress = if phase == Phase::RefreshingData && !spec_changed {
        refresh_progress(ctx, token, &name, &stored, now).await?
    } else {
        RefreshProgress::default()
    };
    if let Some(revision) = &progress.revision {
        spec.data_revision = Some(revision.clone());
    }

    let wanted_hash = data_hash(&spec);
    let data_current = stored.data_revision.is_some()
        && stored.data_hash.as_deref() == Some(wanted_hash.as_str());
    if !data_current {
        spec.data_revision = None;
    }

    let desired = translate(&spec)?;
    let mut written = false;
    written |= apply(ctx, token, ctx.clients.config_maps.as_ref(), &desired.config_map, observed.config_map.as_ref(), uid).await?;
    for volume in &desired.volumes {
        let current = call(ctx, token, ctx.clients.volumes.get_opt(&volume.name_any())).await?;
        written |= ensure_created(ctx, token, ctx.clients.volumes.as_ref(), volume, current.as_ref(), uid).await?;
    }

    let import = if data_current {
        Import::Current
    } else {
        sync_import(ctx, token, &spec, &desired.import_job, spec_changed).await?
    };
    let workload = match &import {
        Import::Done(revision) => {
            info!(name = %name, revision = %revision, "Data import finished");
            spec.data_revision = Some(revision.clone());
            generate_workload(&spec)
        }
        _ => desired.workload,
    };
    if let Some(workload) = &workload {
        written |= apply(ctx, token, ctx.clients.workloads.as_ref(), workload, observed.workload.as_ref(), uid).await?;
    }

    match (&desired.refresh_job, &observed.refresh_job) {
        (Some(cron_job), current) => {
            written |= apply(ctx, token, ctx.clients.refresh_jobs.as_ref(), cron_job, current.as_ref(), uid).await?;
        }
        (None, Some(current)) if is_owned_by(&current.metadata, uid) => {
            info!(name = %name, "Refresh schedule removed, deleting CronJob");
            ignore_not_found(
                call(ctx, token, ctx.clients.refresh_jobs.delete(&refresh_job_name(&name))).await,
            )?;
            written = true;
        }
        (None, _) => {}
    }

    let drift_detected = phase == Phase::Ready
        && !spec_changed
        && (written || !observed.workload_available());
    if drift_detected {
        warn!(name = %name, "Owned objects drifted from the declaration");
    }

    let workload_on_revision = spec.data_revision.is_some()
        && observed
            .workload
            .as_ref()
            .and_then(template_data_revision)
            == spec.data_revision.as_deref();

    let mut transition_ctx = TransitionContext::new()
        .with_spec_changed(spec_changed)
        .with_converged(!written && import == Import::Current)
        .with_workload_ready(observed.workload_available())
        .with_workload_on_revision(workload_on_revision)
        .with_drift(drift_detected)
        .with_refresh_due(refresh_due.is_some())
        .with_refresh_job(progress.job)
        .with_refresh_timed_out(progress.timed_out);
    if import == Import::Failed {
        transition_ctx = transition_ctx.with_error("data import Job failed".to_string());
    } else if progress.rollout_overdue && !transition_ctx.refresh_complete() {
        transition_ctx = transition_ctx
            .with_error("workload did not roll out the refreshed data before the deadline".to_string());
    }

    let (revision, imported_hash) = match import {
        Import::Done(revision) => (Some(revision), Some(wanted_hash)),
        _ => (progress.revision, None),
    };
    let next_phase = finish(
        instance,
        ctx,
        token,
        &stored,
        &transition_ctx,
        Some(DataUpdate {
            fire: refresh_due,
            revision,
            data_hash: imported_hash,
        }),
        written,
        now,
    )
    .await?;

    match (next_phase, &schedule) {
        (Phase::Ready, Some(schedule)) => {
            ctx.scheduler.register(&name, schedule, now).await;
        }
        _ => ctx.scheduler.unregister(&name).await,
    }

    Ok(match next_phase {
        Phase::Ready => {
            let next_fire = ctx.scheduler.next_fire(&name).await;
            let requeue = next_fire
                .map(|fire| until(now, fire))
                .map_or(ctx.settings.ready_requeue, |d| d.min(ctx.settings.ready_requeue));
            Action::Requeue(requeue)
        }
        Phase::Failed => Action::AwaitChange,
        Phase::Pending | Phase::Provisioning | Phase::RefreshingData => {
            Action::Requeue(ctx.settings.progress_requeue)
        }
    })
}

/// Drive the import Job for the current sources.
///
/// A Job built for other sources is replaced, as is a failed Job when a
/// retry was requested. The replacement is created on the following pass,
/// once the old Job is gone.
async fn sync_import(
    ctx: &Context,
    token: &CancellationToken,
    spec: &InstanceSpec,
    desired: &Job,
    retry: bool,
) -> Result<Import> {
    let name = import_job_name(&spec.name);
    let Some(job) = call(ctx, token, ctx.clients.jobs.get_opt(&name)).await? else {
        info!(name = %spec.name, job = %name, "Starting data import");
        call(ctx, token, ctx.clients.jobs.create(desired)).await?;
        return Ok(Import::Running);
    };
    ensure_owned(&job, spec.uid.as_deref())?;

    let outcome = job_outcome(&job);
    let stale = import_hash(&job) != import_hash(desired);
    if stale || (retry && outcome == JobOutcome::Failed) {
        info!(name = %spec.name, job = %name, stale = stale, "Replacing import Job");
        ignore_not_found(call(ctx, token, ctx.clients.jobs.delete(&name)).await)?;
        return Ok(Import::Running);
    }

    Ok(match outcome {
        JobOutcome::Running => Import::Running,
        JobOutcome::Succeeded => job_revision(&job).map_or(Import::Running, Import::Done),
        JobOutcome::Failed => Import::Failed,
    })
}

async fn observe(ctx: &Context, token: &CancellationToken, name: &str) -> Result<ObservedObjects> {
    let clients = &ctx.clients;
    let config_map = call(ctx, token, clients.config_maps.get_opt(&config_map_name(name))).await?;
    let workload = call(ctx, token, clients.workloads.get_opt(&workload_name(name))).await?;
    let refresh_job = call(ctx, token, clients.refresh_jobs.get_opt(&refresh_job_name(name))).await?;
    Ok(ObservedObjects {
        config_map,
        workload,
        refresh_job,
    })
}

/// Create or converge one owned object. Returns whether anything was written.
async fn apply<K>(
    ctx: &Context,
    token: &CancellationToken,
    client: &dyn ResourceClient<K>,
    desired: &K,
    observed: Option<&K>,
    uid: Option<&str>,
) -> Result<bool>
where
    K: Resource + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let name = desired.meta().name.clone().unwrap_or_default();
    let Some(observed) = observed else {
        debug!(object = %name, "Creating owned object");
        call(ctx, token, client.create(desired)).await?;
        return Ok(true);
    };
    ensure_owned(observed, uid)?;

    let changed = object_diff(desired, observed)?;
    if changed.is_empty() {
        return Ok(false);
    }
    debug!(object = %name, fields = ?changed, "Updating owned object");
    let merged = merged_object(desired, observed)?;
    match call(ctx, token, client.update(&merged)).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            call(ctx, token, client.create(desired)).await?;
        }
        Err(e) => return Err(e),
    }
    Ok(true)
}

/// Create an object that is never changed once it exists. Returns whether
/// anything was written.
async fn ensure_created<K>(
    ctx: &Context,
    token: &CancellationToken,
    client: &dyn ResourceClient<K>,
    desired: &K,
    observed: Option<&K>,
    uid: Option<&str>,
) -> Result<bool>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    if let Some(observed) = observed {
        return ensure_owned(observed, uid).map(|()| false);
    }
    debug!(object = %desired.meta().name.clone().unwrap_or_default(), "Creating owned object");
    call(ctx, token, client.create(desired)).await?;
    Ok(true)
}

/// Data bookkeeping for the status written at the end of a pass.
struct DataUpdate {
    /// Fire time of a refresh that is due now.
    fire: Option<Timestamp>,
    /// Data revision produced by a succeeded import or refresh Job.
    revision: Option<String>,
    /// Source hash the imported revision was built from.
    data_hash: Option<String>,
}

/// The point refreshes are counted from: the last refresh, the last time
/// the instance became Ready for its declaration, or creation.
fn refresh_base(instance: &Motis, stored: &MotisStatus) -> Timestamp {
    let parse = |t: &Option<String>| t.as_deref().and_then(|t| t.parse::<Timestamp>().ok());
    [
        instance.metadata.creation_timestamp.as_ref().map(|t| t.0),
        parse(&stored.last_refresh_at),
        parse(&stored.provisioned_at),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(Timestamp::UNIX_EPOCH)
}

/// The most recent fire time of `schedule` in `(base, now]`.
pub fn latest_fire(schedule: &CronSchedule, base: Timestamp, now: Timestamp) -> Option<Timestamp> {
    let mut fire = schedule.next_after(base).filter(|fire| *fire <= now)?;
    for _ in 0..MAX_MISSED_FIRES {
        match schedule.next_after(fire) {
            Some(next) if next <= now => fire = next,
            _ => break,
        }
    }
    Some(fire)
}

async fn refresh_progress(
    ctx: &Context,
    token: &CancellationToken,
    name: &str,
    stored: &MotisStatus,
    now: Timestamp,
) -> Result<RefreshProgress> {
    let Some(started) = stored
        .refresh_started_at
        .as_deref()
        .and_then(|t| t.parse::<Timestamp>().ok())
    else {
        return Ok(RefreshProgress {
            timed_out: true,
            ..Default::default()
        });
    };

    let selector = component_selector(name, Component::RefreshJob);
    let jobs = call(ctx, token, ctx.clients.jobs.list(Some(&selector))).await?;
    let job = jobs
        .iter()
        .filter_map(|job| job_scheduled_at(job).map(|at| (at, job)))
        .filter(|(at, _)| *at >= started)
        .min_by_key(|(at, _)| *at)
        .map(|(_, job)| job);

    let Some(job) = job else {
        let waited = until(started, now);
        return Ok(RefreshProgress {
            timed_out: waited > ctx.settings.refresh_start_deadline,
            ..Default::default()
        });
    };

    let outcome = job_outcome(job);
    debug!(name = %name, job = %job.name_any(), outcome = ?outcome, "Refresh Job observed");
    let completed = job
        .status
        .as_ref()
        .and_then(|s| s.completion_time.as_ref())
        .map_or(started, |t| t.0);
    Ok(RefreshProgress {
        job: Some(outcome),
        timed_out: false,
        rollout_overdue: outcome == JobOutcome::Succeeded
            && until(completed, now) > ctx.settings.refresh_rollout_deadline,
        revision: job_revision(job),
    })
}

fn condition_reason(phase: Phase, error: Option<&str>) -> (&'static str, String) {
    match phase {
        Phase::Pending => ("Pending", "Waiting for the controller".to_string()),
        Phase::Provisioning => ("Provisioning", "Applying owned objects".to_string()),
        Phase::Ready => ("Converged", "All owned objects are converged".to_string()),
        Phase::RefreshingData => ("RefreshingData", "Fetching new source data".to_string()),
        Phase::Failed => ("Failed", error.unwrap_or_default().to_string()),
    }
}

/// Advance the state machine, write status if it changed and publish events.
/// Returns the resulting phase.
#[allow(clippy::too_many_arguments)]
async fn finish(
    instance: &Motis,
    ctx: &Context,
    token: &CancellationToken,
    stored: &MotisStatus,
    transition_ctx: &TransitionContext,
    data: Option<DataUpdate>,
    written: bool,
    now: Timestamp,
) -> Result<Phase> {
    let name = instance.name_any();
    let machine = ResourceStateMachine::new();
    let (phase, events) = advance(&machine, stored.phase, transition_ctx);

    let mut next = stored.clone();
    next.phase = phase;
    next.observed_generation = instance.metadata.generation;
    next.retry_observed = instance.annotations().get(RETRY_ANNOTATION).cloned();

    for event in &events {
        match event {
            ResourceEvent::SpecChanged => {
                next.refresh_started_at = None;
                next.provisioned_at = None;
                next.last_error = None;
            }
            ResourceEvent::AllObjectsReady => {
                next.provisioned_at.get_or_insert_with(|| now.to_string());
                next.last_error = None;
            }
            ResourceEvent::RefreshTriggered => {
                next.refresh_started_at = data
                    .as_ref()
                    .and_then(|r| r.fire)
                    .map(|fire| fire.to_string());
            }
            ResourceEvent::RefreshSucceeded => {
                next.refresh_started_at = None;
                next.last_refresh_at = Some(now.to_string());
                next.last_error = None;
            }
            ResourceEvent::RefreshFailed => {
                next.refresh_started_at = None;
                next.last_error = Some(transition_ctx.error_message.clone().unwrap_or_else(|| {
                    if transition_ctx.refresh_timed_out {
                        "refresh Job did not start before the deadline".to_string()
                    } else {
                        "refresh Job failed".to_string()
                    }
                }));
            }
            ResourceEvent::ApplyFailed => next.last_error = transition_ctx.error_message.clone(),
            ResourceEvent::ConvergenceLost => {}
        }
    }
    if phase == Phase::Failed {
        if let Some(message) = &transition_ctx.error_message {
            next.last_error = Some(message.clone());
        }
    }
    if let Some(data) = data {
        if let Some(revision) = data.revision {
            next.data_revision = Some(revision);
        }
        if let Some(hash) = data.data_hash {
            next.data_hash = Some(hash);
        }
    }

    let (reason, message) = condition_reason(phase, next.last_error.as_deref());
    next.conditions = carry_transition_times(
        &stored.conditions,
        conditions_for_phase(phase, reason, &message, instance.metadata.generation),
    );

    let mut comparable = next.clone();
    comparable.last_reconciled_at = stored.last_reconciled_at.clone();
    if comparable != *stored || written {
        next.last_reconciled_at = Some(now.to_string());
        write_status(instance, ctx, token, next).await?;
    }

    for event in &events {
        info!(name = %name, event = %event, phase = %phase, "Phase transition");
        match event {
            ResourceEvent::ApplyFailed | ResourceEvent::RefreshFailed | ResourceEvent::ConvergenceLost => {
                ctx.publish_warning_event(
                    instance,
                    &event.to_string(),
                    "Reconciling",
                    transition_ctx.error_message.clone(),
                )
                .await;
            }
            _ => {
                ctx.publish_normal_event(
                    instance,
                    &event.to_string(),
                    "Reconciling",
                    Some(format!("Instance is now {phase}")),
                )
                .await;
            }
        }
        if let Some(health) = &ctx.health_state {
            match event {
                ResourceEvent::RefreshSucceeded => health.metrics.record_refresh(&name, "succeeded"),
                ResourceEvent::RefreshFailed => health.metrics.record_refresh(&name, "failed"),
                _ => {}
            }
        }
    }
    if let Some(health) = &ctx.health_state {
        health.metrics.set_instance_phase(&name, phase);
        health.last_reconcile.store(
            u64::try_from(now.as_second()).unwrap_or_default(),
            std::sync::atomic::Ordering::Relaxed,
        );
    }

    Ok(phase)
}

/// Replace the status of `instance`. The write carries the resourceVersion
/// read at the start of the pass and fails with a conflict if the object
/// moved on.
async fn write_status(
    instance: &Motis,
    ctx: &Context,
    token: &CancellationToken,
    status: MotisStatus,
) -> Result<()> {
    let stored_generation = instance.status.as_ref().and_then(|s| s.observed_generation);
    if let (Some(stored), Some(pass)) = (stored_generation, status.observed_generation) {
        if stored > pass {
            debug!(name = %instance.name_any(), "Stored status is newer, skipping write");
            return Ok(());
        }
    }
    let mut updated = instance.clone();
    updated.status = Some(status);
    call(ctx, token, ctx.clients.instances.update_status(&updated)).await?;
    Ok(())
}

/// Mark `name` Failed after an error the runner will not retry.
pub async fn mark_failed(name: &str, ctx: &Context, error: &Error) -> Result<()> {
    let token = CancellationToken::new();
    let Some(instance) = call(ctx, &token, ctx.clients.instances.get_opt(name)).await? else {
        return Ok(());
    };
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }
    warn!(name = %name, error = %error, "Marking instance failed");
    let stored = instance.status.clone().unwrap_or_default();
    let transition_ctx = TransitionContext::new()
        .with_spec_changed(change_requested(&instance))
        .with_error(error.to_string());
    ctx.scheduler.unregister(name).await;
    finish(&instance, ctx, &token, &stored, &transition_ctx, None, false, ctx.clock.now()).await?;
    Ok(())
}
