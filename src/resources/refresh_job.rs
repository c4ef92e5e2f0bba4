//! CronJob generation for scheduled data refresh.
//!
//! Each Job the CronJob spawns runs the data pipeline into a fresh revision
//! directory. Once it succeeds the controller rolls the workload onto that
//! revision; a failed Job leaves the serving workload untouched.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::controller::validation::InstanceSpec;
use crate::resources::common::{Component, owned_metadata, refresh_job_name, standard_labels};
use crate::resources::pipeline::pipeline_job_spec;

/// Cron expressions are evaluated in UTC.
pub const TIME_ZONE: &str = "Etc/UTC";

/// Annotation the CronJob controller sets on each Job with its scheduled time.
pub const SCHEDULED_TIMESTAMP_ANNOTATION: &str = "batch.kubernetes.io/cronjob-scheduled-timestamp";

/// Generate the CronJob for an instance, or `None` without a schedule.
pub fn generate_refresh_job(spec: &InstanceSpec) -> Option<CronJob> {
    let schedule = spec.refresh_schedule.clone()?;
    let labels = standard_labels(&spec.name, Component::RefreshJob);

    Some(CronJob {
        metadata: owned_metadata(spec, refresh_job_name(&spec.name), Component::RefreshJob),
        spec: Some(CronJobSpec {
            schedule,
            time_zone: Some(TIME_ZONE.to_string()),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(1),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(pipeline_job_spec(spec, labels)),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// When the Job was scheduled: the CronJob annotation, or its creation time.
pub fn job_scheduled_at(job: &Job) -> Option<jiff::Timestamp> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a: &BTreeMap<String, String>| a.get(SCHEDULED_TIMESTAMP_ANNOTATION))
        .and_then(|ts| ts.parse().ok())
        .or_else(|| job.metadata.creation_timestamp.as_ref().map(|t| t.0))
}
