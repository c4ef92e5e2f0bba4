//! Data pipeline run by the import Job and the refresh CronJob.
//!
//! A pipeline pod downloads the sources listed in the ConfigMap into
//! `/input` and preprocesses them into `/data`. Both mounts point at a
//! directory of the persistent volumes named after the Job's uid, so every
//! run produces a new data revision next to the one being served.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodAffinity,
    PodAffinityTerm, PodSpec, PodTemplateSpec, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::controller::validation::InstanceSpec;
use crate::resources::common::{Component, selector_labels};
use crate::resources::configmap::{CONFIG_MOUNT_PATH, CONFIG_VOLUME};
use crate::resources::storage::{
    DATA_MOUNT_PATH, DATA_VOLUME, INPUT_MOUNT_PATH, INPUT_VOLUME, pod_volumes,
};

/// Environment variable holding the revision a pipeline pod writes.
pub const REVISION_ENV: &str = "DATA_REVISION";

/// Label the Job controller puts on the pods of a Job.
const JOB_UID_LABEL: &str = "batch.kubernetes.io/controller-uid";

const BACKOFF_LIMIT: i32 = 2;

/// Engine invocation shared by preprocessing and serving.
pub fn motis_command() -> Vec<String> {
    [
        "/motis/motis",
        "--system_config",
        "/system_config.ini",
        "-c",
        "/config/config.ini",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

pub(crate) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Mount of the revision directory the running Job writes.
fn revision_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        sub_path_expr: Some(format!("$({REVISION_ENV})")),
        ..mount(name, path)
    }
}

fn revision_env() -> Vec<EnvVar> {
    vec![EnvVar {
        name: REVISION_ENV.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: format!("metadata.labels['{JOB_UID_LABEL}']"),
                api_version: None,
            }),
            ..Default::default()
        }),
        value: None,
    }]
}

/// Container downloading the sources into the revision's input directory.
fn download_container(spec: &InstanceSpec) -> Container {
    Container {
        name: "motis-init".to_string(),
        image: Some(spec.image.init.clone()),
        image_pull_policy: spec.image.pull_policy.clone(),
        env: Some(revision_env()),
        volume_mounts: Some(vec![
            mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
            revision_mount(INPUT_VOLUME, INPUT_MOUNT_PATH),
        ]),
        ..Default::default()
    }
}

/// Container turning the revision's input into engine data and exiting.
fn preprocess_container(spec: &InstanceSpec) -> Container {
    let mut command = motis_command();
    command.extend(["--mode".to_string(), "test".to_string()]);
    Container {
        name: "motis-preprocess".to_string(),
        image: Some(spec.image.motis.clone()),
        image_pull_policy: spec.image.pull_policy.clone(),
        command: Some(command),
        env: Some(revision_env()),
        volume_mounts: Some(vec![
            revision_mount(DATA_VOLUME, DATA_MOUNT_PATH),
            revision_mount(INPUT_VOLUME, INPUT_MOUNT_PATH),
            mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
        ]),
        ..Default::default()
    }
}

/// Prefer the node of the serving pod: the volumes are ReadWriteOnce.
fn near_workload(spec: &InstanceSpec) -> Affinity {
    Affinity {
        pod_affinity: Some(PodAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(selector_labels(&spec.name, Component::Workload)),
                            ..Default::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Job spec running the pipeline once, with pods labelled `labels`.
pub fn pipeline_job_spec(spec: &InstanceSpec, labels: BTreeMap<String, String>) -> JobSpec {
    JobSpec {
        backoff_limit: Some(BACKOFF_LIMIT),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                init_containers: Some(vec![download_container(spec)]),
                containers: vec![preprocess_container(spec)],
                volumes: Some(pod_volumes(spec)),
                affinity: Some(near_workload(spec)),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

/// Outcome of a pipeline Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

/// Read the outcome from the Job's terminal conditions.
pub fn job_outcome(job: &Job) -> JobOutcome {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    let is_true = |kind: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == kind && c.status == "True")
    };
    if is_true("Complete") {
        JobOutcome::Succeeded
    } else if is_true("Failed") {
        JobOutcome::Failed
    } else {
        JobOutcome::Running
    }
}

/// Revision a succeeded Job produced.
pub fn job_revision(job: &Job) -> Option<String> {
    (job_outcome(job) == JobOutcome::Succeeded)
        .then(|| job.metadata.uid.clone())
        .flatten()
}
