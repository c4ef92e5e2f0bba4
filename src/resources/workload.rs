//! Deployment generation for MOTIS instances.
//!
//! The workload only serves. It mounts the revision directories of the
//! persistent volumes that an import or refresh Job filled, so a restarted
//! pod comes back on the same data without downloading anything. Rolling
//! updates never take the serving pod down before its replacement is ready.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Probe, TCPSocketAction, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::controller::validation::InstanceSpec;
use crate::resources::common::{
    CONFIG_HASH_ANNOTATION, Component, DATA_REVISION_ANNOTATION, config_hash, owned_metadata,
    selector_labels, standard_labels, workload_name,
};
use crate::resources::configmap::{CONFIG_MOUNT_PATH, CONFIG_VOLUME};
use crate::resources::pipeline::{motis_command, mount};
use crate::resources::storage::{
    DATA_MOUNT_PATH, DATA_VOLUME, INPUT_MOUNT_PATH, INPUT_VOLUME, pod_volumes,
};

/// Port the engine serves on.
pub const HTTP_PORT: i32 = 8080;

fn revision_mounts(revision: &str) -> Vec<VolumeMount> {
    let at_revision = |name: &str, path: &str| VolumeMount {
        sub_path: Some(revision.to_string()),
        ..mount(name, path)
    };
    vec![
        at_revision(DATA_VOLUME, DATA_MOUNT_PATH),
        at_revision(INPUT_VOLUME, INPUT_MOUNT_PATH),
        mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
    ]
}

fn serving_container(spec: &InstanceSpec, revision: &str) -> Container {
    let probe = |initial_delay: i32| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(HTTP_PORT),
            host: None,
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        ..Default::default()
    };
    Container {
        name: "motis".to_string(),
        image: Some(spec.image.motis.clone()),
        image_pull_policy: spec.image.pull_policy.clone(),
        command: Some(motis_command()),
        ports: Some(vec![ContainerPort {
            container_port: HTTP_PORT,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(revision_mounts(revision)),
        readiness_probe: Some(probe(5)),
        liveness_probe: Some(probe(30)),
        ..Default::default()
    }
}

/// Pod template annotations. A change in either value rolls the pods.
fn pod_annotations(spec: &InstanceSpec, revision: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CONFIG_HASH_ANNOTATION.to_string(), config_hash(spec)),
        (DATA_REVISION_ANNOTATION.to_string(), revision.to_string()),
    ])
}

/// Generate the Deployment for an instance, or `None` while no data revision
/// exists to serve.
pub fn generate_workload(spec: &InstanceSpec) -> Option<Deployment> {
    let revision = spec.data_revision.as_deref()?;
    let name = workload_name(&spec.name);
    Some(Deployment {
        metadata: owned_metadata(spec, name, Component::Workload),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&spec.name, Component::Workload)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(0)),
                    max_surge: Some(IntOrString::Int(1)),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(&spec.name, Component::Workload)),
                    annotations: Some(pod_annotations(spec, revision)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![serving_container(spec, revision)],
                    volumes: Some(pod_volumes(spec)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Whether the Deployment has fully rolled out its current template and has
/// an available replica.
pub fn is_rolled_out(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let observed_current = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        _ => false,
    };
    observed_current
        && status.updated_replicas.unwrap_or(0) >= desired
        && status.available_replicas.unwrap_or(0) >= desired
        && status.replicas.unwrap_or(0) <= desired
}

/// Data revision annotation on the Deployment's pod template.
pub fn template_data_revision(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(DATA_REVISION_ANNOTATION)
        .map(String::as_str)
}
