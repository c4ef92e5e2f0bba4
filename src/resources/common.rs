//! Common resource generation utilities.
//!
//! Names, labels and owner references shared by every object the operator
//! derives from a `Motis` instance.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use sha2::{Digest, Sha256};

use crate::controller::validation::InstanceSpec;

/// API version of the owning custom resource.
pub const API_VERSION: &str = "motis.motis-project.de/v1alpha1";
/// Kind of the owning custom resource.
pub const KIND: &str = "Motis";

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub const APP_NAME: &str = "motis";
pub const MANAGED_BY: &str = "motis-operator";

/// Pod template annotation holding a hash of everything the pods consume.
pub const CONFIG_HASH_ANNOTATION: &str = "motis-project.de/config-hash";
/// Pod template annotation holding the data revision the pods were built from.
pub const DATA_REVISION_ANNOTATION: &str = "motis-project.de/data-revision";
/// Annotation on the import Job holding the [`data_hash`] it imports.
pub const DATA_HASH_ANNOTATION: &str = "motis-project.de/data-hash";
/// Annotation on a `Motis` object requesting a retry of a Failed instance.
pub const RETRY_ANNOTATION: &str = "motis-project.de/retry-requested-at";

/// Role of an owned object, used as the component label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Config,
    Storage,
    Import,
    Workload,
    RefreshJob,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Config => "config",
            Component::Storage => "storage",
            Component::Import => "import",
            Component::Workload => "workload",
            Component::RefreshJob => "refresh-job",
        }
    }
}

pub fn config_map_name(name: &str) -> String {
    format!("{name}-config")
}

pub fn input_volume_name(name: &str) -> String {
    format!("{name}-input")
}

pub fn data_volume_name(name: &str) -> String {
    format!("{name}-data")
}

pub fn import_job_name(name: &str) -> String {
    format!("{name}-import")
}

pub fn workload_name(name: &str) -> String {
    format!("{name}-workload")
}

pub fn refresh_job_name(name: &str) -> String {
    format!("{name}-refresh-job")
}

/// Label selector matching every object owned by instance `name`.
pub fn instance_selector(name: &str) -> String {
    format!("{INSTANCE_LABEL}={name},{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// Label selector matching the objects of one component of instance `name`.
pub fn component_selector(name: &str, component: Component) -> String {
    format!(
        "{},{COMPONENT_LABEL}={}",
        instance_selector(name),
        component.as_str()
    )
}

/// Labels selecting the pods of one component. Stable across spec changes.
pub fn selector_labels(name: &str, component: Component) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), APP_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), name.to_string()),
        (COMPONENT_LABEL.to_string(), component.as_str().to_string()),
    ])
}

/// Standard labels applied to all managed resources
pub fn standard_labels(name: &str, component: Component) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name, component);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

/// Controller owner reference pointing at the `Motis` object.
/// Absent until the object has a uid.
pub fn owner_reference(spec: &InstanceSpec) -> Option<OwnerReference> {
    spec.uid.as_ref().map(|uid| OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: spec.name.clone(),
        uid: uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Whether `meta` names the `Motis` object with `uid` as its controller.
/// Objects of an instance without a uid cannot be told apart and count as owned.
pub fn is_owned_by(meta: &ObjectMeta, uid: Option<&str>) -> bool {
    let Some(uid) = uid else {
        return true;
    };
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.kind == KIND && owner.uid == uid)
}

/// Metadata for an owned object.
pub fn owned_metadata(spec: &InstanceSpec, object_name: String, component: Component) -> ObjectMeta {
    ObjectMeta {
        name: Some(object_name),
        namespace: Some(spec.namespace.clone()),
        labels: Some(standard_labels(&spec.name, component)),
        owner_references: owner_reference(spec).map(|owner| vec![owner]),
        ..Default::default()
    }
}

/// Hex SHA-256 of everything the workload pods read from the ConfigMap.
pub fn config_hash(spec: &InstanceSpec) -> String {
    let mut hasher = Sha256::new();
    for part in [&spec.config_text, &spec.schedule_url, &spec.osm_url] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of everything the imported data depends on. A change means
/// the data must be imported again.
pub fn data_hash(spec: &InstanceSpec) -> String {
    let mut hasher = Sha256::new();
    for part in [
        &spec.config_text,
        &spec.schedule_url,
        &spec.osm_url,
        &spec.image.motis,
        &spec.image.init,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
