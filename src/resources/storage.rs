//! Persistent volumes holding the downloaded sources and the preprocessed
//! data of an instance.
//!
//! Every pipeline run writes below a directory named after its data revision,
//! so a refresh never touches the files the serving pods read.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    Volume, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::controller::validation::InstanceSpec;
use crate::resources::common::{Component, data_volume_name, input_volume_name, owned_metadata};
use crate::resources::configmap::config_volume;

/// Requested size of each volume.
pub const VOLUME_SIZE: &str = "10Gi";

/// Volume holding the downloaded timetable and map extract.
pub const INPUT_VOLUME: &str = "input";
pub const INPUT_MOUNT_PATH: &str = "/input";
/// Volume holding the preprocessed engine data.
pub const DATA_VOLUME: &str = "data";
pub const DATA_MOUNT_PATH: &str = "/data";

fn claim(spec: &InstanceSpec, name: String) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: owned_metadata(spec, name, Component::Storage),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(VOLUME_SIZE.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The input and data claims of an instance.
pub fn generate_volumes(spec: &InstanceSpec) -> Vec<PersistentVolumeClaim> {
    vec![
        claim(spec, input_volume_name(&spec.name)),
        claim(spec, data_volume_name(&spec.name)),
    ]
}

/// Pod volumes for the config, input and data of an instance.
pub fn pod_volumes(spec: &InstanceSpec) -> Vec<Volume> {
    let persistent = |volume: &str, claim_name: String| Volume {
        name: volume.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name,
            read_only: None,
        }),
        ..Default::default()
    };
    vec![
        config_volume(spec),
        persistent(INPUT_VOLUME, input_volume_name(&spec.name)),
        persistent(DATA_VOLUME, data_volume_name(&spec.name)),
    ]
}
