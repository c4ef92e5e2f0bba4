//! Translation of a validated instance into the objects that realize it.
//!
//! [`translate`] is pure and deterministic: the same [`InstanceSpec`] always
//! yields byte-identical objects, which is what lets the reconciler detect
//! "nothing to do" by diffing.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use thiserror::Error;

use crate::controller::validation::{self, InstanceSpec, ValidationError};
use crate::resources::configmap::generate_config_map;
use crate::resources::import_job::generate_import_job;
use crate::resources::refresh_job::generate_refresh_job;
use crate::resources::storage::generate_volumes;
use crate::resources::workload::generate_workload;

/// Translation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

impl From<ValidationError> for TranslateError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidName { name, reason } => {
                TranslateError::InvalidName { name, reason }
            }
            other => TranslateError::InvalidName {
                name: String::new(),
                reason: other.to_string(),
            },
        }
    }
}

/// Everything an instance consists of.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObjects {
    pub config_map: ConfigMap,
    pub volumes: Vec<PersistentVolumeClaim>,
    /// Import Job for the current sources, created only while they are not
    /// imported yet.
    pub import_job: Job,
    /// Present only once a data revision exists.
    pub workload: Option<Deployment>,
    /// Present only when a refresh schedule is set.
    pub refresh_job: Option<CronJob>,
}

/// Map an instance declaration onto its owned objects.
pub fn translate(spec: &InstanceSpec) -> Result<DesiredObjects, TranslateError> {
    validation::validate_name(&spec.name)?;
    validation::validate_name_fits_import(&spec.name)?;
    if spec.refresh_schedule.is_some() {
        validation::validate_name_fits_schedule(&spec.name)?;
    }

    Ok(DesiredObjects {
        config_map: generate_config_map(spec),
        volumes: generate_volumes(spec),
        import_job: generate_import_job(spec),
        workload: generate_workload(spec),
        refresh_job: generate_refresh_job(spec),
    })
}
