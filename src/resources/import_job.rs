//! One-shot Job importing the data of an instance.
//!
//! The import Job runs the pipeline once for the current sources. It carries
//! the [`data_hash`] it was created for; a Job for an older hash is replaced.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;

use crate::controller::validation::InstanceSpec;
use crate::resources::common::{
    Component, DATA_HASH_ANNOTATION, data_hash, import_job_name, owned_metadata, standard_labels,
};
use crate::resources::pipeline::pipeline_job_spec;

/// Generate the import Job for the current sources of an instance.
pub fn generate_import_job(spec: &InstanceSpec) -> Job {
    let mut metadata = owned_metadata(spec, import_job_name(&spec.name), Component::Import);
    metadata.annotations = Some(BTreeMap::from([(
        DATA_HASH_ANNOTATION.to_string(),
        data_hash(spec),
    )]));
    Job {
        metadata,
        spec: Some(pipeline_job_spec(
            spec,
            standard_labels(&spec.name, Component::Import),
        )),
        ..Default::default()
    }
}

/// The data hash an import Job was created for.
pub fn import_hash(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()?
        .get(DATA_HASH_ANNOTATION)
        .map(String::as_str)
}
