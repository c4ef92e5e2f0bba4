//! Resource generation module.
//!
//! Contains utilities for generating Kubernetes resources owned by a `Motis`
//! instance.
//!
//! ## Resources Generated
//!
//! | Resource | Name | Purpose |
//! |----------|------|---------|
//! | ConfigMap | `<name>-config` | Engine config and source URLs |
//! | PersistentVolumeClaim | `<name>-input`, `<name>-data` | Downloaded sources and preprocessed data, one directory per revision |
//! | Job | `<name>-import` | Imports the data for the current sources |
//! | Deployment | `<name>-workload` | Serves the current data revision |
//! | CronJob | `<name>-refresh-job` | Scheduled data refresh (optional) |

pub mod common;
pub mod configmap;
pub mod import_job;
pub mod pipeline;
pub mod refresh_job;
pub mod storage;
pub mod translator;
pub mod workload;

pub use common::{owner_reference, standard_labels};
pub use translator::{DesiredObjects, TranslateError, translate};
