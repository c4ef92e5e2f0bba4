//! Validation of instance declarations.
//!
//! Turns a raw [`MotisSpec`] (from the API, the admission webhook or a
//! `Motis` object reaching the controller) into a validated [`InstanceSpec`].
//! The rules:
//! - the name is a DNS label that leaves room for the import Job suffix
//! - with a refresh schedule, the name leaves room for the CronJob suffix
//! - source URLs are absolute `http`/`https` URLs
//! - the refresh schedule, if any, is a cron expression that fires

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::crd::{ImageSpec, Motis, MotisSpec};
use crate::resources::common::{RETRY_ANNOTATION, import_job_name, refresh_job_name};
use crate::scheduler::{CronError, CronSchedule};

/// Maximum length of a DNS label.
pub const MAX_NAME_LENGTH: usize = 63;

/// Maximum length of a Job name. The Job controller copies it into a label.
pub const MAX_JOB_NAME_LENGTH: usize = 63;

/// Maximum length of a CronJob name. The CronJob controller appends up to 11
/// characters to the names of the Jobs it creates.
pub const MAX_CRONJOB_NAME_LENGTH: usize = 52;

static DNS_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").ok());

/// Validation failures. All of them are input errors and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("invalid refreshSchedule: {0}")]
    InvalidSchedule(#[from] CronError),
}

impl ValidationError {
    /// Machine-readable reason, used by the API and the webhook.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InvalidName { .. } => "InvalidName",
            ValidationError::InvalidUrl { .. } => "InvalidUrl",
            ValidationError::InvalidSchedule(_) => "InvalidSchedule",
        }
    }
}

/// A validated instance declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    pub name: String,
    pub namespace: String,
    /// uid of the owning `Motis` object, when it exists.
    pub uid: Option<String>,
    pub schedule_url: String,
    pub osm_url: String,
    /// Normalized cron expression; `None` means one-shot.
    pub refresh_schedule: Option<String>,
    pub config_text: String,
    pub image: ImageSpec,
    /// Revision of the data the workload should run with.
    pub data_revision: Option<String>,
}

impl InstanceSpec {
    /// Validate a declaration that has no backing object yet.
    pub fn validate(
        name: &str,
        namespace: &str,
        spec: &MotisSpec,
    ) -> Result<Self, ValidationError> {
        validate_name(name)?;
        validate_name_fits_import(name)?;
        validate_url("scheduleUrl", &spec.schedule_url)?;
        validate_url("osmUrl", &spec.osm_url)?;
        let refresh_schedule = normalize_schedule(spec.refresh_schedule.as_deref())?;
        if refresh_schedule.is_some() {
            validate_name_fits_schedule(name)?;
        }

        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: None,
            schedule_url: spec.schedule_url.trim().to_string(),
            osm_url: spec.osm_url.trim().to_string(),
            refresh_schedule,
            config_text: spec.config.clone(),
            image: spec.image.clone(),
            data_revision: None,
        })
    }

    /// Validate a stored `Motis` object, carrying over its uid and data revision.
    pub fn from_resource(resource: &Motis) -> Result<Self, ValidationError> {
        let name = resource.metadata.name.clone().unwrap_or_default();
        let namespace = resource
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let mut spec = Self::validate(&name, &namespace, &resource.spec)?;
        spec.uid = resource.metadata.uid.clone();
        spec.data_revision = resource
            .status
            .as_ref()
            .and_then(|s| s.data_revision.clone());
        Ok(spec)
    }

    /// Parsed refresh schedule.
    pub fn schedule(&self) -> Option<CronSchedule> {
        self.refresh_schedule
            .as_deref()
            .and_then(|s| CronSchedule::parse(s).ok())
    }
}

/// Check that `name` is a DNS label.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid(&format!(
            "must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    let matches = DNS_LABEL
        .as_ref()
        .is_some_and(|re| re.is_match(name));
    if !matches {
        return Err(invalid(
            "must consist of lowercase alphanumeric characters or '-', and start and end with an alphanumeric character",
        ));
    }
    Ok(())
}

/// Check that the import Job name derived from `name` is short enough.
pub fn validate_name_fits_import(name: &str) -> Result<(), ValidationError> {
    let job_name = import_job_name(name);
    if job_name.len() > MAX_JOB_NAME_LENGTH {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: format!("import job name '{job_name}' exceeds {MAX_JOB_NAME_LENGTH} characters"),
        });
    }
    Ok(())
}

/// Check that the refresh CronJob name derived from `name` is short enough.
pub fn validate_name_fits_schedule(name: &str) -> Result<(), ValidationError> {
    let job_name = refresh_job_name(name);
    if job_name.len() > MAX_CRONJOB_NAME_LENGTH {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: format!(
                "refresh job name '{job_name}' exceeds {MAX_CRONJOB_NAME_LENGTH} characters"
            ),
        });
    }
    Ok(())
}

/// Check that `value` is an absolute http(s) URL.
pub fn validate_url(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let parsed = url::Url::parse(value.trim()).map_err(|e| ValidationError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(()),
        "http" | "https" => Err(ValidationError::InvalidUrl {
            field,
            reason: "missing host".to_string(),
        }),
        other => Err(ValidationError::InvalidUrl {
            field,
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Empty or blank schedules mean one-shot; anything else must parse.
pub fn normalize_schedule(schedule: Option<&str>) -> Result<Option<String>, ValidationError> {
    match schedule.map(str::trim) {
        None | Some("") => Ok(None),
        Some(expression) => {
            CronSchedule::parse(expression)?;
            Ok(Some(expression.to_string()))
        }
    }
}

/// Check if generation has changed (spec update)
pub fn generation_changed(resource: &Motis) -> bool {
    let generation = resource.metadata.generation;
    let observed = resource.status.as_ref().and_then(|s| s.observed_generation);

    match (generation, observed) {
        (Some(current_gen), Some(obs)) => current_gen != obs,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Whether a retry was requested that no pass has acted on yet.
pub fn retry_requested(resource: &Motis) -> bool {
    let requested = resource
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(RETRY_ANNOTATION));
    let observed = resource
        .status
        .as_ref()
        .and_then(|s| s.retry_observed.as_ref());
    requested.is_some() && requested != observed
}

/// Whether the declaration changed or was resubmitted since the last pass.
pub fn change_requested(resource: &Motis) -> bool {
    generation_changed(resource) || retry_requested(resource)
}
