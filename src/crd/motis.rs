//! Motis Custom Resource Definition.
//!
//! A `Motis` object declares one MOTIS routing-engine instance: where its
//! timetable and map data come from, how often that data is refreshed and the
//! engine configuration. The operator derives a ConfigMap, two volumes, a data
//! import Job, a Deployment and an optional CronJob from it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Motis is a custom resource for running a MOTIS routing engine.
///
/// Example:
/// ```yaml
/// apiVersion: motis.motis-project.de/v1alpha1
/// kind: Motis
/// metadata:
///   name: motis-hessen
/// spec:
///   scheduleUrl: https://example.org/gtfs.zip
///   osmUrl: https://example.org/map.pbf
///   refreshSchedule: "0 3 * * *"
///   config: |
///     [server]
///     port=8080
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "motis.motis-project.de",
    version = "v1alpha1",
    kind = "Motis",
    plural = "motis",
    shortname = "mo",
    status = "MotisStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Refresh", "type":"string", "jsonPath":".spec.refreshSchedule"}"#,
    printcolumn = r#"{"name":"Last Refresh", "type":"string", "jsonPath":".status.lastRefreshAt"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MotisSpec {
    /// URL of the timetable (GTFS/HAFAS zip) the instance serves.
    pub schedule_url: String,

    /// URL of the OpenStreetMap extract (`.osm.pbf`).
    pub osm_url: String,

    /// Cron expression for periodic data refresh (UTC).
    /// Absent means the data is fetched once at provisioning time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_schedule: Option<String>,

    /// MOTIS configuration file (`config.ini`), stored verbatim.
    #[serde(default)]
    pub config: String,

    /// Container images used for the engine and the data downloader.
    #[serde(default)]
    pub image: ImageSpec,
}

/// Container images for an instance.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Routing engine image.
    #[serde(default = "default_motis_image")]
    pub motis: String,

    /// Image of the init container that downloads the source data.
    #[serde(default = "default_init_image")]
    pub init: String,

    /// Image pull policy applied to both images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            motis: default_motis_image(),
            init: default_init_image(),
            pull_policy: None,
        }
    }
}

fn default_motis_image() -> String {
    "ghcr.io/motis-project/motis:latest".to_string()
}

fn default_init_image() -> String {
    "ghcr.io/vstollen/motis-init:0.1.1".to_string()
}

/// Observed state of a Motis instance. Written only by the operator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MotisStatus {
    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: Phase,

    /// When the last reconciliation pass changed anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_at: Option<String>,

    /// When source data was last fetched successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<String>,

    /// Last failure message, cleared on successful reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// The generation most recently processed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Scheduled fire time of the refresh currently in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_started_at: Option<String>,

    /// When the instance last became Ready after a spec change or retry.
    /// Refreshes are only scheduled after this point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<String>,

    /// Data revision the workload is expected to run with: the uid of the
    /// Job that built it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_revision: Option<String>,

    /// Hash of the sources and images `data_revision` was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,

    /// Last retry request acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_observed: Option<String>,

    /// Conditions describing the current state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Lifecycle phase of a Motis instance.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    /// Accepted, not yet picked up by the controller.
    #[default]
    Pending,
    /// Owned objects are being created or updated.
    Provisioning,
    /// All owned objects exist and the workload is serving.
    Ready,
    /// A scheduled data refresh is running; the old workload keeps serving.
    RefreshingData,
    /// Reconciliation failed; waiting for a new spec revision or a retry.
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Provisioning => write!(f, "Provisioning"),
            Phase::Ready => write!(f, "Ready"),
            Phase::RefreshingData => write!(f, "RefreshingData"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

impl Phase {
    /// All phases, in lifecycle order.
    pub const ALL: [Phase; 5] = [
        Phase::Pending,
        Phase::Provisioning,
        Phase::Ready,
        Phase::RefreshingData,
        Phase::Failed,
    ];
}

/// Condition describes the state of an instance at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }

    /// Create a "Degraded" condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Degraded", degraded, reason, message, generation)
    }

    /// Compare everything except the transition time.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}
