//! Status management utilities.
//!
//! Provides helpers for building resource status conditions and the status
//! aggregator that reports instance state to API callers.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::client::Clients;
use crate::crd::{Condition, Motis, Phase};
use crate::resources::common::{config_map_name, refresh_job_name, workload_name};
use crate::resources::workload::is_rolled_out;

/// Standard conditions for a phase.
pub fn conditions_for_phase(
    phase: Phase,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) -> Vec<Condition> {
    let ready = matches!(phase, Phase::Ready | Phase::RefreshingData);
    let progressing = matches!(
        phase,
        Phase::Pending | Phase::Provisioning | Phase::RefreshingData
    );
    vec![
        Condition::ready(ready, reason, message, generation),
        Condition::progressing(progressing, reason, message, generation),
        Condition::degraded(phase == Phase::Failed, reason, message, generation),
    ]
}

/// Keep the transition time of conditions whose state did not change, so an
/// unchanged status serializes identically across passes.
pub fn carry_transition_times(previous: &[Condition], next: Vec<Condition>) -> Vec<Condition> {
    next.into_iter()
        .map(|condition| {
            match previous.iter().find(|p| p.same_state(&condition)) {
                Some(old) => Condition {
                    last_transition_time: old.last_transition_time.clone(),
                    ..condition
                },
                None => condition,
            }
        })
        .collect()
}

/// Live owned objects of one instance.
#[derive(Debug, Clone, Default)]
pub struct ObservedObjects {
    pub config_map: Option<ConfigMap>,
    pub workload: Option<Deployment>,
    pub refresh_job: Option<CronJob>,
}

impl ObservedObjects {
    pub fn is_empty(&self) -> bool {
        self.config_map.is_none() && self.workload.is_none() && self.refresh_job.is_none()
    }

    /// Whether the workload exists and serves.
    pub fn workload_available(&self) -> bool {
        self.workload.as_ref().is_some_and(is_rolled_out)
    }
}

/// Status reported for one instance by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub name: String,
    /// Phase name, or `Unknown` when the owned objects could not be read.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_schedule: Option<String>,
}

/// Status value used when owned objects could not be read.
pub const UNKNOWN_STATUS: &str = "Unknown";

fn summary(instance: &Motis, status: &str) -> InstanceSummary {
    let stored = instance.status.as_ref();
    InstanceSummary {
        name: instance.name_any(),
        status: status.to_string(),
        last_error: stored.and_then(|s| s.last_error.clone()),
        observed_generation: stored.and_then(|s| s.observed_generation),
        last_refresh_at: stored.and_then(|s| s.last_refresh_at.clone()),
        refresh_schedule: instance.spec.refresh_schedule.clone(),
    }
}

/// Derive the reported phase from the stored status and the live objects.
pub fn summarize(instance: &Motis, observed: &ObservedObjects) -> InstanceSummary {
    let stored = instance.status.as_ref();
    let phase = stored.map(|s| s.phase).unwrap_or_default();
    let stale = match (instance.metadata.generation, stored.and_then(|s| s.observed_generation)) {
        (Some(generation), Some(seen)) => seen < generation,
        (Some(_), None) => true,
        _ => false,
    };

    let derived = if phase == Phase::Failed && !stale {
        Phase::Failed
    } else if observed.is_empty() {
        Phase::Pending
    } else if stale {
        Phase::Provisioning
    } else if matches!(phase, Phase::Ready | Phase::RefreshingData) && observed.workload.is_none() {
        Phase::Provisioning
    } else {
        phase
    };
    summary(instance, &derived.to_string())
}

/// Read the owned objects of `instance` and summarize them. A failed read
/// yields [`UNKNOWN_STATUS`] instead of an error.
pub async fn summarize_instance(clients: &Clients, instance: &Motis) -> InstanceSummary {
    let name = instance.name_any();
    let (config_map, workload, refresh_job) = tokio::join!(
        clients.config_maps.get_opt(&config_map_name(&name)),
        clients.workloads.get_opt(&workload_name(&name)),
        clients.refresh_jobs.get_opt(&refresh_job_name(&name)),
    );
    match (config_map, workload, refresh_job) {
        (Ok(config_map), Ok(workload), Ok(refresh_job)) => summarize(
            instance,
            &ObservedObjects {
                config_map,
                workload,
                refresh_job,
            },
        ),
        (cm, wl, rj) => {
            let error = [cm.err(), wl.err(), rj.err()].into_iter().flatten().next();
            tracing::warn!(
                name = %name,
                error = ?error,
                "Failed to read owned objects, reporting unknown status"
            );
            summary(instance, UNKNOWN_STATUS)
        }
    }
}
