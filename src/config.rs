//! Operator configuration.
//!
//! Every setting is a command-line flag with an environment fallback, so the
//! operator can be configured from its Deployment manifest alone.

use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::api::DEFAULT_API_PORT;
use crate::controller::context::ReconcileSettings;
use crate::controller::queue::BackoffPolicy;
use crate::controller::runner::DEFAULT_WORKERS;
use crate::health::DEFAULT_HEALTH_PORT;
use crate::webhooks::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT};

#[derive(Parser, Debug, Clone)]
#[command(name = "motis-operator", version, about = "Provisions and refreshes MOTIS instances")]
pub struct OperatorConfig {
    /// Namespace to manage. Defaults to the operator pod's namespace.
    #[arg(long, env = "MOTIS_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "MOTIS_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    #[arg(long, env = "MOTIS_HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    /// Concurrent reconciliations.
    #[arg(long, env = "MOTIS_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Transient failures tolerated before an instance is marked Failed.
    #[arg(long, env = "MOTIS_RETRY_BUDGET", default_value_t = 5)]
    pub retry_budget: u32,

    /// Upper bound on each cluster call, in seconds.
    #[arg(long, env = "MOTIS_CALL_TIMEOUT_SECS", default_value_t = 10)]
    pub call_timeout_secs: u64,

    /// Cap on the retry backoff, in seconds.
    #[arg(long, env = "MOTIS_MAX_BACKOFF_SECS", default_value_t = 300)]
    pub max_backoff_secs: u64,

    /// How long a triggered refresh may wait for its Job, in seconds.
    #[arg(long, env = "MOTIS_REFRESH_START_DEADLINE_SECS", default_value_t = 600)]
    pub refresh_start_deadline_secs: u64,

    /// How long the workload may take to serve refreshed data once the
    /// refresh Job completed, in seconds.
    #[arg(long, env = "MOTIS_REFRESH_ROLLOUT_DEADLINE_SECS", default_value_t = 600)]
    pub refresh_rollout_deadline_secs: u64,

    /// Re-check interval for Ready instances, in seconds.
    #[arg(long, env = "MOTIS_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    #[arg(long, env = "MOTIS_LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    pub leader_election: bool,

    #[arg(long, env = "MOTIS_WEBHOOK_PORT", default_value_t = WEBHOOK_PORT)]
    pub webhook_port: u16,

    #[arg(long, env = "MOTIS_WEBHOOK_CERT", default_value = WEBHOOK_CERT_PATH)]
    pub webhook_cert: String,

    #[arg(long, env = "MOTIS_WEBHOOK_KEY", default_value = WEBHOOK_KEY_PATH)]
    pub webhook_key: String,
}

impl OperatorConfig {
    /// Managed namespace: the flag, else `POD_NAMESPACE`, else `default`.
    pub fn resolve_namespace(&self) -> String {
        self.namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            retry_budget: self.retry_budget,
            refresh_start_deadline: Duration::from_secs(self.refresh_start_deadline_secs),
            refresh_rollout_deadline: Duration::from_secs(self.refresh_rollout_deadline_secs),
            ready_requeue: Duration::from_secs(self.resync_secs),
            ..ReconcileSettings::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max: Duration::from_secs(self.max_backoff_secs),
            ..BackoffPolicy::default()
        }
    }
}
