//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the resource clients, the event recorder, the refresh scheduler, per
//! instance cancellation tokens and the tunables of a reconciliation pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube::Resource;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::Clients;
use crate::crd::Motis;
use crate::health::HealthState;
use crate::scheduler::{Clock, RefreshScheduler};

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "motis-operator";

/// Finalizer guarding explicit cascade deletion of owned objects.
pub const FINALIZER: &str = "motis.motis-project.de/cleanup";

/// Tunables of a reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Upper bound on every cluster call.
    pub call_timeout: Duration,
    /// Transient failures tolerated before an instance is marked Failed.
    pub retry_budget: u32,
    /// How long a triggered refresh may wait for its Job to appear.
    pub refresh_start_deadline: Duration,
    /// How long the workload may take to serve the data of a completed
    /// refresh Job.
    pub refresh_rollout_deadline: Duration,
    /// Re-check interval for a Ready instance.
    pub ready_requeue: Duration,
    /// Re-check interval while waiting for rollouts or refresh Jobs.
    pub progress_requeue: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            retry_budget: 5,
            refresh_start_deadline: Duration::from_secs(600),
            refresh_rollout_deadline: Duration::from_secs(600),
            ready_requeue: Duration::from_secs(300),
            progress_requeue: Duration::from_secs(10),
        }
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Typed clients for every managed kind
    pub clients: Clients,
    /// Kubernetes client for publishing events; absent in tests
    client: Option<Client>,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    pub scheduler: Arc<RefreshScheduler>,
    pub clock: Clock,
    pub settings: ReconcileSettings,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Context {
    /// Create a new context
    pub fn new(clients: Clients, clock: Clock, settings: ReconcileSettings) -> Self {
        Self {
            clients,
            client: None,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state: None,
            scheduler: Arc::new(RefreshScheduler::new(clock.clone())),
            clock,
            settings,
            cancellations: Arc::default(),
        }
    }

    /// Publish Kubernetes events through `client`.
    pub fn with_event_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    /// Cancellation token for the passes of `name`.
    pub async fn cancellation_token(&self, name: &str) -> CancellationToken {
        self.cancellations
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Abort in-flight passes of `name`. New passes see the token cancelled
    /// until [`Context::clear_cancellation`] is called.
    pub async fn cancel(&self, name: &str) {
        self.cancellations
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .cancel();
    }

    /// Drop the token of `name` once its deletion has completed.
    pub async fn clear_cancellation(&self, name: &str) {
        self.cancellations.lock().await.remove(name);
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event(
        &self,
        resource: &Motis,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event(
        &self,
        resource: &Motis,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish(
        &self,
        resource: &Motis,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let Some(client) = &self.client else {
            tracing::debug!(reason = %reason, action = %action, note = ?note, "Event (not published)");
            return;
        };
        let recorder = Recorder::new(client.clone(), self.reporter.clone());
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
