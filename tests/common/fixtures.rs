//! Test fixtures and builder patterns for Motis instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use motis_operator::client::InMemoryCluster;
use motis_operator::controller::context::{Context, ReconcileSettings};
use motis_operator::controller::reconciler::{Action, reconcile};
use motis_operator::crd::{ImageSpec, Motis, MotisSpec, Phase};
use motis_operator::resources::common::{
    COMPONENT_LABEL, Component, INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL, import_job_name,
    refresh_job_name, workload_name,
};
use motis_operator::resources::refresh_job::SCHEDULED_TIMESTAMP_ANNOTATION;
use motis_operator::scheduler::Clock;

pub const HESSEN_GTFS: &str = "https://example.org/hessen/gtfs.zip";
pub const HESSEN_OSM: &str = "https://download.example.org/hessen-latest.osm.pbf";

/// Builder for creating Motis test fixtures.
///
/// # Example
/// ```
/// let motis = MotisBuilder::new("motis-hessen")
///     .refresh_schedule("0 3 * * *")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct MotisBuilder {
    name: String,
    namespace: String,
    schedule_url: String,
    osm_url: String,
    refresh_schedule: Option<String>,
    config: String,
    image: ImageSpec,
}

impl MotisBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            schedule_url: HESSEN_GTFS.to_string(),
            osm_url: HESSEN_OSM.to_string(),
            refresh_schedule: None,
            config: "server:\n  port: 8080\n".to_string(),
            image: ImageSpec::default(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn schedule_url(mut self, url: impl Into<String>) -> Self {
        self.schedule_url = url.into();
        self
    }

    pub fn osm_url(mut self, url: impl Into<String>) -> Self {
        self.osm_url = url.into();
        self
    }

    pub fn refresh_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.refresh_schedule = Some(schedule.into());
        self
    }

    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    pub fn spec(&self) -> MotisSpec {
        MotisSpec {
            schedule_url: self.schedule_url.clone(),
            osm_url: self.osm_url.clone(),
            refresh_schedule: self.refresh_schedule.clone(),
            config: self.config.clone(),
            image: self.image.clone(),
        }
    }

    pub fn build(self) -> Motis {
        let mut motis = Motis::new(&self.name, self.spec());
        motis.metadata.namespace = Some(self.namespace);
        motis
    }
}

/// An in-memory cluster, a manual clock and a controller context over both.
pub struct Harness {
    pub cluster: InMemoryCluster,
    pub clock: Clock,
    pub ctx: Arc<Context>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// The in-memory store stamps real creation times, so the manual clock
    /// starts at the current time.
    pub fn new() -> Self {
        Self::with_settings(ReconcileSettings::default())
    }

    pub fn with_settings(settings: ReconcileSettings) -> Self {
        let cluster = InMemoryCluster::new();
        let clock = Clock::manual(Timestamp::now());
        let ctx = Arc::new(Context::new(cluster.clients(), clock.clone(), settings));
        Self {
            cluster,
            clock,
            ctx,
        }
    }

    pub async fn declare(&self, motis: Motis) -> Motis {
        use motis_operator::client::ResourceClient;
        self.cluster
            .instances
            .create(&motis)
            .await
            .expect("instance should be created")
    }

    pub async fn pass(&self, name: &str) -> Action {
        reconcile(name, &self.ctx)
            .await
            .expect("reconciliation pass should succeed")
    }

    pub fn instance(&self, name: &str) -> Motis {
        self.cluster
            .instances
            .object(name)
            .expect("instance should exist")
    }

    pub fn phase(&self, name: &str) -> Phase {
        self.instance(name)
            .status
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Simulate the Deployment controller finishing a rollout.
    pub fn roll_out(&self, name: &str) -> bool {
        self.cluster.workloads.mutate(&workload_name(name), |deployment| {
            let generation = deployment.metadata.generation;
            deployment.status = Some(DeploymentStatus {
                observed_generation: generation,
                replicas: Some(1),
                updated_replicas: Some(1),
                ready_replicas: Some(1),
                available_replicas: Some(1),
                ..Default::default()
            });
        })
    }

    /// Simulate a pod crash: the workload has no available replica.
    pub fn break_workload(&self, name: &str) -> bool {
        self.cluster.workloads.mutate(&workload_name(name), |deployment| {
            if let Some(status) = deployment.status.as_mut() {
                status.available_replicas = Some(0);
                status.ready_replicas = Some(0);
            }
        })
    }

    /// Simulate the Job controller finishing the import Job.
    pub fn complete_import(&self, name: &str, succeeded: bool) -> bool {
        self.cluster.jobs.mutate(&import_job_name(name), |job| {
            job.status = Some(JobStatus {
                conditions: Some(job_conditions(succeeded)),
                ..Default::default()
            });
        })
    }

    /// Drive an instance through import and provisioning to Ready.
    pub async fn converge(&self, name: &str) {
        for _ in 0..6 {
            self.pass(name).await;
            if self.phase(name) == Phase::Ready {
                return;
            }
            self.complete_import(name, true);
            self.roll_out(name);
        }
        assert_eq!(self.phase(name), Phase::Ready, "instance should converge");
    }

    /// Seed a Job as the CronJob controller would create it for `scheduled_at`.
    /// Returns the uid of the Job, which names the revision it writes.
    pub fn seed_refresh_job(&self, name: &str, scheduled_at: Timestamp, outcome: Option<bool>) -> String {
        let job = refresh_job(name, scheduled_at, outcome);
        let job_name = job.metadata.name.clone().expect("refresh Job has a name");
        self.cluster.jobs.seed(job);
        self.cluster
            .jobs
            .object(&job_name)
            .and_then(|job| job.metadata.uid)
            .expect("seeded Job has a uid")
    }

    /// Move the manual clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

fn job_conditions(succeeded: bool) -> Vec<JobCondition> {
    vec![JobCondition {
        type_: if succeeded { "Complete" } else { "Failed" }.to_string(),
        status: "True".to_string(),
        ..Default::default()
    }]
}

/// A Job spawned by the refresh CronJob. `outcome` is `Some(true)` for
/// Complete, `Some(false)` for Failed and `None` while running. A
/// succeeded Job completes at its scheduled time.
pub fn refresh_job(name: &str, scheduled_at: Timestamp, outcome: Option<bool>) -> Job {
    let conditions = outcome.map(job_conditions);
    let completion_time = (outcome == Some(true)).then_some(Time(scheduled_at));
    Job {
        metadata: ObjectMeta {
            name: Some(format!(
                "{}-{}",
                refresh_job_name(name),
                scheduled_at.as_second() / 60
            )),
            labels: Some(BTreeMap::from([
                (INSTANCE_LABEL.to_string(), name.to_string()),
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                (
                    COMPONENT_LABEL.to_string(),
                    Component::RefreshJob.as_str().to_string(),
                ),
            ])),
            annotations: Some(BTreeMap::from([(
                SCHEDULED_TIMESTAMP_ANNOTATION.to_string(),
                scheduled_at.to_string(),
            )])),
            ..Default::default()
        },
        status: Some(JobStatus {
            conditions,
            completion_time,
            ..Default::default()
        }),
        ..Default::default()
    }
}
