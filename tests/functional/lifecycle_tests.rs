//! Provisioning, idempotence and spec changes of single instances.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use motis_operator::client::{ResourceClient, WriteKind};
use motis_operator::controller::context::FINALIZER;
use motis_operator::controller::queue::WorkQueue;
use motis_operator::controller::reconciler::Action;
use motis_operator::controller::runner::process;
use motis_operator::crd::Phase;
use motis_operator::resources::common::{
    CONFIG_HASH_ANNOTATION, config_map_name, data_volume_name, import_job_name,
    input_volume_name, refresh_job_name, workload_name,
};
use motis_operator::resources::configmap::{CONFIG_FILE_KEY, OSM_KEY, SCHEDULES_KEY};
use motis_operator::resources::workload::template_data_revision;

use crate::common::fixtures::{HESSEN_GTFS, HESSEN_OSM, Harness, MotisBuilder};

fn workload(harness: &Harness, name: &str) -> Option<Deployment> {
    harness.cluster.workloads.object(&workload_name(name))
}

fn pod_config_hash(harness: &Harness, name: &str) -> Option<String> {
    workload(harness, name)?
        .spec?
        .template
        .metadata?
        .annotations?
        .get(CONFIG_HASH_ANNOTATION)
        .cloned()
}

fn import_uid(harness: &Harness, name: &str) -> Option<String> {
    harness.cluster.jobs.object(&import_job_name(name))?.metadata.uid
}

#[tokio::test]
async fn test_hessen_lifecycle() {
    let harness = Harness::new();
    harness
        .declare(
            MotisBuilder::new("motis-hessen")
                .refresh_schedule("0 3 * * *")
                .build(),
        )
        .await;

    // First pass: config, volumes, import Job and CronJob are created.
    let action = harness.pass("motis-hessen").await;
    assert_eq!(action, Action::Requeue(Duration::from_secs(10)));
    assert_eq!(harness.phase("motis-hessen"), Phase::Provisioning);

    let instance = harness.instance("motis-hessen");
    assert!(instance.metadata.finalizers.unwrap().contains(&FINALIZER.to_string()));

    let config_map = harness
        .cluster
        .config_maps
        .object(&config_map_name("motis-hessen"))
        .unwrap();
    let data = config_map.data.unwrap();
    assert_eq!(data[SCHEDULES_KEY], HESSEN_GTFS);
    assert_eq!(data[OSM_KEY], HESSEN_OSM);
    assert!(data[CONFIG_FILE_KEY].contains("port: 8080"));

    for volume in [input_volume_name("motis-hessen"), data_volume_name("motis-hessen")] {
        assert!(harness.cluster.volumes.object(&volume).is_some(), "{volume} missing");
    }
    let cron_job = harness
        .cluster
        .refresh_jobs
        .object(&refresh_job_name("motis-hessen"))
        .unwrap();
    assert_eq!(cron_job.spec.unwrap().schedule, "0 3 * * *");
    assert!(import_uid(&harness, "motis-hessen").is_some());
    assert!(workload(&harness, "motis-hessen").is_none());
    assert_eq!(harness.cluster.owned_object_count("motis-hessen"), 5);

    // Nothing is served while the import runs.
    harness.pass("motis-hessen").await;
    assert_eq!(harness.phase("motis-hessen"), Phase::Provisioning);
    assert!(workload(&harness, "motis-hessen").is_none());

    // The workload serves the revision the import Job wrote.
    harness.complete_import("motis-hessen", true);
    harness.pass("motis-hessen").await;
    let revision = import_uid(&harness, "motis-hessen");
    let deployment = workload(&harness, "motis-hessen").unwrap();
    assert_eq!(template_data_revision(&deployment), revision.as_deref());
    let pod = deployment.spec.unwrap().template.spec.unwrap();
    assert!(pod.init_containers.is_none());
    assert!(pod.volumes.unwrap().iter().all(|v| v.empty_dir.is_none()));
    assert_eq!(harness.cluster.owned_object_count("motis-hessen"), 6);

    // Not ready until the workload has rolled out.
    harness.pass("motis-hessen").await;
    assert_eq!(harness.phase("motis-hessen"), Phase::Provisioning);

    harness.roll_out("motis-hessen");
    let action = harness.pass("motis-hessen").await;
    assert!(matches!(action, Action::Requeue(_)));

    let status = harness.instance("motis-hessen").status.unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(status.last_error, None);
    assert_eq!(status.data_revision, revision);
    assert!(status.provisioned_at.is_some());
    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .find(|c| c.r#type == kind)
            .map(|c| c.status.clone())
    };
    assert_eq!(condition("Ready").as_deref(), Some("True"));
    assert_eq!(condition("Degraded").as_deref(), Some("False"));
}

#[tokio::test]
async fn test_converged_pass_performs_no_writes() {
    let harness = Harness::new();
    harness
        .declare(MotisBuilder::new("motis-hessen").build())
        .await;
    harness.converge("motis-hessen").await;

    let before = harness.cluster.write_count();
    for _ in 0..3 {
        let action = harness.pass("motis-hessen").await;
        assert!(matches!(action, Action::Requeue(_)));
    }
    assert_eq!(
        harness.cluster.write_count(),
        before,
        "unexpected writes: {:?}",
        &harness.cluster.writes()[before..]
    );
}

#[tokio::test]
async fn test_source_change_reimports_before_rolling_workload() {
    let harness = Harness::new();
    harness
        .declare(MotisBuilder::new("motis-hessen").build())
        .await;
    harness.converge("motis-hessen").await;
    let old_hash = pod_config_hash(&harness, "motis-hessen");
    let old_revision = harness.instance("motis-hessen").status.unwrap().data_revision;
    let served = workload(&harness, "motis-hessen").unwrap().metadata.resource_version;

    let mut instance = harness.instance("motis-hessen");
    instance.spec.config = "server:\n  port: 9090\n".to_string();
    harness.cluster.instances.update(&instance).await.unwrap();

    // The import Job of the old sources is replaced.
    harness.pass("motis-hessen").await;
    let status = harness.instance("motis-hessen").status.unwrap();
    assert_eq!(status.phase, Phase::Provisioning);
    assert_eq!(status.observed_generation, Some(2));
    assert_eq!(status.data_revision, old_revision);
    assert!(import_uid(&harness, "motis-hessen").is_none());
    let data = harness
        .cluster
        .config_maps
        .object(&config_map_name("motis-hessen"))
        .unwrap()
        .data
        .unwrap();
    assert!(data[CONFIG_FILE_KEY].contains("9090"));

    harness.pass("motis-hessen").await;
    let new_import = import_uid(&harness, "motis-hessen");
    assert!(new_import.is_some());
    assert_ne!(new_import, old_revision);

    // The served workload is untouched until the new data exists.
    assert_eq!(
        workload(&harness, "motis-hessen").unwrap().metadata.resource_version,
        served
    );

    harness.complete_import("motis-hessen", true);
    harness.pass("motis-hessen").await;
    let deployment = workload(&harness, "motis-hessen").unwrap();
    assert_eq!(template_data_revision(&deployment), new_import.as_deref());
    assert_ne!(old_hash, pod_config_hash(&harness, "motis-hessen"));

    harness.roll_out("motis-hessen");
    harness.pass("motis-hessen").await;
    assert_eq!(harness.phase("motis-hessen"), Phase::Ready);
}

#[tokio::test]
async fn test_failed_import_fails_instance() {
    let harness = Harness::new();
    harness
        .declare(MotisBuilder::new("motis-hessen").build())
        .await;
    harness.pass("motis-hessen").await;
    harness.complete_import("motis-hessen", false);

    assert_eq!(harness.pass("motis-hessen").await, Action::AwaitChange);
    let status = harness.instance("motis-hessen").status.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.last_error.as_deref(), Some("data import Job failed"));
    assert_eq!(status.data_revision, None);
    assert!(workload(&harness, "motis-hessen").is_none());

    // New sources start a new import.
    let mut instance = harness.instance("motis-hessen");
    instance.spec.osm_url = "https://download.example.org/hessen-fixed.osm.pbf".to_string();
    harness.cluster.instances.update(&instance).await.unwrap();
    harness.converge("motis-hessen").await;
    assert!(workload(&harness, "motis-hessen").is_some());
}

#[tokio::test]
async fn test_removing_schedule_deletes_cron_job() {
    let harness = Harness::new();
    harness
        .declare(
            MotisBuilder::new("motis-hessen")
                .refresh_schedule("@daily")
                .build(),
        )
        .await;
    harness.converge("motis-hessen").await;
    assert!(harness.ctx.scheduler.next_fire("motis-hessen").await.is_some());

    let mut instance = harness.instance("motis-hessen");
    instance.spec.refresh_schedule = None;
    harness.cluster.instances.update(&instance).await.unwrap();
    harness.pass("motis-hessen").await;

    assert!(
        harness
            .cluster
            .refresh_jobs
            .object(&refresh_job_name("motis-hessen"))
            .is_none()
    );
    harness.roll_out("motis-hessen");
    harness.pass("motis-hessen").await;
    assert_eq!(harness.phase("motis-hessen"), Phase::Ready);
    assert_eq!(harness.ctx.scheduler.next_fire("motis-hessen").await, None);
}

#[tokio::test]
async fn test_invalid_stored_declaration_fails_without_owned_objects() {
    let harness = Harness::new();
    harness
        .declare(
            MotisBuilder::new("motis-hessen")
                .schedule_url("not a url")
                .build(),
        )
        .await;

    let action = harness.pass("motis-hessen").await;
    assert_eq!(action, Action::AwaitChange);

    let status = harness.instance("motis-hessen").status.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.last_error.unwrap().contains("scheduleUrl"));
    assert_eq!(harness.cluster.owned_object_count("motis-hessen"), 0);

    // Failed is terminal until the declaration changes.
    let before = harness.cluster.write_count();
    assert_eq!(harness.pass("motis-hessen").await, Action::AwaitChange);
    assert_eq!(harness.cluster.write_count(), before);

    let mut instance = harness.instance("motis-hessen");
    instance.spec.schedule_url = HESSEN_GTFS.to_string();
    harness.cluster.instances.update(&instance).await.unwrap();
    harness.pass("motis-hessen").await;
    let status = harness.instance("motis-hessen").status.unwrap();
    assert_eq!(status.phase, Phase::Provisioning);
    assert_eq!(status.last_error, None);
    // Config, two volumes and the import Job.
    assert_eq!(harness.cluster.owned_object_count("motis-hessen"), 4);
}

#[tokio::test]
async fn test_crashed_workload_is_reported_as_drift() {
    let harness = Harness::new();
    harness
        .declare(MotisBuilder::new("motis-hessen").build())
        .await;
    harness.converge("motis-hessen").await;

    harness.break_workload("motis-hessen");
    harness.pass("motis-hessen").await;
    assert_eq!(harness.phase("motis-hessen"), Phase::Provisioning);

    harness.roll_out("motis-hessen");
    harness.pass("motis-hessen").await;
    assert_eq!(harness.phase("motis-hessen"), Phase::Ready);
}

#[tokio::test]
async fn test_tampered_config_map_is_restored() {
    let harness = Harness::new();
    harness
        .declare(MotisBuilder::new("motis-hessen").build())
        .await;
    harness.converge("motis-hessen").await;

    harness
        .cluster
        .config_maps
        .mutate(&config_map_name("motis-hessen"), |cm| {
            if let Some(data) = cm.data.as_mut() {
                data.insert(OSM_KEY.to_string(), "https://evil.example.org/x.pbf".to_string());
            }
        });
    let before = harness.cluster.write_count();
    harness.pass("motis-hessen").await;

    let writes = &harness.cluster.writes()[before..];
    assert!(
        writes
            .iter()
            .any(|w| w.kind == "ConfigMap" && w.operation == WriteKind::Update)
    );
    let data = harness
        .cluster
        .config_maps
        .object(&config_map_name("motis-hessen"))
        .unwrap()
        .data
        .unwrap();
    assert_eq!(data[OSM_KEY], HESSEN_OSM);
}

#[tokio::test]
async fn test_foreign_object_of_same_name_is_left_alone() {
    let harness = Harness::new();
    let foreign = ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name("motis-hessen")),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("team".to_string(), "routing".to_string())])),
        ..Default::default()
    };
    harness.cluster.config_maps.seed(foreign);
    harness
        .declare(MotisBuilder::new("motis-hessen").build())
        .await;

    let queue = WorkQueue::default();
    process(&harness.ctx, &queue, "motis-hessen").await;
    let status = harness.instance("motis-hessen").status.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.last_error.unwrap().contains("name collision"));

    let kept = harness
        .cluster
        .config_maps
        .object(&config_map_name("motis-hessen"))
        .unwrap();
    assert!(kept.metadata.owner_references.is_none());
    assert_eq!(kept.data.unwrap()["team"], "routing");

    // Deleting the instance does not take the foreign object with it.
    harness.cluster.instances.delete("motis-hessen").await.unwrap();
    harness.pass("motis-hessen").await;
    assert!(harness.cluster.instances.object("motis-hessen").is_none());
    assert!(
        harness
            .cluster
            .config_maps
            .object(&config_map_name("motis-hessen"))
            .is_some()
    );
}
