//! Instance API status codes and bodies.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use motis_operator::api::{ApiState, create_router};
use std::time::Duration;

use motis_operator::client::{ClientError, WriteKind};
use motis_operator::controller::context::ReconcileSettings;
use motis_operator::controller::queue::{BackoffPolicy, WorkQueue};
use motis_operator::controller::reconciler::Action;
use motis_operator::controller::runner::process;
use motis_operator::crd::Phase;
use motis_operator::resources::common::RETRY_ANNOTATION;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::common::fixtures::{HESSEN_GTFS, HESSEN_OSM, Harness};

const NAME: &str = "motis-hessen";

async fn send(harness: &Harness, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let router = create_router(ApiState::new(harness.ctx.clone(), "default"));
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn hessen(schedule: Option<&str>) -> Value {
    let mut body = json!({
        "name": NAME,
        "scheduleUrl": HESSEN_GTFS,
        "osmUrl": HESSEN_OSM,
        "config": "server:\n  port: 8080\n",
    });
    if let Some(schedule) = schedule {
        body["refreshSchedule"] = json!(schedule);
    }
    body
}

#[tokio::test]
async fn test_empty_list() {
    let harness = Harness::new();
    let (status, body) = send(&harness, "GET", "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "instances": [] }));
}

#[tokio::test]
async fn test_create_then_list_and_get() {
    let harness = Harness::new();
    let (status, body) = send(&harness, "POST", "/instances", Some(hessen(Some("0 3 * * *")))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["message"].as_str().unwrap().contains(NAME));

    let stored = harness.instance(NAME);
    assert_eq!(stored.metadata.namespace.as_deref(), Some("default"));
    assert_eq!(stored.spec.refresh_schedule.as_deref(), Some("0 3 * * *"));

    let (status, body) = send(&harness, "GET", "/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instances"].as_array().unwrap().len(), 1);
    assert_eq!(body["instances"][0]["name"], NAME);
    assert_eq!(body["instances"][0]["status"], "Pending");
    assert_eq!(body["instances"][0]["refreshSchedule"], "0 3 * * *");

    harness.converge(NAME).await;
    let (status, body) = send(&harness, "GET", "/instances/motis-hessen", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Ready");
    assert_eq!(body["observedGeneration"], 1);
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let harness = Harness::new();
    send(&harness, "POST", "/instances", Some(hessen(None))).await;
    let (status, body) = send(&harness, "POST", "/instances", Some(hessen(None))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "instance 'motis-hessen' already exists");
}

#[tokio::test]
async fn test_invalid_schedule_rejected_without_writes() {
    let harness = Harness::new();
    let (status, body) = send(&harness, "POST", "/instances", Some(hessen(Some("not-a-cron")))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "InvalidSchedule");
    assert_eq!(harness.cluster.write_count(), 0);
}

#[tokio::test]
async fn test_invalid_names_rejected() {
    let harness = Harness::new();
    for name in ["", "Motis-Hessen", "motis_hessen", "-motis"] {
        let mut body = hessen(None);
        body["name"] = json!(name);
        let (status, body) = send(&harness, "POST", "/instances", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "name {name:?}");
        assert_eq!(body["reason"], "InvalidName");
    }

    // Fits a DNS label but not the CronJob name limit.
    let mut body = hessen(Some("@daily"));
    body["name"] = json!("a".repeat(45));
    let (status, _) = send(&harness, "POST", "/instances", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Leaves no room for the import Job name.
    let mut body = hessen(None);
    body["name"] = json!("a".repeat(57));
    let (status, _) = send(&harness, "POST", "/instances", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(harness.cluster.write_count(), 0);
}

#[tokio::test]
async fn test_malformed_body() {
    let harness = Harness::new();
    let router = create_router(ApiState::new(harness.ctx.clone(), "default"));
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/instances")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["reason"], "InvalidBody");

    // Every declaration field except the refresh schedule is required.
    for field in ["scheduleUrl", "osmUrl", "config"] {
        let mut body = hessen(None);
        body.as_object_mut().unwrap().remove(field);
        let (status, body) = send(&harness, "POST", "/instances", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "missing {field}");
        assert_eq!(body["reason"], "InvalidBody");
    }
    assert_eq!(harness.cluster.write_count(), 0);
}

#[tokio::test]
async fn test_unknown_instance() {
    let harness = Harness::new();
    let (status, body) = send(&harness, "GET", "/instances/motis-bayern", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "instance 'motis-bayern' not found");

    let (status, _) = send(&harness, "DELETE", "/instances/motis-bayern", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut body = hessen(None);
    body["name"] = json!("motis-bayern");
    let (status, _) = send(&harness, "PUT", "/instances/motis-bayern", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_replace() {
    let harness = Harness::new();
    send(&harness, "POST", "/instances", Some(hessen(None))).await;

    let (status, body) = send(&harness, "PUT", "/instances/motis-hessen", Some(hessen(None))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["message"].as_str().unwrap().contains("unchanged"));
    assert_eq!(harness.instance(NAME).metadata.generation, Some(1));

    let (status, _) = send(
        &harness,
        "PUT",
        "/instances/motis-hessen",
        Some(hessen(Some("*/30 * * * *"))),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let stored = harness.instance(NAME);
    assert_eq!(stored.metadata.generation, Some(2));
    assert_eq!(stored.spec.refresh_schedule.as_deref(), Some("*/30 * * * *"));

    let mut renamed = hessen(None);
    renamed["name"] = json!("motis-bayern");
    let (status, body) = send(&harness, "PUT", "/instances/motis-hessen", Some(renamed)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "InvalidName");
}

#[tokio::test]
async fn test_resubmitting_failed_instance_retries() {
    let harness = Harness::with_settings(ReconcileSettings {
        retry_budget: 1,
        ..ReconcileSettings::default()
    });
    send(&harness, "POST", "/instances", Some(hessen(None))).await;
    for _ in 0..2 {
        harness.cluster.config_maps.fail_next(
            WriteKind::Create,
            ClientError::Unavailable("apiserver overloaded".to_string()),
        );
    }
    let queue = WorkQueue::new(BackoffPolicy {
        base: Duration::from_millis(1),
        max: Duration::from_millis(10),
    });
    process(&harness.ctx, &queue, NAME).await;
    process(&harness.ctx, &queue, NAME).await;
    assert_eq!(harness.phase(NAME), Phase::Failed);

    // Waiting does not help a Failed instance.
    assert_eq!(harness.pass(NAME).await, Action::AwaitChange);
    assert_eq!(harness.phase(NAME), Phase::Failed);

    let (status, body) = send(&harness, "PUT", "/instances/motis-hessen", Some(hessen(None))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["message"].as_str().unwrap().contains("retry requested"));
    let stored = harness.instance(NAME);
    assert_eq!(stored.metadata.generation, Some(1));
    let requested = stored.metadata.annotations.unwrap()[RETRY_ANNOTATION].clone();

    harness.pass(NAME).await;
    let status = harness.instance(NAME).status.unwrap();
    assert_eq!(status.phase, Phase::Provisioning);
    assert_eq!(status.last_error, None);
    assert_eq!(status.retry_observed, Some(requested));

    // Outside Failed an identical body changes nothing.
    let before = harness.cluster.write_count();
    let (_, body) = send(&harness, "PUT", "/instances/motis-hessen", Some(hessen(None))).await;
    assert!(body["message"].as_str().unwrap().contains("unchanged"));
    assert_eq!(harness.cluster.write_count(), before);

    harness.converge(NAME).await;
}

#[tokio::test]
async fn test_delete_then_reconcile() {
    let harness = Harness::new();
    send(&harness, "POST", "/instances", Some(hessen(Some("@daily")))).await;
    harness.converge(NAME).await;

    let (status, _) = send(&harness, "DELETE", "/instances/motis-hessen", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // Finalizer keeps the object until the controller has cleaned up.
    assert!(harness.cluster.instances.object(NAME).is_some());

    harness.pass(NAME).await;
    let (status, _) = send(&harness, "GET", "/instances/motis-hessen", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(harness.cluster.owned_object_count(NAME), 0);
}

#[tokio::test]
async fn test_unreadable_objects_report_unknown() {
    let harness = Harness::new();
    send(&harness, "POST", "/instances", Some(hessen(None))).await;
    harness.converge(NAME).await;
    assert_eq!(harness.phase(NAME), Phase::Ready);

    harness.cluster.workloads.fail_next(
        WriteKind::Get,
        ClientError::Unavailable("apiserver overloaded".to_string()),
    );
    let (status, body) = send(&harness, "GET", "/instances/motis-hessen", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Unknown");
}

#[tokio::test]
async fn test_cluster_outage_is_unavailable() {
    let harness = Harness::new();
    harness.cluster.instances.fail_next(
        WriteKind::List,
        ClientError::Unavailable("apiserver overloaded".to_string()),
    );
    let (status, body) = send(&harness, "GET", "/instances", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "Unavailable");
}
