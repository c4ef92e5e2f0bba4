// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for motis-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use motis_operator::crd::{Condition, ImageSpec, Motis, MotisSpec, Phase};

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Pending.to_string(), "Pending");
        assert_eq!(Phase::Provisioning.to_string(), "Provisioning");
        assert_eq!(Phase::Ready.to_string(), "Ready");
        assert_eq!(Phase::RefreshingData.to_string(), "RefreshingData");
        assert_eq!(Phase::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(Phase::default(), Phase::Pending);
    }

    #[test]
    fn test_condition_ready() {
        let condition = Condition::ready(true, "Converged", "All owned objects are converged", Some(1));
        assert_eq!(condition.r#type, "Ready");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "Converged");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_degraded() {
        let condition = Condition::degraded(false, "Converged", "", None);
        assert_eq!(condition.r#type, "Degraded");
        assert_eq!(condition.status, "False");
    }

    #[test]
    fn test_spec_wire_format() {
        let motis: Motis = serde_json::from_value(serde_json::json!({
            "apiVersion": "motis.motis-project.de/v1alpha1",
            "kind": "Motis",
            "metadata": { "name": "motis-hessen" },
            "spec": {
                "scheduleUrl": "https://example.org/gtfs.zip",
                "osmUrl": "https://example.org/hessen.osm.pbf",
                "refreshSchedule": "0 3 * * *"
            }
        }))
        .unwrap();
        assert_eq!(motis.spec.refresh_schedule.as_deref(), Some("0 3 * * *"));
        assert_eq!(motis.spec.config, "");
        assert_eq!(motis.spec.image, ImageSpec::default());

        let value = serde_json::to_value(MotisSpec::default()).unwrap();
        assert!(value.get("refreshSchedule").is_none());
    }
}

mod state_machine_tests {
    use motis_operator::controller::state_machine::{ResourceEvent, ResourceStateMachine};
    use motis_operator::crd::Phase;

    #[test]
    fn test_valid_events_from_pending() {
        let sm = ResourceStateMachine::new();
        assert!(sm.can_transition(&Phase::Pending, &ResourceEvent::SpecChanged));
        assert!(!sm.can_transition(&Phase::Pending, &ResourceEvent::AllObjectsReady));
    }

    #[test]
    fn test_valid_events_from_ready() {
        let sm = ResourceStateMachine::new();
        // Ready re-provisions on spec change or drift, refreshes on schedule
        assert!(sm.can_transition(&Phase::Ready, &ResourceEvent::SpecChanged));
        assert!(sm.can_transition(&Phase::Ready, &ResourceEvent::ConvergenceLost));
        assert!(sm.can_transition(&Phase::Ready, &ResourceEvent::RefreshTriggered));
        assert!(sm.can_transition(&Phase::Ready, &ResourceEvent::ApplyFailed));
        assert!(!sm.can_transition(&Phase::Ready, &ResourceEvent::RefreshSucceeded));
    }

    #[test]
    fn test_valid_events_from_refreshing() {
        let sm = ResourceStateMachine::new();
        assert!(sm.can_transition(&Phase::RefreshingData, &ResourceEvent::RefreshSucceeded));
        assert!(sm.can_transition(&Phase::RefreshingData, &ResourceEvent::RefreshFailed));
        assert!(sm.can_transition(&Phase::RefreshingData, &ResourceEvent::SpecChanged));
        assert!(!sm.can_transition(&Phase::RefreshingData, &ResourceEvent::RefreshTriggered));
    }

    #[test]
    fn test_failed_only_leaves_on_spec_change() {
        let sm = ResourceStateMachine::new();
        let events = sm.valid_events(&Phase::Failed);
        assert_eq!(events, vec![&ResourceEvent::SpecChanged]);
    }

    #[test]
    fn test_every_phase_reaches_provisioning_on_spec_change() {
        let sm = ResourceStateMachine::new();
        for phase in Phase::ALL {
            if phase == Phase::Provisioning {
                continue;
            }
            assert!(
                sm.can_transition(&phase, &ResourceEvent::SpecChanged),
                "SpecChanged should leave {phase}"
            );
        }
    }
}

mod error_tests {
    use motis_operator::client::ClientError;
    use motis_operator::controller::error::Error;

    #[test]
    fn test_error_classification() {
        let transient = Error::from(ClientError::Unavailable("overloaded".to_string()));
        assert!(transient.is_retryable());
        assert!(!transient.is_immediate_retry());

        let conflict = Error::from(ClientError::Conflict("modified".to_string()));
        assert!(conflict.is_immediate_retry());
        assert!(!conflict.is_retryable());

        let forbidden = Error::from(ClientError::Forbidden("denied".to_string()));
        assert!(!forbidden.is_retryable());
        assert!(!forbidden.is_immediate_retry());

        assert!(Error::Cancelled.is_immediate_retry());
    }
}

mod status_tests {
    use motis_operator::controller::status::{carry_transition_times, conditions_for_phase};
    use motis_operator::crd::{Condition, Phase};

    fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
        conditions
            .iter()
            .any(|c| c.r#type == condition_type && c.status == "True")
    }

    #[test]
    fn test_refreshing_instance_stays_ready() {
        let conditions = conditions_for_phase(Phase::RefreshingData, "RefreshingData", "", Some(3));
        assert!(is_true(&conditions, "Ready"));
        assert!(is_true(&conditions, "Progressing"));
        assert!(!is_true(&conditions, "Degraded"));
    }

    #[test]
    fn test_every_phase_reports_three_conditions() {
        for phase in Phase::ALL {
            let conditions = conditions_for_phase(phase, "Reason", "", Some(1));
            let types: Vec<&str> = conditions.iter().map(|c| c.r#type.as_str()).collect();
            assert_eq!(types, ["Ready", "Progressing", "Degraded"], "{phase}");
            assert_eq!(is_true(&conditions, "Degraded"), phase == Phase::Failed);
        }
    }

    #[test]
    fn test_unchanged_conditions_keep_transition_time() {
        let mut previous = conditions_for_phase(Phase::Ready, "Converged", "ok", Some(1));
        for condition in &mut previous {
            condition.last_transition_time = "2024-01-01T00:00:00Z".to_string();
        }
        let next = carry_transition_times(
            &previous,
            conditions_for_phase(Phase::Ready, "Converged", "ok", Some(1)),
        );
        assert!(
            next.iter()
                .all(|c| c.last_transition_time == "2024-01-01T00:00:00Z")
        );

        let failed = carry_transition_times(
            &previous,
            conditions_for_phase(Phase::Failed, "Failed", "boom", Some(1)),
        );
        assert!(
            failed
                .iter()
                .all(|c| c.last_transition_time != "2024-01-01T00:00:00Z")
        );
    }
}

mod diff_tests {
    use motis_operator::controller::diff::{changed_paths, overlay};
    use serde_json::json;

    #[test]
    fn test_server_fields_are_not_drift() {
        let desired = json!({ "metadata": { "name": "a" }, "data": { "k": "v" } });
        let observed = json!({
            "metadata": { "name": "a", "uid": "123", "resourceVersion": "7" },
            "data": { "k": "v" }
        });
        assert!(changed_paths(&desired, &observed).is_empty());
    }

    #[test]
    fn test_changed_value_is_reported() {
        let desired = json!({ "data": { "k": "v2" } });
        let observed = json!({ "data": { "k": "v1" } });
        assert!(!changed_paths(&desired, &observed).is_empty());
    }

    #[test]
    fn test_overlay_keeps_server_fields() {
        let desired = json!({ "metadata": { "name": "a" }, "data": { "k": "v2" } });
        let observed = json!({ "metadata": { "name": "a", "uid": "123" }, "data": { "k": "v1" } });
        let merged = overlay(&observed, &desired);
        assert_eq!(merged["metadata"]["uid"], "123");
        assert_eq!(merged["data"]["k"], "v2");
    }
}

mod translator_tests {
    use motis_operator::controller::validation::InstanceSpec;
    use motis_operator::crd::MotisSpec;
    use motis_operator::resources::common::{INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
    use motis_operator::resources::translate;

    fn spec(schedule: Option<&str>) -> InstanceSpec {
        InstanceSpec::validate(
            "motis-hessen",
            "default",
            &MotisSpec {
                schedule_url: "https://example.org/gtfs.zip".to_string(),
                osm_url: "https://example.org/hessen.osm.pbf".to_string(),
                refresh_schedule: schedule.map(str::to_string),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_every_object_is_labelled_for_its_instance() {
        let desired = translate(&spec(Some("0 3 * * *"))).unwrap();
        let cron_job = desired.refresh_job.unwrap();
        let mut labelled = vec![
            desired.config_map.metadata.labels.unwrap(),
            desired.import_job.metadata.labels.unwrap(),
            cron_job.metadata.labels.unwrap(),
        ];
        labelled.extend(desired.volumes.into_iter().map(|v| v.metadata.labels.unwrap()));
        for labels in labelled {
            assert_eq!(labels[INSTANCE_LABEL], "motis-hessen");
            assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY);
        }
    }

    #[test]
    fn test_one_shot_instance_has_no_cron_job() {
        assert!(translate(&spec(None)).unwrap().refresh_job.is_none());
    }

    #[test]
    fn test_blank_schedule_means_one_shot() {
        let validated = InstanceSpec::validate(
            "motis-hessen",
            "default",
            &MotisSpec {
                schedule_url: "https://example.org/gtfs.zip".to_string(),
                osm_url: "https://example.org/hessen.osm.pbf".to_string(),
                refresh_schedule: Some("   ".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(validated.refresh_schedule, None);
    }
}

mod webhook_tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use motis_operator::webhooks::create_webhook_router;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn review(name: &str, schedule: &str) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "motis.motis-project.de", "version": "v1alpha1", "kind": "Motis" },
                "resource": { "group": "motis.motis-project.de", "version": "v1alpha1", "resource": "motis" },
                "name": name,
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": { "username": "admin" },
                "object": {
                    "apiVersion": "motis.motis-project.de/v1alpha1",
                    "kind": "Motis",
                    "metadata": { "name": name, "namespace": "default" },
                    "spec": {
                        "scheduleUrl": "https://example.org/gtfs.zip",
                        "osmUrl": "https://example.org/hessen.osm.pbf",
                        "refreshSchedule": schedule
                    }
                },
                "dryRun": false
            }
        })
    }

    async fn admit(body: Value) -> Value {
        let response = create_webhook_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/validate-motis")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_valid_instance_admitted() {
        let body = admit(review("motis-hessen", "0 3 * * *")).await;
        assert_eq!(body["response"]["allowed"], true);
        assert_eq!(body["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
    }

    #[tokio::test]
    async fn test_invalid_schedule_denied() {
        let body = admit(review("motis-hessen", "not-a-cron")).await;
        assert_eq!(body["response"]["allowed"], false);
        let message = body["response"]["status"]["message"].as_str().unwrap();
        assert!(message.starts_with("[InvalidSchedule]"), "{message}");
    }
}
