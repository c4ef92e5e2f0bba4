// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for motis-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use jiff::{SignedDuration, Timestamp};
use proptest::prelude::*;
use serde_json::{Map, Value};

use motis_operator::controller::diff::{changed_paths, overlay};
use motis_operator::controller::reconciler::latest_fire;
use motis_operator::controller::state_machine::{
    ResourceEvent, ResourceStateMachine, TransitionContext, advance, determine_event,
};
use motis_operator::controller::validation::{InstanceSpec, validate_name};
use motis_operator::crd::{MotisSpec, Phase};
use motis_operator::resources::pipeline::JobOutcome;
use motis_operator::resources::translate;
use motis_operator::scheduler::CronSchedule;

/// Strategy for generating random phases.
fn any_phase() -> impl Strategy<Value = Phase> {
    prop_oneof![
        Just(Phase::Pending),
        Just(Phase::Provisioning),
        Just(Phase::Ready),
        Just(Phase::RefreshingData),
        Just(Phase::Failed),
    ]
}

/// Strategy for generating random events.
fn any_event() -> impl Strategy<Value = ResourceEvent> {
    prop_oneof![
        Just(ResourceEvent::SpecChanged),
        Just(ResourceEvent::AllObjectsReady),
        Just(ResourceEvent::ApplyFailed),
        Just(ResourceEvent::ConvergenceLost),
        Just(ResourceEvent::RefreshTriggered),
        Just(ResourceEvent::RefreshSucceeded),
        Just(ResourceEvent::RefreshFailed),
    ]
}

fn any_job() -> impl Strategy<Value = Option<JobOutcome>> {
    prop_oneof![
        Just(None),
        Just(Some(JobOutcome::Running)),
        Just(Some(JobOutcome::Succeeded)),
        Just(Some(JobOutcome::Failed)),
    ]
}

/// Strategy for arbitrary observations of one pass.
fn any_context() -> impl Strategy<Value = TransitionContext> {
    (
        any::<[bool; 7]>(),
        any_job(),
        proptest::option::of("[a-z ]{1,20}"),
    )
        .prop_map(|(flags, refresh_job, error_message)| TransitionContext {
            spec_changed: flags[0],
            converged: flags[1],
            workload_ready: flags[2],
            workload_on_revision: flags[3],
            drift_detected: flags[4],
            refresh_due: flags[5],
            refresh_job,
            refresh_timed_out: flags[6],
            error_message,
        })
}

/// DNS labels short enough for the CronJob name.
fn valid_name() -> impl Strategy<Value = String> {
    "[a-z0-9]([-a-z0-9]{0,38}[a-z0-9])?"
}

fn invalid_name() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Z][a-z0-9]{0,10}",
        "[a-z]{1,10}_[a-z]{1,10}",
        "-[a-z0-9]{1,10}",
        "[a-z0-9]{1,10}-",
        "[a-z]{64,80}",
        Just(String::new()),
    ]
}

fn schedule() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("0 3 * * *"),
        Just("*/5 * * * *"),
        Just("30 6 * jan,jul MON-FRI"),
        Just("0 0 29 2 *"),
        Just("@hourly"),
        Just("15 */6 1-10 * *"),
    ]
}

fn timestamp() -> impl Strategy<Value = Timestamp> {
    (1_600_000_000i64..1_900_000_000i64).prop_map(|s| Timestamp::from_second(s).unwrap())
}

fn json_map() -> impl Strategy<Value = Value> {
    proptest::collection::btree_map("[a-z]{1,4}", "[a-z0-9]{0,6}", 0..6).prop_map(|m| {
        Value::Object(
            m.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<Map<String, Value>>(),
        )
    })
}

fn spec() -> MotisSpec {
    MotisSpec {
        schedule_url: "https://example.org/gtfs.zip".to_string(),
        osm_url: "https://example.org/hessen.osm.pbf".to_string(),
        refresh_schedule: Some("0 3 * * *".to_string()),
        ..Default::default()
    }
}

proptest! {
    /// Property: Valid names produce a full set of objects named after the instance.
    #[test]
    fn test_valid_names_translate(name in valid_name()) {
        let validated = InstanceSpec::validate(&name, "default", &spec()).unwrap();
        let desired = translate(&validated).unwrap();
        let cron_job = desired.refresh_job.unwrap();
        prop_assert!(cron_job.metadata.name.unwrap().starts_with(&name));
        prop_assert!(desired.import_job.metadata.name.unwrap().len() <= 63);
        prop_assert!(desired.workload.is_none());
    }

    /// Property: Names that are not DNS labels are rejected before anything is built.
    #[test]
    fn test_invalid_names_rejected(name in invalid_name()) {
        prop_assert!(validate_name(&name).is_err());
        prop_assert!(InstanceSpec::validate(&name, "default", &spec()).is_err());
    }

    /// Property: The event chosen for a pass is always a legal transition.
    #[test]
    fn test_determined_event_is_legal(phase in any_phase(), ctx in any_context()) {
        let sm = ResourceStateMachine::new();
        if let Some(event) = determine_event(&phase, &ctx) {
            prop_assert!(
                sm.can_transition(&phase, &event),
                "{:?} is not legal from {:?}", event, phase
            );
        }
    }

    /// Property: Advancing terminates and every step is a legal transition.
    #[test]
    fn test_advance_terminates(phase in any_phase(), ctx in any_context()) {
        let sm = ResourceStateMachine::new();
        let (end, events) = advance(&sm, phase, &ctx);
        prop_assert!(events.len() <= Phase::ALL.len());

        let mut current = phase;
        for event in &events {
            prop_assert!(sm.can_transition(&current, event));
            current = sm.transition(&current, *event, &ctx).target().unwrap();
        }
        prop_assert_eq!(current, end);
    }

    /// Property: Failed is left only through a spec change.
    #[test]
    fn test_failed_is_sticky(ctx in any_context(), event in any_event()) {
        let sm = ResourceStateMachine::new();
        let (end, _) = advance(&sm, Phase::Failed, &TransitionContext { spec_changed: false, ..ctx });
        prop_assert_eq!(end, Phase::Failed);
        prop_assert_eq!(
            sm.can_transition(&Phase::Failed, &event),
            event == ResourceEvent::SpecChanged
        );
    }

    /// Property: The next fire is strictly later and no fire is skipped.
    #[test]
    fn test_next_fire_is_next(expression in schedule(), after in timestamp()) {
        let cron = CronSchedule::parse(expression).unwrap();
        let fire = cron.next_after(after).unwrap();
        prop_assert!(fire > after);
        prop_assert_eq!(fire.as_second() % 60, 0);

        let just_before = fire - SignedDuration::from_secs(1);
        if just_before > after {
            prop_assert_eq!(cron.next_after(just_before), Some(fire));
        }
    }

    /// Property: The latest missed fire lies in (base, now].
    #[test]
    fn test_latest_fire_window(expression in schedule(), base in timestamp(), hours in 0i64..80) {
        let cron = CronSchedule::parse(expression).unwrap();
        let now = base + SignedDuration::from_hours(hours);
        if let Some(fire) = latest_fire(&cron, base, now) {
            prop_assert!(fire > base);
            prop_assert!(fire <= now);
            if let Some(next) = cron.next_after(fire) {
                prop_assert!(next > now);
            }
        } else if let Some(first) = cron.next_after(base) {
            prop_assert!(first > now);
        }
    }

    /// Property: An object never differs from itself.
    #[test]
    fn test_diff_reflexive(value in json_map()) {
        prop_assert!(changed_paths(&value, &value).is_empty());
    }

    /// Property: Overlaying the desired state onto any observed state converges.
    #[test]
    fn test_overlay_converges(desired in json_map(), observed in json_map()) {
        let merged = overlay(&observed, &desired);
        prop_assert!(changed_paths(&desired, &merged).is_empty());
    }
}
