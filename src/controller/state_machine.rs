//! Formal finite state machine for the Motis instance lifecycle.
//!
//! This module implements a proper FSM pattern with explicit state transitions
//! and guards. It ensures that only valid phase changes occur and gives every
//! change a named event for logs and Kubernetes Events.

use std::fmt;

use crate::crd::Phase;
use crate::resources::pipeline::JobOutcome;

/// Events that trigger state transitions in the instance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceEvent {
    /// The instance was created or its spec changed (generation bump)
    SpecChanged,
    /// Every owned object exists, matches the declaration and the workload serves
    AllObjectsReady,
    /// Applying owned objects failed for good
    ApplyFailed,
    /// An owned object disappeared or the workload stopped serving
    ConvergenceLost,
    /// The refresh schedule fired
    RefreshTriggered,
    /// The refresh Job completed and the workload serves the new data
    RefreshSucceeded,
    /// The refresh Job failed or never started, or its data was not served
    /// in time
    RefreshFailed,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceEvent::SpecChanged => write!(f, "SpecChanged"),
            ResourceEvent::AllObjectsReady => write!(f, "AllObjectsReady"),
            ResourceEvent::ApplyFailed => write!(f, "ApplyFailed"),
            ResourceEvent::ConvergenceLost => write!(f, "ConvergenceLost"),
            ResourceEvent::RefreshTriggered => write!(f, "RefreshTriggered"),
            ResourceEvent::RefreshSucceeded => write!(f, "RefreshSucceeded"),
            ResourceEvent::RefreshFailed => write!(f, "RefreshFailed"),
        }
    }
}

/// What the current pass observed, used to pick and guard events
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Generation differs from the observed generation
    pub spec_changed: bool,
    /// All desired objects exist, the data for the current sources is
    /// imported and no write was needed in this pass
    pub converged: bool,
    /// The workload has rolled out its current template and is available
    pub workload_ready: bool,
    /// The workload's pod template carries the expected data revision
    pub workload_on_revision: bool,
    /// An owned object that existed before is gone or unavailable
    pub drift_detected: bool,
    /// The refresh schedule has fired since the last refresh
    pub refresh_due: bool,
    /// Outcome of the refresh Job for the current refresh, if one exists
    pub refresh_job: Option<JobOutcome>,
    /// No refresh Job appeared within the start deadline
    pub refresh_timed_out: bool,
    /// Error message if the pass failed
    pub error_message: Option<String>,
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the instance is fully converged and serving
    pub fn all_objects_ready(&self) -> bool {
        self.converged && self.workload_ready
    }

    /// Check if the refreshed data is being served
    pub fn refresh_complete(&self) -> bool {
        self.refresh_job == Some(JobOutcome::Succeeded)
            && self.all_objects_ready()
            && self.workload_on_revision
    }

    pub fn with_spec_changed(mut self, changed: bool) -> Self {
        self.spec_changed = changed;
        self
    }

    pub fn with_converged(mut self, converged: bool) -> Self {
        self.converged = converged;
        self
    }

    pub fn with_workload_ready(mut self, ready: bool) -> Self {
        self.workload_ready = ready;
        self
    }

    pub fn with_workload_on_revision(mut self, on_revision: bool) -> Self {
        self.workload_on_revision = on_revision;
        self
    }

    pub fn with_drift(mut self, drift: bool) -> Self {
        self.drift_detected = drift;
        self
    }

    pub fn with_refresh_due(mut self, due: bool) -> Self {
        self.refresh_due = due;
        self
    }

    pub fn with_refresh_job(mut self, outcome: Option<JobOutcome>) -> Self {
        self.refresh_job = outcome;
        self
    }

    pub fn with_refresh_timed_out(mut self, timed_out: bool) -> Self {
        self.refresh_timed_out = timed_out;
        self
    }

    /// Set error message
    pub fn with_error(mut self, message: String) -> Self {
        self.error_message = Some(message);
        self
    }
}

/// A state transition definition with optional guard
#[derive(Debug)]
pub struct Transition {
    /// Source state
    pub from: Phase,
    /// Target state
    pub to: Phase,
    /// Event that triggers this transition
    pub event: ResourceEvent,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    /// Create a new transition
    const fn new(from: Phase, to: Phase, event: ResourceEvent, description: &'static str) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: Phase,
        to: Phase,
        event: ResourceEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: Phase,
        event: ResourceEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: Phase,
        to: Phase,
        event: ResourceEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase of a successful transition.
    pub fn target(&self) -> Option<Phase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Formal state machine for the Motis lifecycle
pub struct ResourceStateMachine {
    transitions: Vec<Transition>,
}

impl Default for ResourceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        Self {
            transitions: vec![
                // === Pending ===
                Transition::new(
                    Phase::Pending,
                    Phase::Provisioning,
                    ResourceEvent::SpecChanged,
                    "Instance accepted, provisioning owned objects",
                ),
                // === Provisioning ===
                Transition::new(
                    Phase::Provisioning,
                    Phase::Ready,
                    ResourceEvent::AllObjectsReady,
                    "All owned objects converged, instance is serving",
                ),
                Transition::new(
                    Phase::Provisioning,
                    Phase::Failed,
                    ResourceEvent::ApplyFailed,
                    "Applying owned objects failed",
                ),
                // === Ready ===
                Transition::new(
                    Phase::Ready,
                    Phase::RefreshingData,
                    ResourceEvent::RefreshTriggered,
                    "Refresh schedule fired, fetching new data",
                ),
                Transition::new(
                    Phase::Ready,
                    Phase::Provisioning,
                    ResourceEvent::SpecChanged,
                    "Spec changed, re-provisioning",
                ),
                Transition::new(
                    Phase::Ready,
                    Phase::Provisioning,
                    ResourceEvent::ConvergenceLost,
                    "Owned object drifted, re-provisioning",
                ),
                Transition::new(
                    Phase::Ready,
                    Phase::Failed,
                    ResourceEvent::ApplyFailed,
                    "Keeping owned objects converged failed",
                ),
                // === RefreshingData ===
                Transition::new(
                    Phase::RefreshingData,
                    Phase::Ready,
                    ResourceEvent::RefreshSucceeded,
                    "Refresh completed, workload serves new data",
                ),
                Transition::new(
                    Phase::RefreshingData,
                    Phase::Failed,
                    ResourceEvent::RefreshFailed,
                    "Refresh failed, previous data still served",
                ),
                Transition::new(
                    Phase::RefreshingData,
                    Phase::Provisioning,
                    ResourceEvent::SpecChanged,
                    "Spec changed during refresh, re-provisioning",
                ),
                // === Failed ===
                Transition::new(
                    Phase::Failed,
                    Phase::Provisioning,
                    ResourceEvent::SpecChanged,
                    "Spec changed or resubmitted after failure, retrying",
                ),
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &Phase,
        event: ResourceEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &Phase, event: &ResourceEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &Phase) -> Vec<&ResourceEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    /// Check guard conditions for a transition
    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            ResourceEvent::AllObjectsReady if !ctx.converged => {
                Some("Owned objects were written in this pass".to_string())
            }
            ResourceEvent::AllObjectsReady if !ctx.workload_ready => {
                Some("Workload has not rolled out".to_string())
            }
            ResourceEvent::RefreshSucceeded if !ctx.refresh_complete() => Some(format!(
                "Refresh not complete: job {:?}, workload ready {}, on revision {}",
                ctx.refresh_job, ctx.workload_ready, ctx.workload_on_revision
            )),
            _ => None,
        }
    }
}

/// Determine the event implied by what the pass observed, if any.
///
/// Spec changes win, then errors, then phase-specific progress. A new
/// instance always starts with `SpecChanged`.
pub fn determine_event(current_phase: &Phase, ctx: &TransitionContext) -> Option<ResourceEvent> {
    let spec_changed = ctx.spec_changed && *current_phase != Phase::Provisioning;
    if spec_changed || *current_phase == Phase::Pending {
        return Some(ResourceEvent::SpecChanged);
    }

    if ctx.error_message.is_some() {
        return match current_phase {
            Phase::RefreshingData => Some(ResourceEvent::RefreshFailed),
            Phase::Failed => None,
            _ => Some(ResourceEvent::ApplyFailed),
        };
    }

    match current_phase {
        Phase::Provisioning if ctx.all_objects_ready() => Some(ResourceEvent::AllObjectsReady),
        Phase::Ready if ctx.drift_detected => Some(ResourceEvent::ConvergenceLost),
        Phase::Ready if ctx.refresh_due => Some(ResourceEvent::RefreshTriggered),
        Phase::RefreshingData
            if ctx.refresh_timed_out || ctx.refresh_job == Some(JobOutcome::Failed) =>
        {
            Some(ResourceEvent::RefreshFailed)
        }
        Phase::RefreshingData if ctx.refresh_complete() => Some(ResourceEvent::RefreshSucceeded),
        _ => None,
    }
}

/// Fire events until the phase settles. Returns the final phase and the
/// events that fired, in order.
pub fn advance(
    machine: &ResourceStateMachine,
    start: Phase,
    ctx: &TransitionContext,
) -> (Phase, Vec<ResourceEvent>) {
    let mut phase = start;
    let mut fired = Vec::new();
    // A spec change is consumed by the first SpecChanged of the pass.
    let mut ctx = ctx.clone();
    // Longest chain: Pending -> Provisioning -> Ready or Failed.
    for _ in 0..Phase::ALL.len() {
        let Some(event) = determine_event(&phase, &ctx) else {
            break;
        };
        match machine.transition(&phase, event, &ctx) {
            TransitionResult::Success { to, .. } => {
                fired.push(event);
                phase = to;
                if event == ResourceEvent::SpecChanged {
                    ctx.spec_changed = false;
                }
            }
            TransitionResult::InvalidTransition { .. } | TransitionResult::GuardFailed { .. } => {
                break;
            }
        }
    }
    (phase, fired)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;

    fn ready_ctx() -> TransitionContext {
        TransitionContext::new()
            .with_converged(true)
            .with_workload_ready(true)
    }

    #[test]
    fn test_pending_to_provisioning() {
        let sm = ResourceStateMachine::new();
        let result = sm.transition(&Phase::Pending, ResourceEvent::SpecChanged, &TransitionContext::new());

        match result {
            TransitionResult::Success { from, to, .. } => {
                assert_eq!(from, Phase::Pending);
                assert_eq!(to, Phase::Provisioning);
            }
            _ => panic!("Expected successful transition"),
        }
    }

    #[test]
    fn test_provisioning_to_ready_guard() {
        let sm = ResourceStateMachine::new();

        let written = TransitionContext::new().with_workload_ready(true);
        let result = sm.transition(&Phase::Provisioning, ResourceEvent::AllObjectsReady, &written);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let rolling = TransitionContext::new().with_converged(true);
        let result = sm.transition(&Phase::Provisioning, ResourceEvent::AllObjectsReady, &rolling);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let result = sm.transition(&Phase::Provisioning, ResourceEvent::AllObjectsReady, &ready_ctx());
        assert_eq!(result.target(), Some(Phase::Ready));
    }

    #[test]
    fn test_refresh_succeeded_guard() {
        let sm = ResourceStateMachine::new();

        let job_done = ready_ctx().with_refresh_job(Some(JobOutcome::Succeeded));
        let result = sm.transition(&Phase::RefreshingData, ResourceEvent::RefreshSucceeded, &job_done);
        assert!(matches!(result, TransitionResult::GuardFailed { .. }));

        let rolled = job_done.with_workload_on_revision(true);
        let result = sm.transition(&Phase::RefreshingData, ResourceEvent::RefreshSucceeded, &rolled);
        assert_eq!(result.target(), Some(Phase::Ready));
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = ResourceStateMachine::new();
        let ctx = ready_ctx();

        let result = sm.transition(&Phase::Pending, ResourceEvent::AllObjectsReady, &ctx);
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));

        let result = sm.transition(&Phase::Failed, ResourceEvent::RefreshTriggered, &ctx);
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));

        let result = sm.transition(&Phase::Provisioning, ResourceEvent::RefreshTriggered, &ctx);
        assert!(matches!(result, TransitionResult::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_only_leaves_on_spec_change() {
        let sm = ResourceStateMachine::new();
        assert_eq!(sm.valid_events(&Phase::Failed), vec![&ResourceEvent::SpecChanged]);
    }

    #[test]
    fn test_spec_change_from_every_settled_phase() {
        let sm = ResourceStateMachine::new();
        for phase in [Phase::Pending, Phase::Ready, Phase::RefreshingData, Phase::Failed] {
            assert!(
                sm.can_transition(&phase, &ResourceEvent::SpecChanged),
                "SpecChanged should be valid from {phase}"
            );
        }
    }

    #[test]
    fn test_determine_event_errors() {
        let ctx = ready_ctx().with_error("boom".to_string());
        assert_eq!(
            determine_event(&Phase::Provisioning, &ctx),
            Some(ResourceEvent::ApplyFailed)
        );
        assert_eq!(
            determine_event(&Phase::RefreshingData, &ctx),
            Some(ResourceEvent::RefreshFailed)
        );
        assert_eq!(determine_event(&Phase::Failed, &ctx), None);
    }

    #[test]
    fn test_advance_new_instance_with_error_ends_failed() {
        let sm = ResourceStateMachine::new();
        let ctx = TransitionContext::new()
            .with_spec_changed(true)
            .with_error("invalid".to_string());
        let (phase, events) = advance(&sm, Phase::Pending, &ctx);
        assert_eq!(phase, Phase::Failed);
        assert_eq!(events, vec![ResourceEvent::SpecChanged, ResourceEvent::ApplyFailed]);
    }

    #[test]
    fn test_advance_converged_new_instance_is_ready() {
        let sm = ResourceStateMachine::new();
        let (phase, events) = advance(&sm, Phase::Pending, &ready_ctx().with_spec_changed(true));
        assert_eq!(phase, Phase::Ready);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_advance_spec_change_during_refresh() {
        let sm = ResourceStateMachine::new();
        let ctx = TransitionContext::new().with_spec_changed(true);
        let (phase, events) = advance(&sm, Phase::RefreshingData, &ctx);
        assert_eq!(phase, Phase::Provisioning);
        assert_eq!(events, vec![ResourceEvent::SpecChanged]);
    }

    #[test]
    fn test_determine_event_spec_changed() {
        let ctx = ready_ctx().with_spec_changed(true);
        assert_eq!(determine_event(&Phase::Ready, &ctx), Some(ResourceEvent::SpecChanged));
        assert_eq!(determine_event(&Phase::Failed, &ctx), Some(ResourceEvent::SpecChanged));
        assert_eq!(
            determine_event(&Phase::Provisioning, &ctx),
            Some(ResourceEvent::AllObjectsReady)
        );
    }

    #[test]
    fn test_determine_event_ready() {
        assert_eq!(determine_event(&Phase::Ready, &ready_ctx()), None);
        assert_eq!(
            determine_event(&Phase::Ready, &ready_ctx().with_refresh_due(true)),
            Some(ResourceEvent::RefreshTriggered)
        );
        assert_eq!(
            determine_event(&Phase::Ready, &ready_ctx().with_drift(true).with_refresh_due(true)),
            Some(ResourceEvent::ConvergenceLost)
        );
    }

    #[test]
    fn test_determine_event_refreshing() {
        let waiting = ready_ctx();
        assert_eq!(determine_event(&Phase::RefreshingData, &waiting), None);

        let failed = ready_ctx().with_refresh_job(Some(JobOutcome::Failed));
        assert_eq!(
            determine_event(&Phase::RefreshingData, &failed),
            Some(ResourceEvent::RefreshFailed)
        );

        let timed_out = ready_ctx().with_refresh_timed_out(true);
        assert_eq!(
            determine_event(&Phase::RefreshingData, &timed_out),
            Some(ResourceEvent::RefreshFailed)
        );

        let done = ready_ctx()
            .with_refresh_job(Some(JobOutcome::Succeeded))
            .with_workload_on_revision(true);
        assert_eq!(
            determine_event(&Phase::RefreshingData, &done),
            Some(ResourceEvent::RefreshSucceeded)
        );
    }

    #[test]
    fn test_failed_waits() {
        assert_eq!(determine_event(&Phase::Failed, &ready_ctx()), None);
    }
}
