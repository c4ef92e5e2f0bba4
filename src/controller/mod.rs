//! Controller module for motis-operator.
//!
//! Contains the reconciliation pass, the lifecycle state machine, the work
//! queue and its worker pool, error handling, status management and
//! validation.

pub mod context;
pub mod diff;
pub mod error;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub mod state_machine;
pub mod status;
pub mod validation;
