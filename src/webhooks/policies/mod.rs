//! Validation policies for Motis admission webhooks.
//!
//! The same rules the instance API applies, so a `Motis` object written with
//! kubectl cannot carry a declaration the API would have rejected. Policies
//! run in order and the first denial wins.

pub mod naming;
pub mod refresh_schedule;
pub mod sources;

use crate::controller::validation::ValidationError;
use crate::crd::Motis;

/// Result of a validation check
#[derive(Debug)]
pub struct ValidationResult {
    /// Whether the validation passed
    pub allowed: bool,
    /// Reason for denial (if not allowed)
    pub reason: Option<String>,
    /// Detailed message (if not allowed)
    pub message: Option<String>,
}

impl ValidationResult {
    /// Create an allowed result
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    /// Create a denied result
    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

impl From<Result<(), ValidationError>> for ValidationResult {
    fn from(result: Result<(), ValidationError>) -> Self {
        match result {
            Ok(()) => Self::allowed(),
            Err(e) => Self::denied(e.reason(), &e.to_string()),
        }
    }
}

/// Context for validation
pub struct ValidationContext<'a> {
    /// The resource being validated
    pub resource: &'a Motis,
    /// Name of the object; `metadata.name` may be unset on create
    pub name: &'a str,
    /// The old resource (for UPDATE operations)
    pub old_resource: Option<&'a Motis>,
    /// Whether this is a dry-run request
    pub dry_run: bool,
    /// The namespace of the resource
    pub namespace: Option<&'a str>,
}

impl<'a> ValidationContext<'a> {
    /// Check if this is an UPDATE operation
    pub fn is_update(&self) -> bool {
        self.old_resource.is_some()
    }
}

/// Run all validation policies
pub fn validate_all(ctx: &ValidationContext<'_>) -> ValidationResult {
    let policies: [fn(&ValidationContext<'_>) -> ValidationResult; 3] = [
        naming::validate,
        sources::validate,
        refresh_schedule::validate,
    ];
    for policy in policies {
        let result = policy(ctx);
        if !result.allowed {
            return result;
        }
    }
    ValidationResult::allowed()
}
