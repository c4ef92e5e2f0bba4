//! The refresh schedule, if set, must be a cron expression that fires.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::normalize_schedule;

pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    normalize_schedule(ctx.resource.spec.refresh_schedule.as_deref())
        .map(|_| ())
        .into()
}
