//! Source URLs must be absolute `http`/`https` URLs.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_url;

pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    let spec = &ctx.resource.spec;
    validate_url("scheduleUrl", &spec.schedule_url)
        .and_then(|()| validate_url("osmUrl", &spec.osm_url))
        .into()
}
