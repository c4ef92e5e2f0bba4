//! Object names must be DNS labels and leave room for owned object suffixes.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::{
    normalize_schedule, validate_name, validate_name_fits_import, validate_name_fits_schedule,
};

pub fn validate(ctx: &ValidationContext<'_>) -> ValidationResult {
    if let Err(e) = validate_name(ctx.name).and_then(|()| validate_name_fits_import(ctx.name)) {
        return ValidationResult::denied(e.reason(), &e.to_string());
    }
    let scheduled = matches!(
        normalize_schedule(ctx.resource.spec.refresh_schedule.as_deref()),
        Ok(Some(_))
    );
    if scheduled {
        return validate_name_fits_schedule(ctx.name).into();
    }
    ValidationResult::allowed()
}
