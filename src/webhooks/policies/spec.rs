//! Spec validity
//!
//! The same checks the control loop runs before accepting a spec, so a bad spec is
//! refused at admission instead of parked in the status.

use super::{AdmissionOperation, ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec;

pub fn validate_cluster_spec(ctx: &ValidationContext) -> ValidationResult {
    if ctx.operation == AdmissionOperation::Delete {
        return ValidationResult::allowed();
    }
    match validate_spec(&ctx.cluster.spec) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error(&e),
    }
}
