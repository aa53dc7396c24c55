//! Deletion under DoNotTerminate is refused before the resource is marked for deletion

use super::{AdmissionOperation, ValidationContext, ValidationResult};
use crate::controller::validation::validate_deletion;
use kube::ResourceExt;

pub fn validate_termination(ctx: &ValidationContext) -> ValidationResult {
    if ctx.operation != AdmissionOperation::Delete {
        return ValidationResult::allowed();
    }
    match validate_deletion(&ctx.cluster.name_any(), &ctx.cluster.spec) {
        Ok(()) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error(&e),
    }
}
