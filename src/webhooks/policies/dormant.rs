//! A cluster created over a dormant record must be able to resume from it

use super::{AdmissionOperation, ValidationContext, ValidationResult};

pub fn validate_dormant_compatibility(ctx: &ValidationContext) -> ValidationResult {
    if ctx.operation != AdmissionOperation::Create {
        return ValidationResult::allowed();
    }
    match ctx.dormant.and_then(|d| d.incompatibility(&ctx.cluster.spec)) {
        Some(reason) => ValidationResult::denied("DormantDatabaseConflict", &reason),
        None => ValidationResult::allowed(),
    }
}
