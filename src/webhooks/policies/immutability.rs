//! Immutability policies
//!
//! Storage size, storage class and storage type are fixed at creation.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::validate_spec_change;

/// Validate fields fixed at creation. Only applies to UPDATE.
pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    let Some(old_cluster) = ctx.old_cluster else {
        return ValidationResult::allowed();
    };
    match validate_spec_change(&old_cluster.spec, &ctx.cluster.spec) {
        Ok(_) => ValidationResult::allowed(),
        Err(e) => ValidationResult::from_error(&e),
    }
}
