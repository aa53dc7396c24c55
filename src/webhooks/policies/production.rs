//! Production namespace policies
//!
//! These policies are only enforced when the namespace has the label `env=production`.
//!
//! Requirements for production namespaces:
//! - HA required (replicas >= 3)
//! - Data must survive deletion (DoNotTerminate or Pause)
//! - Scheduled snapshots must be configured

use super::{ValidationContext, ValidationResult};
use crate::crd::{StorageType, TerminationPolicy};

/// Validate production namespace requirements
pub fn validate_production(ctx: &ValidationContext) -> ValidationResult {
    let spec = &ctx.cluster.spec;

    if spec.replicas < 3 {
        return ValidationResult::denied(
            "ProductionHARequired",
            &format!(
                "Production clusters must have at least 3 replicas for high availability. Current: {}",
                spec.replicas
            ),
        );
    }

    if spec.storage_type == StorageType::Ephemeral {
        return ValidationResult::denied(
            "ProductionDurableStorageRequired",
            "Production clusters must use Durable storage.",
        );
    }

    if matches!(
        spec.termination_policy,
        TerminationPolicy::Delete | TerminationPolicy::WipeOut
    ) {
        return ValidationResult::denied(
            "ProductionTerminationPolicy",
            &format!(
                "Production clusters must use terminationPolicy DoNotTerminate or Pause. Current: {}",
                spec.termination_policy
            ),
        );
    }

    if spec.backup_schedule.is_none() {
        return ValidationResult::denied(
            "ProductionBackupRequired",
            "Production clusters must have spec.backupSchedule configured.",
        );
    }

    ValidationResult::allowed()
}
