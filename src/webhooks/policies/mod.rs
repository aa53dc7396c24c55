//! Admission webhook policies
//!
//! Each policy module exports a `validate` function that checks specific rules.

pub mod dormant;
pub mod immutability;
pub mod production;
pub mod spec;
pub mod termination;

pub use dormant::validate_dormant_compatibility;
pub use immutability::validate_immutability;
pub use production::validate_production;
pub use spec::validate_cluster_spec;
pub use termination::validate_termination;

use std::collections::BTreeMap;

use crate::cluster::DormantRecord;
use crate::controller::Error;
use crate::crd::PostgresCluster;

/// Result of a policy validation
#[derive(Debug)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
        }
    }

    pub fn denied(reason: &str, message: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }

    /// Deny with the error's reason and message
    pub fn from_error(error: &Error) -> Self {
        Self::denied(error.reason(), &error.to_string())
    }
}

/// Admission operation being validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOperation {
    Create,
    Update,
    Delete,
}

impl AdmissionOperation {
    pub fn parse(operation: &str) -> Option<Self> {
        match operation {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Context for validation including old object for UPDATE operations
pub struct ValidationContext<'a> {
    pub operation: AdmissionOperation,
    pub cluster: &'a PostgresCluster,
    pub old_cluster: Option<&'a PostgresCluster>,
    /// Dormant record left by an earlier cluster of the same identity
    pub dormant: Option<&'a DormantRecord>,
    pub namespace_labels: BTreeMap<String, String>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(
        operation: AdmissionOperation,
        cluster: &'a PostgresCluster,
        old_cluster: Option<&'a PostgresCluster>,
        namespace_labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            operation,
            cluster,
            old_cluster,
            dormant: None,
            namespace_labels,
        }
    }

    pub fn with_dormant(mut self, dormant: Option<&'a DormantRecord>) -> Self {
        self.dormant = dormant;
        self
    }

    /// Check if namespace is marked as production
    pub fn is_production_namespace(&self) -> bool {
        self.namespace_labels
            .get("env")
            .is_some_and(|v| v == "production")
    }
}

/// Run all validation policies and return the first failure
pub fn validate_all(ctx: &ValidationContext) -> ValidationResult {
    if ctx.operation == AdmissionOperation::Delete {
        return validate_termination(ctx);
    }

    let policies: Vec<fn(&ValidationContext) -> ValidationResult> = vec![
        validate_cluster_spec,
        validate_immutability,
        validate_dormant_compatibility,
    ];
    for policy in policies {
        let result = policy(ctx);
        if !result.allowed {
            return result;
        }
    }

    // Only for namespaces labelled env=production
    if ctx.is_production_namespace() {
        let result = validate_production(ctx);
        if !result.allowed {
            return result;
        }
    }

    ValidationResult::allowed()
}
