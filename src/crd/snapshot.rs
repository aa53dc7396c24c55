use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::backend::StorageBackend;

/// A full logical backup of one PostgresCluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "guardian.postgres.io",
    version = "v1alpha1",
    kind = "Snapshot",
    plural = "snapshots",
    shortname = "pgsnap",
    namespaced,
    status = "SnapshotStatus",
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.databaseName"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// Name of the PostgresCluster in the same namespace
    pub database_name: String,

    pub storage: StorageBackend,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    #[serde(default)]
    pub phase: SnapshotPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    /// Failure reason for Failed snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Backend location of the snapshot directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    #[serde(default)]
    pub retention_tag: RetentionTag,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum SnapshotPhase {
    #[default]
    Running,
    Succeeded,
    /// Terminal; never retried automatically
    Failed,
}

impl SnapshotPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotPhase::Succeeded | SnapshotPhase::Failed)
    }
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotPhase::Running => write!(f, "Running"),
            SnapshotPhase::Succeeded => write!(f, "Succeeded"),
            SnapshotPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Who created a snapshot, which decides whether retention may remove it
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum RetentionTag {
    #[default]
    Manual,
    Scheduled,
}
