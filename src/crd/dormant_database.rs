use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cluster::model::{MemberId, Timeline};
use crate::crd::postgres_cluster::PostgresClusterSpec;

/// Preserved state of a PostgresCluster deleted under the Pause policy
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "guardian.postgres.io",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"WipeOut", "type":"boolean", "jsonPath":".spec.wipeOut"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    /// Remove every retained artifact when set
    #[serde(default)]
    pub wipe_out: bool,

    pub origin: DormantOrigin,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DormantOrigin {
    /// Spec of the cluster at the time it was paused
    pub spec: PostgresClusterSpec,

    /// Retained data volumes
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Retained credentials secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_primary: Option<MemberId>,

    #[serde(default)]
    pub timeline: Timeline,

    #[serde(default)]
    pub initialized: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default)]
    pub phase: DormantPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiped_out_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum DormantPhase {
    #[default]
    Paused,
    WipedOut,
}
