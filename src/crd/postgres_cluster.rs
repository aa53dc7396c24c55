use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cluster::model::{MemberHealth, MemberId, MemberRole, Timeline, WalPosition};
use crate::crd::backend::StorageBackend;

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "guardian.postgres.io",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.standbyMode"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"integer", "jsonPath":".status.primary"}"#,
    printcolumn = r#"{"name":"Timeline", "type":"integer", "jsonPath":".status.timeline"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// PostgreSQL major version, used to pick the server image
    #[serde(default = "default_version")]
    pub version: String,

    /// Number of members (one primary plus standbys)
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Whether standbys serve read-only queries
    #[serde(default)]
    pub standby_mode: StandbyMode,

    /// Durable volumes or ephemeral scratch space
    #[serde(default)]
    pub storage_type: StorageType,

    /// Storage configuration for member data volumes
    pub storage: StorageSpec,

    /// PostgreSQL configuration parameters (postgresql.conf)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub postgresql_params: BTreeMap<String, String>,

    /// Extra environment passed to every member
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Existing credentials secret to use instead of generating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_secret: Option<String>,

    /// Continuous WAL archiving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archiver: Option<ArchiverSpec>,

    /// Periodic snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<BackupScheduleSpec>,

    /// What happens to data when this resource is deleted
    #[serde(default)]
    pub termination_policy: TerminationPolicy,

    /// Initial data source, applied once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSpec>,
}

fn default_version() -> String {
    "16".to_string()
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum StandbyMode {
    /// Standbys apply WAL but reject client reads
    #[default]
    Warm,
    /// Standbys apply WAL and serve read-only queries
    Hot,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StorageType {
    #[default]
    Durable,
    Ephemeral,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum TerminationPolicy {
    /// Deletion is refused
    DoNotTerminate,
    /// Compute is removed; volumes and credentials are kept for a later resume
    #[default]
    Pause,
    /// Compute and volumes are removed; credentials, snapshots and archive are kept
    Delete,
    /// Everything reachable from the cluster is removed
    WipeOut,
}

impl std::fmt::Display for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPolicy::DoNotTerminate => write!(f, "DoNotTerminate"),
            TerminationPolicy::Pause => write!(f, "Pause"),
            TerminationPolicy::Delete => write!(f, "Delete"),
            TerminationPolicy::WipeOut => write!(f, "WipeOut"),
        }
    }
}

/// Storage configuration for member data volumes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of each volume (e.g., "1Gi", "100Gi")
    pub size: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverSpec {
    pub storage: StorageBackend,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Cron expression (5 or 6 fields) or `@every <n>[smh]`
    pub cron_expression: String,

    pub storage: StorageBackend,

    /// Number of scheduled snapshots to keep; unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,
}

/// Exactly one initialization source
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_source: Option<SnapshotSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_wal: Option<PostgresWalSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSource {
    /// SQL executed against the primary once it first accepts connections
    pub sql: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    /// Namespace of the snapshot; defaults to the cluster's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresWalSource {
    /// Backend whose prefix points at an existing archive
    pub storage: StorageBackend,

    /// Stop replay after this position (`X/Y`); replays everything when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to: Option<String>,
}

/// Initialization source resolved from an [`InitSpec`]
#[derive(Clone, Debug, PartialEq)]
pub enum InitSource<'a> {
    None,
    Script(&'a ScriptSource),
    Snapshot(&'a SnapshotSource),
    WalArchive(&'a PostgresWalSource),
}

impl PostgresClusterSpec {
    /// The configured initialization source, first match wins
    pub fn init_source(&self) -> InitSource<'_> {
        match &self.init {
            Some(InitSpec {
                script: Some(s), ..
            }) => InitSource::Script(s),
            Some(InitSpec {
                snapshot_source: Some(s),
                ..
            }) => InitSource::Snapshot(s),
            Some(InitSpec {
                postgres_wal: Some(w),
                ..
            }) => InitSource::WalArchive(w),
            _ => InitSource::None,
        }
    }

    /// Value of an environment variable from the spec, if set
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

/// Status of the PostgresCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Ordinal of the current primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<MemberId>,

    /// Timeline recorded by the failover coordinator
    #[serde(default)]
    pub timeline: Timeline,

    /// Promotion that was started but not yet confirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_promotion: Option<PendingPromotion>,

    /// Per-member role and readiness
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberStatus>,

    #[serde(default)]
    pub ready_members: i32,

    #[serde(default)]
    pub desired_members: i32,

    /// Member currently behind the write endpoint; absent while fenced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_endpoint: Option<MemberId>,

    /// Members currently behind the read endpoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_endpoints: Vec<MemberId>,

    /// Name of the most recent successful snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<String>,

    /// Set once initialization or resume has completed
    #[serde(default)]
    pub initialized: bool,

    /// Last spec version fully reconciled
    #[serde(default)]
    pub spec_version: u64,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the current phase was entered (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PostgresClusterStatus {
    pub fn member(&self, id: MemberId) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Members reporting the primary role on the recorded timeline
    pub fn primaries_on_current_timeline(&self) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|m| m.role == MemberRole::Primary && m.timeline == Some(self.timeline))
            .map(|m| m.id)
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingPromotion {
    pub candidate: MemberId,
    pub timeline: Timeline,
    pub started_at: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub id: MemberId,
    pub name: String,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub health: MemberHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Timeline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<WalPosition>,
    /// Bytes behind the primary; standbys only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_bytes: Option<u64>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// Members are being created or the cluster is resuming
    #[default]
    Provisioning,
    /// A primary accepts writes
    Running,
    /// No primary accepts writes; failover or repair in progress
    Failing,
    /// Deleted under the Pause policy; data retained
    Paused,
    /// Being removed
    Terminating,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Provisioning => write!(f, "Provisioning"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Failing => write!(f, "Failing"),
            ClusterPhase::Paused => write!(f, "Paused"),
            ClusterPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
