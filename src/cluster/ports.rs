//! Collaborator interfaces the engine drives but never implements itself.
//!
//! Kubernetes-backed implementations live in [`crate::resources`] and [`crate::postgres`];
//! the in-memory stores in [`crate::cluster::memory`] and the simulated cluster in the
//! test suite implement them as well.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cluster::dormant::DormantRecord;
use crate::cluster::model::{ClusterKey, MemberHealth, MemberId, MemberRole, Timeline, WalPosition};
use crate::cluster::snapshot::SnapshotRecord;
use crate::crd::{EnvVar, PostgresClusterStatus, StandbyMode, StorageSpec};

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("kubernetes API: {0}")]
    Kube(#[from] kube::Error),
}

pub type PortResult<T> = std::result::Result<T, CollaboratorError>;

/// How a new member obtains its data directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bootstrap {
    /// Fresh initdb; becomes the first primary
    InitDb,
    /// Base backup streamed from the upstream, then follows it
    Replica,
    /// Starts on a preserved volume with whatever role its data says
    Existing,
    /// Empty data directory held in recovery until promoted; fed from an archive
    ArchiveRecovery,
}

/// Everything the compute runtime needs to start one member
#[derive(Clone, Debug, PartialEq)]
pub struct MemberSpec {
    pub id: MemberId,
    pub bootstrap: Bootstrap,
    pub upstream: Option<MemberId>,
    pub standby_mode: StandbyMode,
    pub version: String,
    pub storage: StorageSpec,
    pub ephemeral: bool,
    pub postgresql_params: BTreeMap<String, String>,
    pub env: Vec<EnvVar>,
    pub credentials_secret: String,
}

/// What the compute runtime knows about a member without talking to the database
#[derive(Clone, Debug, PartialEq)]
pub struct MemberObservation {
    pub id: MemberId,
    pub health: MemberHealth,
    /// Standby mode the member was started with
    pub standby_mode: Option<StandbyMode>,
}

/// Result of a database health probe
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeReport {
    pub role: MemberRole,
    pub timeline: Timeline,
    /// Write position on a primary, replay position on a standby
    pub position: WalPosition,
    /// Upstream the member streams from, when it is a standby
    pub upstream: Option<MemberId>,
}

/// Compute/pod lifecycle collaborator
#[async_trait]
pub trait ComputeRuntime: Send + Sync {
    async fn list_members(&self, cluster: &ClusterKey) -> PortResult<Vec<MemberObservation>>;

    /// Create the member if it does not exist; idempotent
    async fn create_member(&self, cluster: &ClusterKey, spec: &MemberSpec) -> PortResult<()>;

    /// Remove the member's compute; its volume is kept
    async fn delete_member(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<()>;

    /// Restart with a changed configuration on the same volume
    async fn reconfigure_member(&self, cluster: &ClusterKey, spec: &MemberSpec) -> PortResult<()>;

    /// Demote and resynchronise a member as standby of `upstream`
    async fn rejoin_member(
        &self,
        cluster: &ClusterKey,
        id: MemberId,
        upstream: MemberId,
    ) -> PortResult<()>;

    /// Point the write endpoint at `target`, or make it unavailable with `None`
    async fn route_writes(&self, cluster: &ClusterKey, target: Option<MemberId>) -> PortResult<()>;

    async fn route_reads(&self, cluster: &ClusterKey, targets: &[MemberId]) -> PortResult<()>;

    async fn list_volumes(&self, cluster: &ClusterKey) -> PortResult<Vec<String>>;

    async fn delete_volumes(&self, cluster: &ClusterKey) -> PortResult<()>;
}

/// Database connectivity collaborator
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn probe(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<ProbeReport>;

    /// End recovery on `id`; the member comes up on `timeline`
    async fn promote(&self, cluster: &ClusterKey, id: MemberId, timeline: Timeline)
    -> PortResult<()>;

    async fn execute_script(&self, cluster: &ClusterKey, id: MemberId, sql: &str)
    -> PortResult<()>;

    /// Consistent logical dump of every database
    async fn dump(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<Bytes>;

    async fn restore_dump(&self, cluster: &ClusterKey, id: MemberId, dump: Bytes)
    -> PortResult<()>;

    /// Completed WAL segments waiting to be archived, oldest first
    async fn ready_segments(&self, cluster: &ClusterKey, id: MemberId) -> PortResult<Vec<String>>;

    async fn read_segment(&self, cluster: &ClusterKey, id: MemberId, segment: &str)
    -> PortResult<Bytes>;

    /// Acknowledge that a segment is safely archived
    async fn mark_archived(&self, cluster: &ClusterKey, id: MemberId, segment: &str)
    -> PortResult<()>;

    /// Apply an archived segment to a member held in recovery
    async fn replay_segment(
        &self,
        cluster: &ClusterKey,
        id: MemberId,
        segment: &str,
        data: Bytes,
    ) -> PortResult<()>;
}

/// Credential/secret storage collaborator
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Return the secret to use, generating one when `existing` is `None`
    async fn ensure(&self, cluster: &ClusterKey, existing: Option<&str>) -> PortResult<String>;

    async fn exists(&self, cluster: &ClusterKey, name: &str) -> PortResult<bool>;

    async fn delete(&self, cluster: &ClusterKey, name: &str) -> PortResult<()>;
}

/// Persistence for DormantRecords
#[async_trait]
pub trait DormantStore: Send + Sync {
    async fn get(&self, cluster: &ClusterKey) -> PortResult<Option<DormantRecord>>;

    async fn put(&self, record: &DormantRecord) -> PortResult<()>;

    async fn delete(&self, cluster: &ClusterKey) -> PortResult<()>;
}

/// Receives every committed status of a cluster
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, cluster: &ClusterKey, status: &PostgresClusterStatus)
    -> PortResult<()>;
}

/// Persistence for SnapshotRecords
#[async_trait]
pub trait SnapshotCatalog: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> PortResult<Option<SnapshotRecord>>;

    async fn upsert(&self, record: &SnapshotRecord) -> PortResult<()>;

    /// Records whose source is `cluster`
    async fn list(&self, cluster: &ClusterKey) -> PortResult<Vec<SnapshotRecord>>;

    async fn remove(&self, namespace: &str, name: &str) -> PortResult<()>;
}
