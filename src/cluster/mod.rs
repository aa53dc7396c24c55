//! The orchestration engine
//!
//! One [`actor`] per cluster identity runs the [`lifecycle`] passes sequentially and
//! owns that cluster's status through a [`ledger::StatusLedger`]. The archiver and
//! snapshot scheduler run beside it as side loops that only read the published status.
//! Everything outside the process is reached through the traits in [`ports`].

pub mod actor;
pub mod archiver;
pub mod dormant;
pub mod failover;
pub mod ledger;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod ports;
pub mod replication;
pub mod snapshot;
pub mod topology;
pub mod wait;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::health::Metrics;
use crate::storage::BackendResolver;

pub use actor::{ClusterHandle, ClusterRegistry};
pub use dormant::DormantRecord;
pub use model::{ClusterKey, MemberHealth, MemberId, MemberRole, Timeline, WalPosition};
pub use snapshot::SnapshotRecord;
pub use wait::WaitOutcome;

use ports::{
    ComputeRuntime, CredentialStore, DatabaseClient, DormantStore, SnapshotCatalog, StatusSink,
};

/// Collaborators and settings shared by every cluster's control loop
#[derive(Clone)]
pub struct EngineContext {
    pub compute: Arc<dyn ComputeRuntime>,
    pub database: Arc<dyn DatabaseClient>,
    pub credentials: Arc<dyn CredentialStore>,
    pub dormant: Arc<dyn DormantStore>,
    pub snapshots: Arc<dyn SnapshotCatalog>,
    pub storage: Arc<dyn BackendResolver>,
    pub status_sink: Option<Arc<dyn StatusSink>>,
    pub config: EngineConfig,
    pub metrics: Arc<Metrics>,
}
