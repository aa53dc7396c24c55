//! DormantRecord: what a paused cluster leaves behind

use chrono::{DateTime, Utc};

use crate::cluster::model::{ClusterKey, MemberId, Timeline};
use crate::crd::{DormantPhase, PostgresClusterSpec};

#[derive(Clone, Debug, PartialEq)]
pub struct DormantRecord {
    pub cluster: ClusterKey,
    /// Spec the cluster was running when it was paused
    pub spec: PostgresClusterSpec,
    pub volumes: Vec<String>,
    pub credentials_secret: Option<String>,
    pub last_primary: Option<MemberId>,
    pub timeline: Timeline,
    pub initialized: bool,
    pub wipe_out: bool,
    pub phase: DormantPhase,
    pub paused_at: DateTime<Utc>,
}

impl DormantRecord {
    /// Reason a new spec cannot resume from this record, if any
    pub fn incompatibility(&self, spec: &PostgresClusterSpec) -> Option<String> {
        if self.phase == DormantPhase::WipedOut {
            return Some(format!(
                "dormant database {} was wiped out; delete it before recreating the cluster",
                self.cluster
            ));
        }
        if spec.storage != self.spec.storage {
            return Some(format!(
                "storage of {} must match the paused cluster ({:?})",
                self.cluster, self.spec.storage
            ));
        }
        if spec.storage_type != self.spec.storage_type {
            return Some(format!(
                "storageType of {} must match the paused cluster ({:?})",
                self.cluster, self.spec.storage_type
            ));
        }
        if let (Some(requested), Some(kept)) = (&spec.database_secret, &self.credentials_secret)
            && requested != kept
        {
            return Some(format!(
                "databaseSecret of {} must be {} to resume",
                self.cluster, kept
            ));
        }
        None
    }
}
