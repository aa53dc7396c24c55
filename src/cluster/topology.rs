//! Topology Observer
//!
//! Samples every member once per pass and freezes the result into a
//! [`TopologySnapshot`]. All decisions within a pass are made against the same
//! snapshot, so two components never disagree about what exists.

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::debug;

use crate::cluster::model::{ClusterKey, MemberHealth, MemberId, MemberRole, Timeline, WalPosition};
use crate::cluster::ports::{ComputeRuntime, DatabaseClient};
use crate::controller::error::Result;
use crate::crd::{MemberStatus, StandbyMode};

/// One member as seen at observation time
#[derive(Clone, Debug, PartialEq)]
pub struct MemberState {
    pub id: MemberId,
    pub health: MemberHealth,
    pub role: MemberRole,
    pub timeline: Option<Timeline>,
    pub position: Option<WalPosition>,
    pub upstream: Option<MemberId>,
    pub standby_mode: Option<StandbyMode>,
}

impl MemberState {
    pub fn is_ready(&self) -> bool {
        self.health == MemberHealth::Ready
    }

    pub fn claims_primary(&self) -> bool {
        self.is_ready() && self.role == MemberRole::Primary
    }

    pub fn is_ready_standby(&self) -> bool {
        self.is_ready() && self.role == MemberRole::Standby
    }
}

/// Consistent view of what exists now
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopologySnapshot {
    members: BTreeMap<MemberId, MemberState>,
}

impl TopologySnapshot {
    pub fn from_members(members: impl IntoIterator<Item = MemberState>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub fn member(&self, id: MemberId) -> Option<&MemberState> {
        self.members.get(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values()
    }

    pub fn ids(&self) -> Vec<MemberId> {
        self.members.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members that answer a probe as primary
    pub fn primary_claims(&self) -> Vec<&MemberState> {
        self.members.values().filter(|m| m.claims_primary()).collect()
    }

    pub fn ready_count(&self) -> usize {
        self.members.values().filter(|m| m.is_ready()).count()
    }

    /// Bytes `id` trails `primary` by, when both positions are known
    pub fn lag_bytes(&self, id: MemberId, primary: MemberId) -> Option<u64> {
        let member = self.member(id)?.position?;
        let primary = self.member(primary)?.position?;
        Some(member.lag_behind(primary))
    }

    /// Rendered for the status surface
    pub fn member_statuses(
        &self,
        cluster: &ClusterKey,
        primary: Option<MemberId>,
    ) -> Vec<MemberStatus> {
        self.members
            .values()
            .map(|m| MemberStatus {
                id: m.id,
                name: cluster.member_name(m.id),
                role: m.role,
                health: m.health,
                timeline: m.timeline,
                position: m.position,
                lag_bytes: match primary {
                    Some(p) if p != m.id && m.role == MemberRole::Standby => self.lag_bytes(m.id, p),
                    _ => None,
                },
            })
            .collect()
    }
}

/// Samples the compute runtime and probes each ready member
pub struct TopologyObserver<'a> {
    compute: &'a dyn ComputeRuntime,
    database: &'a dyn DatabaseClient,
}

impl<'a> TopologyObserver<'a> {
    pub fn new(compute: &'a dyn ComputeRuntime, database: &'a dyn DatabaseClient) -> Self {
        Self { compute, database }
    }

    /// Listing failures abort the pass; a failed probe only marks that member unreachable
    pub async fn observe(&self, cluster: &ClusterKey) -> Result<TopologySnapshot> {
        let observed = self.compute.list_members(cluster).await?;

        let probes = observed.iter().map(|obs| async move {
            if obs.health != MemberHealth::Ready {
                return MemberState {
                    id: obs.id,
                    health: obs.health,
                    role: MemberRole::Unknown,
                    timeline: None,
                    position: None,
                    upstream: None,
                    standby_mode: obs.standby_mode,
                };
            }
            match self.database.probe(cluster, obs.id).await {
                Ok(report) => MemberState {
                    id: obs.id,
                    health: MemberHealth::Ready,
                    role: report.role,
                    timeline: Some(report.timeline),
                    position: Some(report.position),
                    upstream: report.upstream,
                    standby_mode: obs.standby_mode,
                },
                Err(e) => {
                    debug!(cluster = %cluster, member = %obs.id, error = %e, "Probe failed");
                    MemberState {
                        id: obs.id,
                        health: MemberHealth::Unreachable,
                        role: MemberRole::Unknown,
                        timeline: None,
                        position: None,
                        upstream: None,
                        standby_mode: obs.standby_mode,
                    }
                }
            }
        });

        Ok(TopologySnapshot::from_members(join_all(probes).await))
    }
}
