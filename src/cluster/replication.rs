//! Replication Topology Manager
//!
//! Turns the spec into a desired member set and plans the actions that move the
//! observed set toward it. Planning is pure; [`apply_actions`] executes a plan and
//! keeps going past individual failures.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::cluster::EngineContext;
use crate::cluster::model::{ClusterKey, MemberId, MemberRole, Timeline};
use crate::cluster::ports::{Bootstrap, MemberSpec};
use crate::cluster::topology::TopologySnapshot;
use crate::controller::error::{Error, Result};
use crate::crd::{EnvVar, PostgresClusterSpec, StandbyMode, StorageSpec, StorageType};

/// Member count and standby mode wanted by the spec
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DesiredTopology {
    pub count: u32,
    pub standby_mode: StandbyMode,
}

pub fn desired_topology(spec: &PostgresClusterSpec) -> DesiredTopology {
    DesiredTopology {
        count: u32::try_from(spec.replicas).unwrap_or(0).max(1),
        standby_mode: spec.standby_mode,
    }
}

/// Settings shared by every member of a cluster
#[derive(Clone, Debug, PartialEq)]
pub struct MemberTemplate {
    pub version: String,
    pub storage: StorageSpec,
    pub ephemeral: bool,
    pub standby_mode: StandbyMode,
    pub postgresql_params: BTreeMap<String, String>,
    pub env: Vec<EnvVar>,
    pub credentials_secret: String,
}

impl MemberTemplate {
    pub fn from_spec(spec: &PostgresClusterSpec, credentials_secret: &str) -> Self {
        Self {
            version: spec.version.clone(),
            storage: spec.storage.clone(),
            ephemeral: spec.storage_type == StorageType::Ephemeral,
            standby_mode: spec.standby_mode,
            postgresql_params: spec.postgresql_params.clone(),
            env: spec.env.clone(),
            credentials_secret: credentials_secret.to_string(),
        }
    }

    pub fn member_spec(
        &self,
        id: MemberId,
        bootstrap: Bootstrap,
        upstream: Option<MemberId>,
    ) -> MemberSpec {
        MemberSpec {
            id,
            bootstrap,
            upstream,
            standby_mode: self.standby_mode,
            version: self.version.clone(),
            storage: self.storage.clone(),
            ephemeral: self.ephemeral,
            postgresql_params: self.postgresql_params.clone(),
            env: self.env.clone(),
            credentials_secret: self.credentials_secret.clone(),
        }
    }
}

/// How members without a primary to copy from get their data
#[derive(Clone, Debug, PartialEq)]
pub enum BootstrapPlan {
    /// initdb on ordinal 0
    Fresh,
    /// Ordinal 0 starts empty and is fed from an archive
    ArchiveRecovery,
    /// Members restart on the preserved volumes listed here
    Resume { volumes: Vec<String> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum MemberAction {
    Create(MemberSpec),
    Reconfigure(MemberSpec),
    Remove(MemberId),
}

/// Plan the actions that move `observed` toward `desired`.
///
/// Never removes or recreates the recorded primary: a missing primary slot is left to
/// the failover coordinator, and a surplus primary is released by it first. Surplus
/// members are removed highest ordinal first.
pub fn converge(
    cluster: &ClusterKey,
    desired: DesiredTopology,
    observed: &TopologySnapshot,
    primary: Option<MemberId>,
    plan: &BootstrapPlan,
    template: &MemberTemplate,
) -> Vec<MemberAction> {
    let mut actions = Vec::new();

    for ordinal in 0..desired.count {
        let id = MemberId(ordinal);
        match observed.member(id) {
            Some(member) => {
                let is_primary = Some(id) == primary || member.role == MemberRole::Primary;
                if !is_primary
                    && member
                        .standby_mode
                        .is_some_and(|mode| mode != desired.standby_mode)
                {
                    actions.push(MemberAction::Reconfigure(template.member_spec(
                        id,
                        Bootstrap::Existing,
                        primary,
                    )));
                }
            }
            None if Some(id) == primary => {}
            None => match (primary, plan) {
                (Some(p), _) => actions.push(MemberAction::Create(template.member_spec(
                    id,
                    Bootstrap::Replica,
                    Some(p),
                ))),
                (None, BootstrapPlan::Resume { volumes }) => {
                    if volumes.contains(&cluster.volume_name(id)) {
                        actions.push(MemberAction::Create(template.member_spec(
                            id,
                            Bootstrap::Existing,
                            None,
                        )));
                    }
                }
                (None, BootstrapPlan::Fresh) if ordinal == 0 => actions.push(
                    MemberAction::Create(template.member_spec(id, Bootstrap::InitDb, None)),
                ),
                (None, BootstrapPlan::ArchiveRecovery) if ordinal == 0 => {
                    actions.push(MemberAction::Create(template.member_spec(
                        id,
                        Bootstrap::ArchiveRecovery,
                        None,
                    )))
                }
                // Standbys wait for a primary to copy from
                (None, _) => {}
            },
        }
    }

    let mut surplus: Vec<MemberId> = observed
        .ids()
        .into_iter()
        .filter(|id| id.0 >= desired.count && Some(*id) != primary)
        .collect();
    surplus.sort_by(|a, b| b.cmp(a));
    actions.extend(surplus.into_iter().map(MemberAction::Remove));

    actions
}

/// Members behind the read endpoint. Warm standbys reject reads, so only the primary
/// serves them; hot standbys on the current timeline within the lag bound join it.
pub fn read_targets(
    mode: StandbyMode,
    observed: &TopologySnapshot,
    primary: MemberId,
    timeline: Timeline,
    max_lag_bytes: u64,
) -> Vec<MemberId> {
    let mut targets = vec![primary];
    if mode == StandbyMode::Hot {
        targets.extend(
            observed
                .members()
                .filter(|m| {
                    m.id != primary
                        && m.is_ready_standby()
                        && m.timeline == Some(timeline)
                        && observed
                            .lag_bytes(m.id, primary)
                            .is_some_and(|lag| lag <= max_lag_bytes)
                })
                .map(|m| m.id),
        );
    }
    targets
}

/// Execute a plan. Every action is attempted; the first failure is returned after
/// the rest have run.
pub async fn apply_actions(
    ctx: &EngineContext,
    cluster: &ClusterKey,
    actions: &[MemberAction],
) -> Result<usize> {
    let mut first_error: Option<Error> = None;
    let mut applied = 0;

    for action in actions {
        let result = match action {
            MemberAction::Create(spec) => {
                info!(
                    cluster = %cluster,
                    member = %spec.id,
                    bootstrap = ?spec.bootstrap,
                    "Creating member"
                );
                ctx.compute.create_member(cluster, spec).await
            }
            MemberAction::Reconfigure(spec) => {
                info!(
                    cluster = %cluster,
                    member = %spec.id,
                    standby_mode = ?spec.standby_mode,
                    "Reconfiguring member"
                );
                ctx.compute.reconfigure_member(cluster, spec).await
            }
            MemberAction::Remove(id) => {
                info!(cluster = %cluster, member = %id, "Removing surplus member");
                ctx.compute.delete_member(cluster, *id).await
            }
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => {
                warn!(cluster = %cluster, ?action, error = %e, "Member action failed");
                first_error.get_or_insert(e.into());
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(applied),
    }
}
