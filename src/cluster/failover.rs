//! Leader/Failover Coordinator
//!
//! Owns the decision of which member is primary. The recorded primary and timeline
//! live in the cluster status, which only the cluster's control loop writes, so the
//! coordinator is the single writer of "current primary" without any shared state.
//!
//! A promotion always runs in this order:
//!
//! 1. fence the write endpoint
//! 2. commit the incremented timeline together with a pending-promotion marker
//! 3. promote the candidate and poll until it answers as primary
//! 4. record the new primary, then re-join every other member to it
//!
//! The write endpoint is routed again by the lifecycle pass only after step 4, so
//! there is no moment at which writes can reach two members. An interrupted promotion
//! is found through the marker on the next pass and finished or abandoned there; a
//! second promotion never starts while one is pending.

use std::cmp::Reverse;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::EngineContext;
use crate::cluster::ledger::StatusLedger;
use crate::cluster::model::{ClusterKey, MemberId, MemberRole, Timeline, WalPosition};
use crate::cluster::ports::CollaboratorError;
use crate::cluster::topology::TopologySnapshot;
use crate::cluster::wait::{Check, WaitOutcome, poll_until};
use crate::config::EngineConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{PendingPromotion, PostgresClusterStatus};

/// A member answering a probe as primary
#[derive(Clone, Debug, PartialEq)]
pub struct Claim {
    pub id: MemberId,
    pub timeline: Timeline,
    pub position: WalPosition,
}

impl Claim {
    pub fn from_snapshot(snapshot: &TopologySnapshot) -> Vec<Claim> {
        snapshot
            .primary_claims()
            .into_iter()
            .filter_map(|m| {
                Some(Claim {
                    id: m.id,
                    timeline: m.timeline?,
                    position: m.position.unwrap_or_default(),
                })
            })
            .collect()
    }
}

/// Outcome of comparing primary claims against the recorded timeline
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimResolution {
    /// The one claim accepted as primary
    pub accepted: Option<MemberId>,
    /// Recorded timeline after resolution; never lower than before
    pub timeline: Timeline,
    /// Losing claims, to be re-joined under `accepted`
    pub demote: Vec<MemberId>,
    /// Stale claims with no accepted primary to re-join under; kept fenced
    pub unresolved: Vec<MemberId>,
}

/// Highest timeline wins. On equal timelines the recorded primary keeps the role,
/// otherwise the most advanced position, then the lowest ordinal. Claims below the
/// recorded timeline are never accepted.
pub fn resolve_claims(
    recorded_primary: Option<MemberId>,
    recorded: Timeline,
    claims: &[Claim],
) -> ClaimResolution {
    let winner = claims
        .iter()
        .filter(|c| c.timeline >= recorded)
        .max_by_key(|c| {
            (
                c.timeline,
                Some(c.id) == recorded_primary,
                c.position,
                Reverse(c.id),
            )
        });

    match winner {
        Some(w) => ClaimResolution {
            accepted: Some(w.id),
            timeline: w.timeline.max(recorded),
            demote: claims
                .iter()
                .filter(|c| c.id != w.id)
                .map(|c| c.id)
                .collect(),
            unresolved: Vec::new(),
        },
        None => ClaimResolution {
            accepted: None,
            timeline: recorded,
            demote: Vec::new(),
            unresolved: claims.iter().map(|c| c.id).collect(),
        },
    }
}

/// Promotion candidates, best first: Ready standbys ranked by newest timeline, most
/// advanced position, then lowest ordinal.
pub fn rank_candidates(snapshot: &TopologySnapshot, exclude: &[MemberId]) -> Vec<MemberId> {
    let mut candidates: Vec<_> = snapshot
        .members()
        .filter(|m| m.is_ready_standby() && !exclude.contains(&m.id))
        .map(|m| {
            (
                Reverse(m.timeline.unwrap_or_default()),
                Reverse(m.position.unwrap_or_default()),
                m.id,
            )
        })
        .collect();
    candidates.sort();
    candidates.into_iter().map(|(_, _, id)| id).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromotionReason {
    /// Primary unhealthy past the grace deadline
    PrimaryLost,
    /// Scale-down removes the member holding the role
    TopologyShrink,
    /// Operator asked for a named standby
    Switchover,
    /// Archive replay finished on the bootstrap member
    ArchiveRecovery,
}

impl PromotionReason {
    /// The old primary is still alive and the candidate must catch up first
    pub fn is_planned(self) -> bool {
        matches!(
            self,
            PromotionReason::TopologyShrink | PromotionReason::Switchover
        )
    }
}

impl fmt::Display for PromotionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromotionReason::PrimaryLost => write!(f, "PrimaryLost"),
            PromotionReason::TopologyShrink => write!(f, "TopologyShrink"),
            PromotionReason::Switchover => write!(f, "Switchover"),
            PromotionReason::ArchiveRecovery => write!(f, "ArchiveRecovery"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FailoverDecision {
    /// Nothing to do
    Steady,
    /// Primary is unhealthy but still inside its grace period
    Waiting { remaining: Duration },
    Promote {
        candidate: MemberId,
        reason: PromotionReason,
    },
    /// A promotion is needed but no member qualifies
    NoCandidate { reason: PromotionReason },
}

/// What happened to roles during a pass
#[derive(Clone, Debug, PartialEq)]
pub enum RoleOutcome {
    Steady,
    Waiting(Duration),
    Promoted(MemberId),
    NoCandidate,
}

pub struct FailoverCoordinator {
    grace: Duration,
    promotion_timeout: Duration,
    poll_interval: Duration,
    unhealthy_since: Option<Instant>,
    switchover: Option<MemberId>,
}

impl FailoverCoordinator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            grace: config.failover_grace,
            promotion_timeout: config.promotion_timeout,
            poll_interval: config.poll_interval,
            unhealthy_since: None,
            switchover: None,
        }
    }

    pub fn current_primary(status: &PostgresClusterStatus) -> Option<MemberId> {
        status.primary
    }

    /// Ask for `target` to take over at the next pass
    pub fn request_switchover(&mut self, target: MemberId) {
        self.switchover = Some(target);
    }

    /// Primary-loss detection with a grace deadline. Health of any member other than
    /// the recorded primary does not affect roles.
    pub fn on_member_unhealthy(
        &mut self,
        id: MemberId,
        status: &PostgresClusterStatus,
        snapshot: &TopologySnapshot,
        now: Instant,
    ) -> FailoverDecision {
        if status.primary != Some(id) {
            return FailoverDecision::Steady;
        }
        let healthy = snapshot
            .member(id)
            .is_some_and(|m| m.claims_primary() && m.timeline == Some(status.timeline));
        if healthy {
            self.unhealthy_since = None;
            return FailoverDecision::Steady;
        }

        let since = *self.unhealthy_since.get_or_insert(now);
        let elapsed = now.saturating_duration_since(since);
        if elapsed < self.grace {
            return FailoverDecision::Waiting {
                remaining: self.grace - elapsed,
            };
        }
        elect(snapshot, &[id], PromotionReason::PrimaryLost)
    }

    /// Release the role ahead of a scale-down that removes the primary
    pub fn on_topology_shrink(
        &self,
        status: &PostgresClusterStatus,
        snapshot: &TopologySnapshot,
        desired: u32,
    ) -> Option<FailoverDecision> {
        let primary = status.primary?;
        if primary.0 < desired {
            return None;
        }
        let surplus: Vec<MemberId> = snapshot.ids().into_iter().filter(|id| id.0 >= desired).collect();
        Some(elect(snapshot, &surplus, PromotionReason::TopologyShrink))
    }

    pub fn decide(
        &mut self,
        status: &PostgresClusterStatus,
        snapshot: &TopologySnapshot,
        desired: u32,
        now: Instant,
    ) -> FailoverDecision {
        let Some(primary) = status.primary else {
            // Before initialization the bootstrap member produces the first primary
            if !status.initialized {
                return FailoverDecision::Steady;
            }
            return elect(snapshot, &[], PromotionReason::PrimaryLost);
        };

        if let Some(decision) = self.on_topology_shrink(status, snapshot, desired) {
            return decision;
        }

        if let Some(target) = self.switchover.take()
            && target != primary
        {
            if snapshot.member(target).is_some_and(|m| m.is_ready_standby()) {
                return FailoverDecision::Promote {
                    candidate: target,
                    reason: PromotionReason::Switchover,
                };
            }
            warn!(member = %target, "Switchover target is not a ready standby; ignoring request");
        }

        self.on_member_unhealthy(primary, status, snapshot, now)
    }

    /// Settle roles for this pass: finish a pending promotion, resolve primary claims,
    /// fail over or switch over, and re-join standbys following the wrong stream.
    pub async fn reconcile_roles(
        &mut self,
        ctx: &EngineContext,
        ledger: &mut StatusLedger,
        snapshot: &TopologySnapshot,
        desired: u32,
    ) -> Result<RoleOutcome> {
        let key = ledger.cluster().clone();

        if let Some(pending) = ledger.status().pending_promotion.clone() {
            return self.resume_pending(ctx, ledger, snapshot, pending).await;
        }

        let status = ledger.status();
        let resolution = resolve_claims(status.primary, status.timeline, &Claim::from_snapshot(snapshot));
        if let Some(accepted) = resolution.accepted
            && (status.primary != Some(accepted) || status.timeline != resolution.timeline)
        {
            info!(
                cluster = %key,
                member = %accepted,
                timeline = %resolution.timeline,
                "Recording primary"
            );
            let s = ledger.status_mut();
            s.primary = Some(accepted);
            s.timeline = resolution.timeline;
            ledger.commit().await?;
        }
        if let Some(winner) = resolution.accepted {
            for stale in &resolution.demote {
                self.force_demote(ctx, &key, *stale, winner).await;
            }
        }
        for stale in &resolution.unresolved {
            warn!(
                cluster = %key,
                member = %stale,
                timeline = %ledger.status().timeline,
                "Primary claim below the recorded timeline; keeping it fenced"
            );
        }

        match self.decide(ledger.status(), snapshot, desired, Instant::now()) {
            FailoverDecision::Steady => {}
            FailoverDecision::Waiting { remaining } => {
                debug!(cluster = %key, ?remaining, "Primary unhealthy, inside grace period");
                return Ok(RoleOutcome::Waiting(remaining));
            }
            FailoverDecision::Promote { candidate, reason } => {
                self.promote(ctx, ledger, snapshot, candidate, reason).await?;
                return Ok(RoleOutcome::Promoted(candidate));
            }
            FailoverDecision::NoCandidate { reason } => {
                warn!(cluster = %key, %reason, "Promotion needed but no standby qualifies");
                return Ok(RoleOutcome::NoCandidate);
            }
        }

        if let Some(primary) = ledger.status().primary {
            let timeline = ledger.status().timeline;
            for m in snapshot.members() {
                let behind = m.timeline.is_some_and(|t| t < timeline);
                let wrong_upstream = m.upstream.is_some_and(|u| u != primary);
                if m.is_ready_standby() && (behind || wrong_upstream) {
                    info!(cluster = %key, member = %m.id, "Re-joining standby to the current primary");
                    if let Err(e) = ctx.compute.rejoin_member(&key, m.id, primary).await {
                        warn!(cluster = %key, member = %m.id, error = %e, "Re-join failed");
                    }
                }
            }
        }
        Ok(RoleOutcome::Steady)
    }

    /// Fence, commit the new timeline, promote and wait for confirmation
    pub async fn promote(
        &mut self,
        ctx: &EngineContext,
        ledger: &mut StatusLedger,
        snapshot: &TopologySnapshot,
        candidate: MemberId,
        reason: PromotionReason,
    ) -> Result<()> {
        let key = ledger.cluster().clone();
        info!(cluster = %key, member = %candidate, %reason, "Starting promotion");

        ctx.compute.route_writes(&key, None).await?;
        ledger.status_mut().write_endpoint = None;

        if reason.is_planned()
            && let Some(old) = ledger.status().primary
            && old != candidate
        {
            self.await_catch_up(ctx, &key, old, candidate).await?;
        }

        let candidate_timeline = snapshot
            .member(candidate)
            .and_then(|m| m.timeline)
            .unwrap_or_default();
        let timeline = ledger.status().timeline.max(candidate_timeline).next();
        let pending = PendingPromotion {
            candidate,
            timeline,
            started_at: Utc::now().to_rfc3339(),
        };
        {
            let s = ledger.status_mut();
            s.timeline = timeline;
            s.pending_promotion = Some(pending.clone());
            s.primary = None;
        }
        ledger.commit().await?;

        self.complete_promotion(ctx, ledger, &pending).await
    }

    async fn resume_pending(
        &mut self,
        ctx: &EngineContext,
        ledger: &mut StatusLedger,
        snapshot: &TopologySnapshot,
        pending: PendingPromotion,
    ) -> Result<RoleOutcome> {
        let key = ledger.cluster().clone();
        let candidate_alive = snapshot
            .member(pending.candidate)
            .is_some_and(|m| m.is_ready() && m.role != MemberRole::Unknown);

        if candidate_alive {
            info!(
                cluster = %key,
                member = %pending.candidate,
                timeline = %pending.timeline,
                "Resuming interrupted promotion"
            );
            self.complete_promotion(ctx, ledger, &pending).await?;
            return Ok(RoleOutcome::Promoted(pending.candidate));
        }

        warn!(
            cluster = %key,
            member = %pending.candidate,
            "Promotion candidate is gone; choosing another"
        );
        ledger.status_mut().pending_promotion = None;
        ledger.commit().await?;

        match elect(snapshot, &[pending.candidate], PromotionReason::PrimaryLost) {
            FailoverDecision::Promote { candidate, reason } => {
                self.promote(ctx, ledger, snapshot, candidate, reason).await?;
                Ok(RoleOutcome::Promoted(candidate))
            }
            _ => Ok(RoleOutcome::NoCandidate),
        }
    }

    async fn complete_promotion(
        &mut self,
        ctx: &EngineContext,
        ledger: &mut StatusLedger,
        pending: &PendingPromotion,
    ) -> Result<()> {
        let key = ledger.cluster().clone();
        let candidate = pending.candidate;
        let target = pending.timeline;

        ctx.database.promote(&key, candidate, target).await?;

        let outcome = poll_until(self.promotion_timeout, self.poll_interval, || {
            let database = ctx.database.clone();
            let key = key.clone();
            async move {
                match database.probe(&key, candidate).await {
                    Ok(r) if r.role == MemberRole::Primary && r.timeline >= target => {
                        Check::Done(r.timeline)
                    }
                    Ok(_) => Check::NotYet,
                    Err(CollaboratorError::NotFound(what)) => Check::Abort(what),
                    Err(_) => Check::NotYet,
                }
            }
        })
        .await;

        let confirmed = match outcome {
            WaitOutcome::Satisfied(timeline) => timeline,
            WaitOutcome::TimedOut => {
                return Err(Error::TransientInfra(format!(
                    "member {} did not confirm promotion within {:?}",
                    candidate, self.promotion_timeout
                )));
            }
            WaitOutcome::Failed(reason) => {
                ledger.status_mut().pending_promotion = None;
                ledger.commit().await?;
                return Err(Error::TransientInfra(format!(
                    "promotion of member {} abandoned: {}",
                    candidate, reason
                )));
            }
        };

        {
            let s = ledger.status_mut();
            s.primary = Some(candidate);
            s.timeline = s.timeline.max(confirmed);
            s.pending_promotion = None;
        }
        ledger.commit().await?;
        self.unhealthy_since = None;
        ctx.metrics.record_promotion(&key.namespace, &key.name);
        info!(cluster = %key, member = %candidate, timeline = %confirmed, "Promotion confirmed");

        // Everyone else follows the new stream
        for member in ctx.compute.list_members(&key).await? {
            if member.id == candidate {
                continue;
            }
            if let Err(e) = ctx.compute.rejoin_member(&key, member.id, candidate).await {
                warn!(cluster = %key, member = %member.id, error = %e, "Re-join after promotion failed");
            }
        }
        Ok(())
    }

    async fn await_catch_up(
        &self,
        ctx: &EngineContext,
        key: &ClusterKey,
        old: MemberId,
        candidate: MemberId,
    ) -> Result<()> {
        let outcome = poll_until(self.promotion_timeout, self.poll_interval, || {
            let database = ctx.database.clone();
            let key = key.clone();
            async move {
                let (old, new) = match (
                    database.probe(&key, old).await,
                    database.probe(&key, candidate).await,
                ) {
                    (Ok(o), Ok(n)) => (o, n),
                    // The old primary went away; nothing more to wait for
                    (Err(_), Ok(_)) => return Check::Done(()),
                    _ => return Check::NotYet,
                };
                if new.position >= old.position {
                    Check::Done(())
                } else {
                    Check::NotYet
                }
            }
        })
        .await;

        match outcome {
            WaitOutcome::Satisfied(()) => Ok(()),
            _ => Err(Error::TransientInfra(format!(
                "member {} did not catch up with primary {} within {:?}",
                candidate, old, self.promotion_timeout
            ))),
        }
    }

    async fn force_demote(
        &self,
        ctx: &EngineContext,
        key: &ClusterKey,
        stale: MemberId,
        primary: MemberId,
    ) {
        warn!(
            cluster = %key,
            member = %stale,
            primary = %primary,
            "Conflicting primary claim; demoting and re-joining as standby"
        );
        match ctx.compute.rejoin_member(key, stale, primary).await {
            Ok(()) => ctx.metrics.record_forced_demotion(&key.namespace, &key.name),
            Err(e) => warn!(cluster = %key, member = %stale, error = %e, "Forced demotion failed"),
        }
    }
}

fn elect(
    snapshot: &TopologySnapshot,
    exclude: &[MemberId],
    reason: PromotionReason,
) -> FailoverDecision {
    match rank_candidates(snapshot, exclude).first() {
        Some(&candidate) => FailoverDecision::Promote { candidate, reason },
        None => FailoverDecision::NoCandidate { reason },
    }
}
