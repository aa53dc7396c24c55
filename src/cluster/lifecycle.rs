//! Lifecycle State Machine
//!
//! One [`ClusterLifecycle`] per cluster identity, driven by its actor. A pass is
//! idempotent: every step re-reads what it needs from observation, so a pass cut short
//! by an error or a newer spec version leaves nothing the next pass cannot pick up.
//!
//! Pass order:
//!
//! 1. pick up a dormant record (resume)
//! 2. make sure credentials exist
//! 3. observe the topology
//! 4. settle roles (failover, claim conflicts, switchover)
//! 5. converge members
//! 6. run initialization once
//! 7. route the endpoints
//! 8. derive the phase and commit status

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::EngineContext;
use crate::cluster::archiver::{WalArchiver, restore_from};
use crate::cluster::dormant::DormantRecord;
use crate::cluster::failover::{FailoverCoordinator, PromotionReason, RoleOutcome};
use crate::cluster::ledger::StatusLedger;
use crate::cluster::model::{ClusterKey, MemberId, MemberRole, WalPosition};
use crate::cluster::replication::{
    BootstrapPlan, MemberTemplate, apply_actions, converge, desired_topology, read_targets,
};
use crate::cluster::snapshot::{SnapshotActivity, delete_snapshot, load_dump};
use crate::cluster::topology::{TopologyObserver, TopologySnapshot};
use crate::controller::error::{Error, ErrorContext, Result};
use crate::controller::state_machine::{
    ClusterEvent, ClusterStateMachine, TransitionContext, next_phase,
};
use crate::controller::status::cluster_conditions;
use crate::crd::{
    ClusterPhase, DormantPhase, InitSource, PostgresClusterSpec, StorageBackend,
    TerminationPolicy,
};
use crate::storage::{StorageError, layout};

/// A whole spec document with its monotonic version
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedSpec {
    pub version: u64,
    pub spec: PostgresClusterSpec,
}

/// What a completed pass asks of its driver
#[derive(Clone, Debug, PartialEq)]
pub struct PassReport {
    pub phase: ClusterPhase,
    pub roles: RoleOutcome,
    /// Run the next pass sooner than the regular interval
    pub requeue_after: Option<Duration>,
}

pub struct ClusterLifecycle {
    key: ClusterKey,
    ctx: EngineContext,
    ledger: StatusLedger,
    coordinator: FailoverCoordinator,
    fsm: ClusterStateMachine,
    spec_rx: watch::Receiver<VersionedSpec>,
    snapshot_activity: watch::Receiver<SnapshotActivity>,
    /// Dormant record being resumed from; cleared once the data is confirmed
    resume: Option<DormantRecord>,
    /// Irrecoverable initialization error and the spec version it happened under
    init_failure: Option<(u64, String)>,
    errors: ErrorContext,
}

impl ClusterLifecycle {
    pub fn new(
        key: ClusterKey,
        ctx: EngineContext,
        ledger: StatusLedger,
        spec_rx: watch::Receiver<VersionedSpec>,
        snapshot_activity: watch::Receiver<SnapshotActivity>,
    ) -> Self {
        let coordinator = FailoverCoordinator::new(&ctx.config);
        Self {
            key,
            ctx,
            ledger,
            coordinator,
            fsm: ClusterStateMachine::new(),
            spec_rx,
            snapshot_activity,
            resume: None,
            init_failure: None,
            errors: ErrorContext::default(),
        }
    }

    pub fn key(&self) -> &ClusterKey {
        &self.key
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn errors(&self) -> &ErrorContext {
        &self.errors
    }

    pub fn request_switchover(&mut self, target: MemberId) {
        self.coordinator.request_switchover(target);
    }

    /// Abandon the pass when a newer spec version has arrived
    fn checkpoint(&self, version: u64) -> Result<()> {
        let latest = self.spec_rx.borrow().version;
        if latest > version {
            debug!(cluster = %self.key, version, latest, "Pass superseded");
            return Err(Error::Superseded(latest));
        }
        Ok(())
    }

    /// Run one reconciliation pass against `desired`
    #[instrument(skip(self, desired), fields(cluster = %self.key, version = desired.version))]
    pub async fn reconcile(&mut self, desired: &VersionedSpec) -> Result<PassReport> {
        let result = self.run_pass(desired).await;
        match &result {
            Ok(_) => self.errors.reset(),
            Err(Error::Superseded(_)) => {}
            Err(e) => {
                self.errors.record_error(e);
                self.ctx
                    .metrics
                    .record_error(&self.key.namespace, &self.key.name);
            }
        }
        result
    }

    async fn run_pass(&mut self, desired: &VersionedSpec) -> Result<PassReport> {
        let started = std::time::Instant::now();
        let version = desired.version;
        let spec = &desired.spec;
        let ctx = self.ctx.clone();
        let key = self.key.clone();

        self.pick_up_dormant(spec).await?;

        let existing_secret = self
            .resume
            .as_ref()
            .and_then(|r| r.credentials_secret.clone())
            .or_else(|| spec.database_secret.clone());
        let secret = ctx
            .credentials
            .ensure(&key, existing_secret.as_deref())
            .await?;
        self.checkpoint(version)?;

        let observer = TopologyObserver::new(ctx.compute.as_ref(), ctx.database.as_ref());
        let mut snapshot = observer.observe(&key).await?;
        self.checkpoint(version)?;

        // Failures below are deferred so one stuck member does not hold up the rest
        let mut deferred: Option<Error> = None;

        let topology = desired_topology(spec);
        let roles = match self
            .coordinator
            .reconcile_roles(&ctx, &mut self.ledger, &snapshot, topology.count)
            .await
        {
            Ok(roles) => roles,
            Err(e) => {
                warn!(cluster = %key, error = %e, "Role reconciliation failed");
                deferred.get_or_insert(e);
                RoleOutcome::Steady
            }
        };
        if matches!(roles, RoleOutcome::Promoted(_)) {
            snapshot = observer.observe(&key).await?;
        }
        self.checkpoint(version)?;

        let primary = self.confirmed_primary();
        let plan = self.bootstrap_plan(spec, primary).await?;
        let template = MemberTemplate::from_spec(spec, &secret);
        let actions = converge(&key, topology, &snapshot, primary, &plan, &template);
        if !actions.is_empty() {
            if let Err(e) = apply_actions(&ctx, &key, &actions).await {
                deferred.get_or_insert(e);
            }
        }
        self.checkpoint(version)?;

        let primary_ready = self.primary_ready(&snapshot);
        let mut init_error = self
            .init_failure
            .as_ref()
            .filter(|(failed_at, _)| *failed_at == version)
            .map(|(_, msg)| msg.clone());

        if !self.ledger.status().initialized && init_error.is_none() {
            match self.initialize(spec, &snapshot, primary_ready).await {
                Ok(true) => {
                    info!(cluster = %key, "Cluster initialized");
                    self.ledger.status_mut().initialized = true;
                    self.ledger.commit().await?;
                    snapshot = observer.observe(&key).await?;
                }
                Ok(false) => debug!(cluster = %key, "Waiting for a primary to initialize"),
                Err(e) if e.is_retryable() => {
                    deferred.get_or_insert(e);
                }
                Err(e) => {
                    error!(cluster = %key, error = %e, "Initialization failed");
                    self.init_failure = Some((version, e.to_string()));
                    init_error = Some(e.to_string());
                }
            }
        }

        let primary_ready = self.primary_ready(&snapshot);
        let writes_routed = match self.route_endpoints(spec, &snapshot, primary_ready).await {
            Ok(routed) => routed,
            Err(e) => {
                deferred.get_or_insert(e);
                false
            }
        };

        let report = self
            .finish_pass(version, spec, &snapshot, roles, writes_routed, init_error, deferred.as_ref())
            .await?;
        ctx.metrics.record_reconcile(
            &key.namespace,
            &key.name,
            started.elapsed().as_secs_f64(),
        );

        match deferred {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn pick_up_dormant(&mut self, spec: &PostgresClusterSpec) -> Result<()> {
        if self.ledger.status().initialized || self.resume.is_some() {
            return Ok(());
        }
        let Some(record) = self.ctx.dormant.get(&self.key).await? else {
            return Ok(());
        };
        if let Some(reason) = record.incompatibility(spec) {
            return Err(Error::ValidationError(reason));
        }

        info!(
            cluster = %self.key,
            volumes = record.volumes.len(),
            last_primary = ?record.last_primary,
            timeline = %record.timeline,
            "Resuming from dormant record"
        );
        let phase = self
            .fsm
            .transition(
                &ClusterPhase::Paused,
                ClusterEvent::ResumeRequested,
                &TransitionContext::default(),
            )
            .phase_or(ClusterPhase::Paused);
        let s = self.ledger.status_mut();
        s.timeline = s.timeline.max(record.timeline);
        s.phase = phase;
        s.phase_started_at = Some(Utc::now().to_rfc3339());
        self.ledger.commit().await?;
        self.resume = Some(record);
        Ok(())
    }

    /// Recorded primary, unless a promotion is still unconfirmed
    fn confirmed_primary(&self) -> Option<MemberId> {
        let status = self.ledger.status();
        if status.pending_promotion.is_some() {
            None
        } else {
            status.primary
        }
    }

    /// The recorded primary answers as primary on the recorded timeline
    fn primary_ready(&self, snapshot: &TopologySnapshot) -> bool {
        let timeline = self.ledger.status().timeline;
        self.confirmed_primary().is_some_and(|p| {
            snapshot
                .member(p)
                .is_some_and(|m| m.claims_primary() && m.timeline == Some(timeline))
        })
    }

    async fn bootstrap_plan(
        &self,
        spec: &PostgresClusterSpec,
        primary: Option<MemberId>,
    ) -> Result<BootstrapPlan> {
        if let Some(record) = &self.resume {
            return Ok(BootstrapPlan::Resume {
                volumes: record.volumes.clone(),
            });
        }
        if self.ledger.status().initialized {
            // Without a primary, members only come back on the volumes they left behind
            if primary.is_none() {
                let volumes = self.ctx.compute.list_volumes(&self.key).await?;
                return Ok(BootstrapPlan::Resume { volumes });
            }
            return Ok(BootstrapPlan::Fresh);
        }
        Ok(match spec.init_source() {
            InitSource::WalArchive(_) => BootstrapPlan::ArchiveRecovery,
            _ => BootstrapPlan::Fresh,
        })
    }

    /// Run the one-time initialization. `Ok(false)` means not yet possible.
    async fn initialize(
        &mut self,
        spec: &PostgresClusterSpec,
        snapshot: &TopologySnapshot,
        primary_ready: bool,
    ) -> Result<bool> {
        if let Some(record) = self.resume.clone() {
            if !primary_ready {
                return Ok(false);
            }
            self.ctx.dormant.delete(&self.key).await?;
            self.resume = None;
            info!(
                cluster = %self.key,
                primary = ?self.ledger.status().primary,
                "Retained data confirmed; dormant record released"
            );
            if record.initialized {
                return Ok(true);
            }
        }

        match spec.init_source() {
            InitSource::None => Ok(primary_ready),
            InitSource::Script(script) => {
                let Some(primary) = self.confirmed_primary().filter(|_| primary_ready) else {
                    return Ok(false);
                };
                info!(cluster = %self.key, member = %primary, "Running initialization script");
                self.ctx
                    .database
                    .execute_script(&self.key, primary, &script.sql)
                    .await?;
                Ok(true)
            }
            InitSource::Snapshot(source) => {
                let Some(primary) = self.confirmed_primary().filter(|_| primary_ready) else {
                    return Ok(false);
                };
                let namespace = source.namespace.as_deref().unwrap_or(&self.key.namespace);
                let record = self
                    .ctx
                    .snapshots
                    .get(namespace, &source.name)
                    .await?
                    .ok_or_else(|| {
                        Error::IrrecoverableData(format!(
                            "snapshot {}/{} does not exist",
                            namespace, source.name
                        ))
                    })?;
                let dump = load_dump(&self.ctx, &record).await?;
                info!(
                    cluster = %self.key,
                    member = %primary,
                    snapshot = %record.name,
                    bytes = dump.len(),
                    "Restoring snapshot"
                );
                self.ctx
                    .database
                    .restore_dump(&self.key, primary, dump)
                    .await?;
                Ok(true)
            }
            InitSource::WalArchive(source) => {
                if primary_ready {
                    return Ok(true);
                }
                let seed = MemberId(0);
                let in_recovery = snapshot
                    .member(seed)
                    .is_some_and(|m| m.is_ready() && m.role == MemberRole::Standby);
                if !in_recovery || self.ledger.status().pending_promotion.is_some() {
                    return Ok(false);
                }
                self.restore_archive(&source.storage, source.up_to.as_deref(), seed)
                    .await?;
                let snapshot = TopologyObserver::new(
                    self.ctx.compute.as_ref(),
                    self.ctx.database.as_ref(),
                )
                .observe(&self.key)
                .await?;
                self.coordinator
                    .promote(
                        &self.ctx,
                        &mut self.ledger,
                        &snapshot,
                        seed,
                        PromotionReason::ArchiveRecovery,
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    async fn restore_archive(
        &self,
        backend: &StorageBackend,
        up_to: Option<&str>,
        member: MemberId,
    ) -> Result<()> {
        let up_to = up_to
            .map(|raw| {
                raw.parse::<WalPosition>()
                    .map_err(|e| Error::ValidationError(e.to_string()))
            })
            .transpose()?;
        let store = self
            .ctx
            .storage
            .open(&self.key.namespace, backend)
            .await
            .map_err(|e| match e {
                StorageError::Io(_) => Error::StorageError(e),
                other => Error::IrrecoverableData(format!("archive backend unusable: {}", other)),
            })?;
        let report = restore_from(
            &self.ctx,
            &self.key,
            member,
            store.as_ref(),
            &layout::restore_prefix(backend),
            up_to,
        )
        .await?;
        info!(
            cluster = %self.key,
            member = %member,
            replayed = report.replayed,
            last = %report.last_segment,
            "Archive replay complete"
        );
        Ok(())
    }

    /// Point the endpoints at what this pass observed. Returns whether writes are routed.
    async fn route_endpoints(
        &mut self,
        spec: &PostgresClusterSpec,
        snapshot: &TopologySnapshot,
        primary_ready: bool,
    ) -> Result<bool> {
        let status = self.ledger.status();
        let (writes, reads) = match self.confirmed_primary() {
            Some(primary) if primary_ready && status.initialized => (
                Some(primary),
                read_targets(
                    spec.standby_mode,
                    snapshot,
                    primary,
                    status.timeline,
                    self.ctx.config.max_read_lag_bytes,
                ),
            ),
            _ => (None, Vec::new()),
        };

        if status.write_endpoint != writes {
            match writes {
                Some(p) => info!(cluster = %self.key, member = %p, "Routing writes"),
                None => info!(cluster = %self.key, "Write endpoint fenced"),
            }
            self.ctx.compute.route_writes(&self.key, writes).await?;
            self.ledger.status_mut().write_endpoint = writes;
        }
        if self.ledger.status().read_endpoints != reads {
            debug!(cluster = %self.key, readers = ?reads, "Routing reads");
            self.ctx.compute.route_reads(&self.key, &reads).await?;
            self.ledger.status_mut().read_endpoints = reads;
        }
        Ok(writes.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_pass(
        &mut self,
        version: u64,
        spec: &PostgresClusterSpec,
        snapshot: &TopologySnapshot,
        roles: RoleOutcome,
        writes_routed: bool,
        init_error: Option<String>,
        deferred: Option<&Error>,
    ) -> Result<PassReport> {
        let desired = desired_topology(spec).count as i32;
        let ready = snapshot.ready_count() as i32;
        let primary = self.confirmed_primary();

        let mut transition = TransitionContext::new(ready, desired)
            .with_primary(writes_routed)
            .initialized(self.ledger.status().initialized);
        if let Some(msg) = &init_error {
            transition = transition.with_error(msg.clone());
        }
        let current = self.ledger.status().phase;
        let phase = next_phase(&self.fsm, current, &transition, None);

        let last_succeeded = self.snapshot_activity.borrow().last_succeeded.clone();
        let s = self.ledger.status_mut();
        if phase != current {
            info!(cluster = %self.key, from = %current, to = %phase, "Phase transition");
            s.phase = phase;
            s.phase_started_at = Some(Utc::now().to_rfc3339());
        }
        s.members = snapshot.member_statuses(&self.key, primary);
        s.ready_members = ready;
        s.desired_members = desired;
        if last_succeeded.is_some() {
            s.last_snapshot = last_succeeded;
        }
        s.last_error = init_error
            .clone()
            .or_else(|| deferred.map(ToString::to_string));
        if deferred.is_none() && init_error.is_none() {
            s.spec_version = version;
        }
        s.conditions = cluster_conditions(s, &transition);
        self.ledger.commit().await?;

        self.ctx.metrics.set_cluster_replicas(
            &self.key.namespace,
            &self.key.name,
            i64::from(desired),
            i64::from(ready),
        );

        let requeue_after = match &roles {
            RoleOutcome::Waiting(remaining) => Some(*remaining),
            _ if phase != ClusterPhase::Running => Some(self.ctx.config.poll_interval),
            _ => None,
        };
        Ok(PassReport {
            phase,
            roles,
            requeue_after,
        })
    }

    /// Apply the termination policy. DoNotTerminate is refused without touching anything.
    #[instrument(skip(self, spec), fields(cluster = %self.key, %policy))]
    pub async fn terminate(
        &mut self,
        spec: &PostgresClusterSpec,
        policy: TerminationPolicy,
    ) -> Result<ClusterPhase> {
        let event_ctx = TransitionContext::default();
        let current = self.ledger.status().phase;
        match policy {
            TerminationPolicy::DoNotTerminate => {
                return Err(Error::PolicyViolation(format!(
                    "cluster {} has terminationPolicy DoNotTerminate",
                    self.key
                )));
            }
            TerminationPolicy::Pause => self.pause(spec).await?,
            TerminationPolicy::Delete => self.remove(spec, false).await?,
            TerminationPolicy::WipeOut => self.remove(spec, true).await?,
        }

        let phase = next_phase(&self.fsm, current, &event_ctx, Some(policy));
        let s = self.ledger.status_mut();
        s.phase = phase;
        s.phase_started_at = Some(Utc::now().to_rfc3339());
        s.primary = None;
        s.pending_promotion = None;
        s.members.clear();
        s.ready_members = 0;
        s.write_endpoint = None;
        s.read_endpoints.clear();
        self.ledger.commit().await?;
        info!(cluster = %self.key, %phase, "Termination policy applied");
        Ok(phase)
    }

    async fn fence(&self) -> Result<()> {
        self.ctx.compute.route_writes(&self.key, None).await?;
        self.ctx.compute.route_reads(&self.key, &[]).await?;
        Ok(())
    }

    async fn delete_members(&self) -> Result<()> {
        for member in self.ctx.compute.list_members(&self.key).await? {
            self.ctx.compute.delete_member(&self.key, member.id).await?;
        }
        Ok(())
    }

    async fn pause(&mut self, spec: &PostgresClusterSpec) -> Result<()> {
        self.fence().await?;

        if let (Some(archiver), Some(primary)) = (&spec.archiver, self.confirmed_primary()) {
            match archiver_for(&self.ctx, &self.key, &archiver.storage).await {
                Ok(archiver) => {
                    if let Err(e) = archiver.archive_pending(&self.ctx, primary).await {
                        warn!(cluster = %self.key, error = %e, "Final archive pass before pause failed");
                    }
                }
                Err(e) => warn!(cluster = %self.key, error = %e, "Archive backend unavailable at pause"),
            }
        }

        // A resume that never completed keeps the record it started from
        if self.resume.is_none() {
            let status = self.ledger.status();
            // An unconfirmed promotion committed a timeline no member may have reached
            let timeline = match &status.pending_promotion {
                Some(pending) => {
                    warn!(
                        cluster = %self.key,
                        member = %pending.candidate,
                        timeline = %pending.timeline,
                        "Pausing with an unconfirmed promotion; recording the last confirmed timeline"
                    );
                    pending.timeline.prev()
                }
                None => status.timeline,
            };
            let credentials = spec
                .database_secret
                .clone()
                .unwrap_or_else(|| crate::resources::secret::credentials_secret_name(&self.key.name));
            let record = DormantRecord {
                cluster: self.key.clone(),
                spec: spec.clone(),
                volumes: self.ctx.compute.list_volumes(&self.key).await?,
                credentials_secret: Some(credentials),
                last_primary: self.confirmed_primary(),
                timeline,
                initialized: status.initialized,
                wipe_out: false,
                phase: DormantPhase::Paused,
                paused_at: Utc::now(),
            };
            self.ctx.dormant.put(&record).await?;
            info!(
                cluster = %self.key,
                volumes = ?record.volumes,
                last_primary = ?record.last_primary,
                "Dormant record written"
            );
        }

        self.delete_members().await
    }

    async fn remove(&mut self, spec: &PostgresClusterSpec, wipe_out: bool) -> Result<()> {
        self.fence().await?;
        self.delete_members().await?;
        self.ctx.compute.delete_volumes(&self.key).await?;

        if wipe_out {
            let secret = spec
                .database_secret
                .clone()
                .unwrap_or_else(|| crate::resources::secret::credentials_secret_name(&self.key.name));
            wipe_retained(&self.ctx, &self.key, spec, &secret).await?;
            self.ctx.dormant.delete(&self.key).await?;
        }
        Ok(())
    }
}

pub(crate) async fn archiver_for(
    ctx: &EngineContext,
    key: &ClusterKey,
    backend: &StorageBackend,
) -> Result<WalArchiver> {
    let store = ctx.storage.open(&key.namespace, backend).await?;
    Ok(WalArchiver::new(
        key.clone(),
        store,
        layout::archive_prefix(backend, key),
        ctx.config.archive_attempts,
        ctx.config.archive_retry.clone(),
    ))
}

/// Remove credentials, every snapshot record with its data and everything under the
/// cluster's prefix in the archive and schedule backends
async fn wipe_retained(
    ctx: &EngineContext,
    key: &ClusterKey,
    spec: &PostgresClusterSpec,
    credentials_secret: &str,
) -> Result<()> {
    ctx.credentials.delete(key, credentials_secret).await?;

    for record in ctx.snapshots.list(key).await? {
        delete_snapshot(ctx, &record.namespace, &record.name).await?;
    }

    let backends = spec
        .archiver
        .iter()
        .map(|a| &a.storage)
        .chain(spec.backup_schedule.iter().map(|b| &b.storage));
    for backend in backends {
        let store = match ctx.storage.open(&key.namespace, backend).await {
            Ok(store) => store,
            Err(StorageError::ContainerNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let prefix = layout::cluster_prefix(backend, key);
        let removed = store.delete_prefix(&prefix).await?;
        info!(cluster = %key, %prefix, removed, "Backend prefix wiped");
    }
    Ok(())
}

/// Wipe what a dormant record retains and mark it `WipedOut`. Returns false when there
/// is no record.
pub async fn wipe_dormant(ctx: &EngineContext, key: &ClusterKey) -> Result<bool> {
    let Some(mut record) = ctx.dormant.get(key).await? else {
        return Ok(false);
    };
    if record.phase == DormantPhase::WipedOut {
        return Ok(true);
    }
    info!(cluster = %key, "Wiping dormant database");
    ctx.compute.delete_volumes(key).await?;
    let secret = record
        .credentials_secret
        .clone()
        .unwrap_or_else(|| crate::resources::secret::credentials_secret_name(&key.name));
    wipe_retained(ctx, key, &record.spec, &secret).await?;

    record.wipe_out = true;
    record.phase = DormantPhase::WipedOut;
    record.volumes.clear();
    ctx.dormant.put(&record).await?;
    Ok(true)
}

/// Drop a dormant record. With `wipe_out` its retained data goes first; without it
/// only the record is removed.
pub async fn delete_dormant(ctx: &EngineContext, key: &ClusterKey, wipe_out: bool) -> Result<()> {
    if wipe_out {
        wipe_dormant(ctx, key).await?;
    }
    ctx.dormant.delete(key).await?;
    info!(cluster = %key, wipe_out, "Dormant record deleted");
    Ok(())
}
