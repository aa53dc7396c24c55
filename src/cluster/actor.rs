//! Per-cluster control loops
//!
//! [`ClusterRegistry`] owns one actor task per cluster identity. An actor runs its
//! [`ClusterLifecycle`] passes strictly one at a time; spec updates arrive as whole
//! documents with a monotonic version through a watch channel, so a newer version
//! always replaces an older one that was not picked up yet. Commands (deletion,
//! switchover) are queued and handled between passes, and deletion is handled before
//! the next pass so a cluster deleted right after creation is not provisioned first.
//!
//! The WAL archiver and snapshot scheduler are side loops owned by the actor. They
//! only read the published status and never call into the lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::EngineContext;
use crate::cluster::archiver::{ArchiverStatus, run_archiver_loop};
use crate::cluster::dormant::DormantRecord;
use crate::cluster::ledger::StatusLedger;
use crate::cluster::lifecycle::{
    ClusterLifecycle, VersionedSpec, archiver_for, delete_dormant, wipe_dormant,
};
use crate::cluster::model::{ClusterKey, MemberId};
use crate::cluster::snapshot::{
    self, SnapshotActivity, SnapshotRecord, run_snapshot_loop,
};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::validation::{validate_deletion, validate_spec, validate_spec_change};
use crate::crd::{
    BackupScheduleSpec, ClusterPhase, PostgresClusterSpec, PostgresClusterStatus, RetentionTag,
    StorageBackend,
};

enum Command {
    Delete {
        reply: oneshot::Sender<Result<ClusterPhase>>,
    },
    Switchover {
        target: MemberId,
    },
}

struct HandleInner {
    key: ClusterKey,
    spec_tx: watch::Sender<VersionedSpec>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PostgresClusterStatus>,
    activity: Arc<watch::Sender<SnapshotActivity>>,
    archiver: watch::Receiver<ArchiverStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of one cluster's actor
#[derive(Clone)]
pub struct ClusterHandle {
    inner: Arc<HandleInner>,
}

impl ClusterHandle {
    pub fn key(&self) -> &ClusterKey {
        &self.inner.key
    }

    /// Current spec and its version
    pub fn spec(&self) -> VersionedSpec {
        self.inner.spec_tx.borrow().clone()
    }

    pub fn status(&self) -> watch::Receiver<PostgresClusterStatus> {
        self.inner.status.clone()
    }

    pub fn archiver_status(&self) -> ArchiverStatus {
        self.inner.archiver.borrow().clone()
    }

    pub fn snapshot_activity(&self) -> SnapshotActivity {
        self.inner.activity.borrow().clone()
    }

    /// Replace the spec; returns the version now current. An identical document does
    /// not bump the version.
    fn replace_spec(&self, spec: PostgresClusterSpec) -> u64 {
        let mut version = 0;
        self.inner.spec_tx.send_if_modified(|current| {
            if current.spec == spec {
                version = current.version;
                false
            } else {
                current.version += 1;
                current.spec = spec;
                version = current.version;
                true
            }
        });
        version
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner.commands.send(command).map_err(|_| {
            Error::TransientInfra(format!("control loop of {} has stopped", self.inner.key))
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.task)
            .ok()
            .and_then(|t| t.as_ref().map(|t| !t.is_finished()))
            .unwrap_or(false)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::TransientInfra("cluster registry lock poisoned".to_string()))
}

/// Front door of the engine: one actor per cluster identity
#[derive(Clone)]
pub struct ClusterRegistry {
    ctx: EngineContext,
    clusters: Arc<Mutex<HashMap<ClusterKey, ClusterHandle>>>,
}

impl ClusterRegistry {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            clusters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn handle(&self, key: &ClusterKey) -> Option<ClusterHandle> {
        lock(&self.clusters).ok().and_then(|c| c.get(key).cloned())
    }

    pub fn keys(&self) -> Vec<ClusterKey> {
        lock(&self.clusters)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Create or update a cluster. Invalid specs are rejected before anything changes.
    /// `observed` seeds the status of a newly started actor, e.g. after an operator
    /// restart; it is ignored for running clusters.
    pub async fn apply(
        &self,
        key: ClusterKey,
        spec: PostgresClusterSpec,
        observed: Option<PostgresClusterStatus>,
    ) -> Result<u64> {
        if let Some(handle) = self.handle(&key).filter(ClusterHandle::is_running) {
            validate_spec_change(&handle.spec().spec, &spec)?;
            let version = handle.replace_spec(spec);
            debug!(cluster = %key, version, "Spec applied");
            return Ok(version);
        }

        validate_spec(&spec)?;
        let resuming = observed.as_ref().is_some_and(|s| s.initialized);
        if !resuming
            && let Some(record) = self.ctx.dormant.get(&key).await?
            && let Some(reason) = record.incompatibility(&spec)
        {
            return Err(Error::ValidationError(reason));
        }

        let handle = spawn_actor(self.ctx.clone(), key.clone(), spec, observed.unwrap_or_default());
        info!(cluster = %key, "Control loop started");
        lock(&self.clusters)?.insert(key, handle);
        Ok(1)
    }

    /// Delete a cluster under its current termination policy. DoNotTerminate is refused
    /// here, synchronously, without involving the control loop.
    pub async fn delete(&self, key: &ClusterKey) -> Result<ClusterPhase> {
        let Some(handle) = self.handle(key) else {
            return Err(Error::ValidationError(format!("cluster {} does not exist", key)));
        };
        validate_deletion(&key.to_string(), &handle.spec().spec)?;

        let (reply, rx) = oneshot::channel();
        handle.send(Command::Delete { reply })?;
        let phase = rx.await.map_err(|_| {
            Error::TransientInfra(format!("control loop of {} stopped before deleting", key))
        })??;

        let removed = lock(&self.clusters)?.remove(key);
        if let Some(handle) = removed {
            let task = lock(&handle.inner.task)?.take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        info!(cluster = %key, %phase, "Cluster deleted");
        Ok(phase)
    }

    /// Forget a cluster without applying any termination policy (operator shutdown)
    pub fn detach(&self, key: &ClusterKey) {
        if let Ok(mut clusters) = lock(&self.clusters)
            && let Some(handle) = clusters.remove(key)
            && let Ok(mut task) = lock(&handle.inner.task)
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }

    pub fn shutdown(&self) {
        for key in self.keys() {
            self.detach(&key);
        }
    }

    /// Operator-requested promotion of a ready standby
    pub fn switchover(&self, key: &ClusterKey, target: MemberId) -> Result<()> {
        let handle = self
            .handle(key)
            .ok_or_else(|| Error::ValidationError(format!("cluster {} does not exist", key)))?;
        handle.send(Command::Switchover { target })
    }

    pub fn status(&self, key: &ClusterKey) -> Option<watch::Receiver<PostgresClusterStatus>> {
        self.handle(key).map(|h| h.status())
    }

    /// Take (or finish) an on-demand snapshot of a running cluster. The primary is read
    /// from the published status; the control loop is not involved.
    pub async fn take_snapshot(
        &self,
        key: &ClusterKey,
        name: &str,
        storage: StorageBackend,
    ) -> Result<SnapshotRecord> {
        let handle = self.handle(key).ok_or_else(|| {
            Error::TransientInfra(format!("cluster {} is not running", key))
        })?;
        let record = match self.ctx.snapshots.get(&key.namespace, name).await? {
            Some(existing) => existing,
            None => {
                let record =
                    SnapshotRecord::new(key, name, storage, RetentionTag::Manual, Utc::now());
                self.ctx.snapshots.upsert(&record).await?;
                record
            }
        };
        let (primary, timeline) = {
            let status = handle.inner.status.borrow();
            let primary = if status.pending_promotion.is_none() {
                status.primary
            } else {
                None
            };
            (primary, status.timeline)
        };
        let record = snapshot::take_snapshot(&self.ctx, record, primary, timeline).await?;
        handle.inner.activity.send_modify(|a| a.record(&record));
        Ok(record)
    }

    pub async fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<bool> {
        snapshot::delete_snapshot(&self.ctx, namespace, name).await
    }

    pub async fn list_snapshots(&self, key: &ClusterKey) -> Result<Vec<SnapshotRecord>> {
        let mut records = self.ctx.snapshots.list(key).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(records)
    }

    pub async fn dormant(&self, key: &ClusterKey) -> Result<Option<DormantRecord>> {
        Ok(self.ctx.dormant.get(key).await?)
    }

    pub async fn wipe_dormant(&self, key: &ClusterKey) -> Result<bool> {
        self.ensure_not_running(key)?;
        wipe_dormant(&self.ctx, key).await
    }

    pub async fn delete_dormant(&self, key: &ClusterKey, wipe_out: bool) -> Result<()> {
        self.ensure_not_running(key)?;
        delete_dormant(&self.ctx, key, wipe_out).await
    }

    fn ensure_not_running(&self, key: &ClusterKey) -> Result<()> {
        if self.handle(key).is_some_and(|h| h.is_running()) {
            return Err(Error::ValidationError(format!(
                "cluster {} is running; its dormant record is in use",
                key
            )));
        }
        Ok(())
    }
}

fn spawn_actor(
    ctx: EngineContext,
    key: ClusterKey,
    spec: PostgresClusterSpec,
    status: PostgresClusterStatus,
) -> ClusterHandle {
    let (spec_tx, spec_rx) = watch::channel(VersionedSpec { version: 1, spec });
    let (status_tx, status_rx) = watch::channel(status);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (activity_tx, activity_rx) = watch::channel(SnapshotActivity::default());
    let activity = Arc::new(activity_tx);
    let (archiver_tx, archiver_rx) = watch::channel(ArchiverStatus::default());

    let ledger = StatusLedger::new(key.clone(), status_tx, ctx.status_sink.clone());
    let side = SideLoops::new(
        ctx.clone(),
        key.clone(),
        ledger.subscribe(),
        activity.clone(),
        Arc::new(archiver_tx),
    );
    let lifecycle = ClusterLifecycle::new(key.clone(), ctx.clone(), ledger, spec_rx.clone(), activity_rx);
    let task = tokio::spawn(run_actor(ctx, lifecycle, spec_rx, commands_rx, side));

    ClusterHandle {
        inner: Arc::new(HandleInner {
            key,
            spec_tx,
            commands: commands_tx,
            status: status_rx,
            activity,
            archiver: archiver_rx,
            task: Mutex::new(Some(task)),
        }),
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn run_actor(
    ctx: EngineContext,
    mut lifecycle: ClusterLifecycle,
    mut spec_rx: watch::Receiver<VersionedSpec>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut side: SideLoops,
) {
    let interval = ctx.config.reconcile_interval;
    let backoff = BackoffConfig::default();

    loop {
        while let Ok(command) = commands.try_recv() {
            if let Flow::Stop = handle_command(&mut lifecycle, &spec_rx, &mut side, command).await {
                return;
            }
        }

        let desired = spec_rx.borrow_and_update().clone();
        side.sync(&desired.spec).await;

        let delay = match lifecycle.reconcile(&desired).await {
            Ok(report) => report.requeue_after.unwrap_or(interval).min(interval),
            Err(Error::Superseded(_)) => continue,
            Err(e) => {
                let attempt = lifecycle.errors().consecutive_errors.saturating_sub(1);
                let delay = backoff.delay_for_error(&e, attempt).min(interval);
                warn!(
                    cluster = %lifecycle.key(),
                    error = %e,
                    reason = e.reason(),
                    retry_in = ?delay,
                    "Reconciliation pass failed"
                );
                delay
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Flow::Stop = handle_command(&mut lifecycle, &spec_rx, &mut side, command).await {
                        return;
                    }
                }
                None => break,
            },
            changed = spec_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    side.stop().await;
}

async fn handle_command(
    lifecycle: &mut ClusterLifecycle,
    spec_rx: &watch::Receiver<VersionedSpec>,
    side: &mut SideLoops,
    command: Command,
) -> Flow {
    match command {
        Command::Switchover { target } => {
            info!(cluster = %lifecycle.key(), member = %target, "Switchover requested");
            lifecycle.request_switchover(target);
            Flow::Continue
        }
        Command::Delete { reply } => {
            let spec = spec_rx.borrow().spec.clone();
            // Side loops must not write to a backend that is about to be wiped
            side.stop().await;
            let result = lifecycle.terminate(&spec, spec.termination_policy).await;
            let flow = if result.is_ok() {
                Flow::Stop
            } else {
                Flow::Continue
            };
            let _ = reply.send(result);
            flow
        }
    }
}

struct RunningArchiver {
    backend: StorageBackend,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct SideLoops {
    ctx: EngineContext,
    key: ClusterKey,
    status: watch::Receiver<PostgresClusterStatus>,
    activity: Arc<watch::Sender<SnapshotActivity>>,
    archiver_status: Arc<watch::Sender<ArchiverStatus>>,
    schedule: watch::Sender<Option<BackupScheduleSpec>>,
    archiver: Option<RunningArchiver>,
    scheduler: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl SideLoops {
    fn new(
        ctx: EngineContext,
        key: ClusterKey,
        status: watch::Receiver<PostgresClusterStatus>,
        activity: Arc<watch::Sender<SnapshotActivity>>,
        archiver_status: Arc<watch::Sender<ArchiverStatus>>,
    ) -> Self {
        let (schedule, _) = watch::channel(None);
        Self {
            ctx,
            key,
            status,
            activity,
            archiver_status,
            schedule,
            archiver: None,
            scheduler: None,
        }
    }

    /// Start, restart or stop side loops to match `spec`
    async fn sync(&mut self, spec: &PostgresClusterSpec) {
        self.schedule.send_if_modified(|current| {
            if *current == spec.backup_schedule {
                false
            } else {
                *current = spec.backup_schedule.clone();
                true
            }
        });
        if self.scheduler.is_none() {
            let (stop_tx, stop_rx) = watch::channel(false);
            let task = tokio::spawn(run_snapshot_loop(
                self.ctx.clone(),
                self.key.clone(),
                self.schedule.subscribe(),
                self.status.clone(),
                stop_rx,
                self.activity.clone(),
            ));
            self.scheduler = Some((stop_tx, task));
        }

        let wanted = spec.archiver.as_ref().map(|a| &a.storage);
        let current = self.archiver.as_ref().map(|a| &a.backend);
        if wanted == current {
            return;
        }
        self.stop_archiver().await;
        let Some(backend) = wanted else {
            return;
        };
        match archiver_for(&self.ctx, &self.key, backend).await {
            Ok(archiver) => {
                let (stop_tx, stop_rx) = watch::channel(false);
                let task = tokio::spawn(run_archiver_loop(
                    self.ctx.clone(),
                    archiver,
                    self.status.clone(),
                    stop_rx,
                    self.archiver_status.clone(),
                ));
                self.archiver = Some(RunningArchiver {
                    backend: backend.clone(),
                    stop: stop_tx,
                    task,
                });
            }
            Err(e) => {
                // Retried on the next pass
                warn!(cluster = %self.key, error = %e, "Cannot start WAL archiver");
                self.archiver_status
                    .send_modify(|s| s.last_error = Some(e.to_string()));
            }
        }
    }

    async fn stop_archiver(&mut self) {
        if let Some(running) = self.archiver.take() {
            let _ = running.stop.send(true);
            join_quietly(running.task).await;
        }
    }

    async fn stop(&mut self) {
        self.stop_archiver().await;
        if let Some((stop, task)) = self.scheduler.take() {
            let _ = stop.send(true);
            join_quietly(task).await;
        }
    }
}

async fn join_quietly(task: JoinHandle<()>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(Duration::from_secs(30), task).await.is_err() {
        abort.abort();
    }
}
