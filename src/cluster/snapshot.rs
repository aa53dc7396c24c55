//! Snapshot Engine
//!
//! Full logical backups of a cluster's primary into a [`BlobStore`], one directory per
//! record. Records are persisted through the [`SnapshotCatalog`] port so the on-demand
//! path (the `Snapshot` resource) and the scheduler share one history.
//!
//! [`SnapshotCatalog`]: crate::cluster::ports::SnapshotCatalog

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cluster::EngineContext;
use crate::cluster::model::{ClusterKey, MemberId, Timeline};
use crate::cluster::ports::CollaboratorError;
use crate::controller::error::{Error, Result};
use crate::crd::{BackupScheduleSpec, PostgresClusterStatus, RetentionTag, SnapshotPhase, StorageBackend};
use crate::storage::{BlobStore, StorageError, layout};

/// One backup artifact
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRecord {
    pub namespace: String,
    pub name: String,
    /// Source cluster, in the same namespace
    pub cluster: String,
    pub storage: StorageBackend,
    pub phase: SnapshotPhase,
    pub retention: RetentionTag,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub size_bytes: Option<u64>,
    pub reason: Option<String>,
}

impl SnapshotRecord {
    pub fn new(
        cluster: &ClusterKey,
        name: impl Into<String>,
        storage: StorageBackend,
        retention: RetentionTag,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: cluster.namespace.clone(),
            name: name.into(),
            cluster: cluster.name.clone(),
            storage,
            phase: SnapshotPhase::Running,
            retention,
            created_at,
            started_at: None,
            completed_at: None,
            location: None,
            size_bytes: None,
            reason: None,
        }
    }

    pub fn cluster_key(&self) -> ClusterKey {
        ClusterKey::new(&self.namespace, &self.cluster)
    }

    /// Directory that holds this record's objects and nothing else
    pub fn prefix(&self) -> String {
        layout::snapshot_prefix(&self.storage, &self.cluster_key(), &self.name)
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.phase = SnapshotPhase::Failed;
        self.reason = Some(reason.into());
        self.completed_at = Some(now);
    }
}

/// Descriptor written beside every dump
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotManifest {
    pub snapshot: String,
    pub namespace: String,
    pub cluster: String,
    /// RFC 3339
    pub created_at: String,
    pub primary: MemberId,
    pub timeline: Timeline,
    pub size_bytes: u64,
    /// `crc32:XXXXXXXX` over the dump
    pub checksum: String,
    pub format_version: u8,
}

impl SnapshotManifest {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &[u8]) -> Result<Self> {
        serde_json::from_slice(json)
            .map_err(|e| Error::IrrecoverableData(format!("unreadable snapshot manifest: {}", e)))
    }
}

pub fn format_checksum(data: &[u8]) -> String {
    format!("crc32:{:08x}", crc32fast::hash(data))
}

/// Whether a storage failure ends a snapshot for good
fn is_fatal(e: &StorageError) -> bool {
    matches!(
        e,
        StorageError::ContainerNotFound(_)
            | StorageError::Unauthorized(_)
            | StorageError::Config(_)
            | StorageError::InvalidKey(_)
    )
}

/// Take a snapshot of the cluster's primary into `record`'s directory.
///
/// Terminal records are returned unchanged. Unrecoverable storage failures and corrupt
/// dumps end the record as `Failed`; a missing primary or an I/O timeout returns an
/// error and leaves it `Running` so the caller can retry.
pub async fn take_snapshot(
    ctx: &EngineContext,
    mut record: SnapshotRecord,
    primary: Option<MemberId>,
    timeline: Timeline,
) -> Result<SnapshotRecord> {
    if record.is_terminal() {
        return Ok(record);
    }
    let cluster = record.cluster_key();
    if record.started_at.is_none() {
        record.started_at = Some(Utc::now());
        ctx.snapshots.upsert(&record).await?;
    }

    let store = match ctx.storage.open(&record.namespace, &record.storage).await {
        Ok(store) => store,
        Err(e) if is_fatal(&e) => return finish_failed(ctx, record, e.to_string()).await,
        Err(e) => return Err(e.into()),
    };

    let primary = primary.ok_or_else(|| {
        Error::TransientInfra(format!("cluster {} has no primary to snapshot", cluster))
    })?;

    let dump = match ctx.database.dump(&cluster, primary).await {
        Ok(dump) => dump,
        Err(CollaboratorError::Corrupt(reason)) => {
            return finish_failed(ctx, record, reason).await;
        }
        Err(e) => return Err(e.into()),
    };

    let manifest = SnapshotManifest {
        snapshot: record.name.clone(),
        namespace: record.namespace.clone(),
        cluster: record.cluster.clone(),
        created_at: record.created_at.to_rfc3339(),
        primary,
        timeline,
        size_bytes: dump.len() as u64,
        checksum: format_checksum(&dump),
        format_version: 1,
    };

    let prefix = record.prefix();
    let size = dump.len() as u64;
    if let Err(e) = write_snapshot(store.as_ref(), &prefix, dump, &manifest).await {
        return match e {
            Error::StorageError(se) if is_fatal(&se) => {
                finish_failed(ctx, record, se.to_string()).await
            }
            other => Err(other),
        };
    }

    record.phase = SnapshotPhase::Succeeded;
    record.completed_at = Some(Utc::now());
    record.location = Some(record.storage.location(&prefix));
    record.size_bytes = Some(size);
    record.reason = None;
    ctx.snapshots.upsert(&record).await?;
    ctx.metrics
        .record_snapshot(&record.namespace, &record.cluster, "succeeded");
    info!(
        cluster = %cluster,
        snapshot = %record.name,
        size_bytes = size,
        location = ?record.location,
        "Snapshot succeeded"
    );
    Ok(record)
}

async fn write_snapshot(
    store: &dyn BlobStore,
    prefix: &str,
    dump: Bytes,
    manifest: &SnapshotManifest,
) -> Result<()> {
    store.put(prefix, layout::SNAPSHOT_DUMP_KEY, dump).await?;
    // The manifest goes last: a directory without one is an incomplete snapshot
    store
        .put(
            prefix,
            layout::SNAPSHOT_MANIFEST_KEY,
            Bytes::from(manifest.to_json()?),
        )
        .await?;
    Ok(())
}

async fn finish_failed(
    ctx: &EngineContext,
    mut record: SnapshotRecord,
    reason: String,
) -> Result<SnapshotRecord> {
    error!(
        namespace = %record.namespace,
        cluster = %record.cluster,
        snapshot = %record.name,
        %reason,
        "Snapshot failed"
    );
    record.fail(reason, Utc::now());
    ctx.snapshots.upsert(&record).await?;
    ctx.metrics
        .record_snapshot(&record.namespace, &record.cluster, "failed");
    Ok(record)
}

/// Read back and verify a Succeeded snapshot's dump
pub async fn load_dump(ctx: &EngineContext, record: &SnapshotRecord) -> Result<Bytes> {
    if record.phase != SnapshotPhase::Succeeded {
        return Err(Error::IrrecoverableData(format!(
            "snapshot {}/{} is {}, not Succeeded",
            record.namespace, record.name, record.phase
        )));
    }
    let store = ctx.storage.open(&record.namespace, &record.storage).await?;
    let prefix = record.prefix();
    let missing = |e: StorageError| match e {
        StorageError::Io(_) => Error::StorageError(e),
        other => Error::IrrecoverableData(format!(
            "snapshot {}/{} data unavailable: {}",
            record.namespace, record.name, other
        )),
    };

    let manifest = store
        .get(&prefix, layout::SNAPSHOT_MANIFEST_KEY)
        .await
        .map_err(missing)?;
    let manifest = SnapshotManifest::from_json(&manifest)?;
    let dump = store
        .get(&prefix, layout::SNAPSHOT_DUMP_KEY)
        .await
        .map_err(missing)?;
    if format_checksum(&dump) != manifest.checksum {
        return Err(Error::IrrecoverableData(format!(
            "snapshot {}/{} dump does not match its manifest checksum",
            record.namespace, record.name
        )));
    }
    Ok(dump)
}

/// Remove a record and its backend data. Sibling records are untouched because each
/// owns exactly its own directory.
pub async fn delete_snapshot(ctx: &EngineContext, namespace: &str, name: &str) -> Result<bool> {
    let Some(record) = ctx.snapshots.get(namespace, name).await? else {
        return Ok(false);
    };
    match ctx.storage.open(namespace, &record.storage).await {
        Ok(store) => {
            let removed = store.delete_prefix(&record.prefix()).await?;
            debug!(namespace, snapshot = name, removed, "Snapshot data removed");
        }
        // A container that never existed holds no data for this record
        Err(StorageError::ContainerNotFound(container)) => {
            debug!(namespace, snapshot = name, %container, "Snapshot container absent");
        }
        Err(e) => return Err(e.into()),
    }
    ctx.snapshots.remove(namespace, name).await?;
    info!(namespace, snapshot = name, "Snapshot deleted");
    Ok(true)
}

/// Delete the oldest terminal scheduled records beyond `keep_last`
pub async fn apply_retention(
    ctx: &EngineContext,
    cluster: &ClusterKey,
    keep_last: u32,
) -> Result<Vec<String>> {
    let mut scheduled: Vec<_> = ctx
        .snapshots
        .list(cluster)
        .await?
        .into_iter()
        .filter(|r| r.retention == RetentionTag::Scheduled && r.is_terminal())
        .collect();
    scheduled.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));

    let mut removed = Vec::new();
    for record in scheduled.into_iter().skip(keep_last as usize) {
        delete_snapshot(ctx, &record.namespace, &record.name).await?;
        removed.push(record.name);
    }
    if !removed.is_empty() {
        info!(cluster = %cluster, keep_last, removed = ?removed, "Retention removed snapshots");
    }
    Ok(removed)
}

/// When scheduled snapshots fire
#[derive(Clone, Debug)]
pub enum Schedule {
    /// `@every <n><s|m|h>`
    Every(Duration),
    Cron(Box<Cron>),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if let Some(interval) = expr.strip_prefix("@every") {
            return parse_interval(interval.trim()).map(Schedule::Every).ok_or_else(|| {
                Error::ValidationError(format!("invalid @every interval: {}", expr))
            });
        }
        Cron::new(expr)
            .with_seconds_optional()
            .parse()
            .map(|cron| Schedule::Cron(Box::new(cron)))
            .map_err(|e| Error::ValidationError(format!("invalid cron expression {}: {}", expr, e)))
    }

    /// Time until the first firing strictly after `now`
    pub fn until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Schedule::Every(interval) => Some(*interval),
            Schedule::Cron(cron) => cron
                .find_next_occurrence(&now, false)
                .ok()
                .and_then(|next| (next - now).to_std().ok()),
        }
    }
}

fn parse_interval(s: &str) -> Option<Duration> {
    let unit = s.chars().last()?;
    let value: u64 = s.get(..s.len() - unit.len_utf8())?.parse().ok()?;
    let secs = match unit {
        's' => value,
        'm' => value.checked_mul(60)?,
        'h' => value.checked_mul(3600)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Name of a scheduled snapshot fired at `at`
pub fn scheduled_name(cluster: &ClusterKey, at: DateTime<Utc>) -> String {
    format!("{}-{}", cluster.name, at.format("%Y%m%d-%H%M%S"))
}

/// Published by the snapshot side loop and by on-demand snapshots
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotActivity {
    pub last_succeeded: Option<String>,
    pub last_failed: Option<String>,
    pub scheduled_taken: u64,
}

impl SnapshotActivity {
    pub fn record(&mut self, record: &SnapshotRecord) {
        match record.phase {
            SnapshotPhase::Succeeded => self.last_succeeded = Some(record.name.clone()),
            SnapshotPhase::Failed => self.last_failed = Some(record.name.clone()),
            SnapshotPhase::Running => {}
        }
    }
}

/// Maps the tokio clock onto wall time so names stay unique when time is driven by tokio
#[derive(Clone, Copy, Debug)]
struct WallAnchor {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl WallAnchor {
    fn now() -> Self {
        Self {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn wall_at(&self, instant: Instant) -> DateTime<Utc> {
        let elapsed = instant.saturating_duration_since(self.instant);
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| self.wall.checked_add_signed(d))
            .unwrap_or(self.wall)
    }
}

/// Side loop firing scheduled snapshots. Schedule changes arrive through `schedule` and
/// apply from the next firing on.
pub async fn run_snapshot_loop(
    ctx: EngineContext,
    cluster: ClusterKey,
    mut schedule: watch::Receiver<Option<BackupScheduleSpec>>,
    status: watch::Receiver<PostgresClusterStatus>,
    mut shutdown: watch::Receiver<bool>,
    activity: Arc<watch::Sender<SnapshotActivity>>,
) {
    let anchor = WallAnchor::now();
    info!(cluster = %cluster, "Snapshot scheduler started");

    loop {
        let spec = schedule.borrow_and_update().clone();
        let next = spec.as_ref().and_then(|spec| match Schedule::parse(&spec.cron_expression) {
            Ok(parsed) => parsed
                .until_next(anchor.wall_at(Instant::now()))
                .map(|wait| Instant::now() + wait),
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Ignoring unparsable backup schedule");
                None
            }
        });

        let fire = async {
            match next {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = fire => {
                if let (Some(spec), Some(at)) = (spec, next) {
                    fire_scheduled(&ctx, &cluster, &spec, anchor.wall_at(at), &status, &activity).await;
                }
            }
            changed = schedule.changed() => {
                if changed.is_err() {
                    break;
                }
                debug!(cluster = %cluster, "Backup schedule updated");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(cluster = %cluster, "Snapshot scheduler stopped");
}

async fn fire_scheduled(
    ctx: &EngineContext,
    cluster: &ClusterKey,
    spec: &BackupScheduleSpec,
    at: DateTime<Utc>,
    status: &watch::Receiver<PostgresClusterStatus>,
    activity: &watch::Sender<SnapshotActivity>,
) {
    let name = scheduled_name(cluster, at);
    match ctx.snapshots.get(&cluster.namespace, &name).await {
        Ok(Some(_)) => {
            debug!(cluster = %cluster, snapshot = %name, "Scheduled snapshot already exists");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(cluster = %cluster, error = %e, "Snapshot catalog unavailable, skipping firing");
            return;
        }
    }

    let mut record = SnapshotRecord::new(
        cluster,
        name,
        spec.storage.clone(),
        RetentionTag::Scheduled,
        at,
    );
    let retry = ctx.config.archive_retry.clone();
    let attempts = ctx.config.archive_attempts.max(1);
    let mut attempt = 0;

    loop {
        let (primary, timeline) = {
            let s = status.borrow();
            let primary = if s.pending_promotion.is_none() { s.primary } else { None };
            (primary, s.timeline)
        };
        match take_snapshot(ctx, record.clone(), primary, timeline).await {
            Ok(done) => {
                record = done;
                break;
            }
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = retry.delay_for_attempt(attempt);
                debug!(cluster = %cluster, snapshot = %record.name, attempt, ?delay, error = %e, "Retrying scheduled snapshot");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                // A scheduled record must not stay Running with nobody left to retry it
                let reason = format!("gave up after {} attempts: {}", attempt + 1, e);
                match finish_failed(ctx, record.clone(), reason).await {
                    Ok(failed) => record = failed,
                    Err(e) => warn!(cluster = %cluster, error = %e, "Could not record failed snapshot"),
                }
                break;
            }
        }
    }

    activity.send_modify(|a| {
        a.scheduled_taken += 1;
        a.record(&record);
    });

    if let Some(keep_last) = spec.keep_last
        && let Err(e) = apply_retention(ctx, cluster, keep_last).await
    {
        warn!(cluster = %cluster, error = %e, "Snapshot retention failed");
    }
}
