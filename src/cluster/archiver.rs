//! WAL Archiver/Restorer
//!
//! Segments are stored under the cluster's archive prefix with their
//! timeline-qualified file name as key, so every incarnation keeps its own history.
//! Each object is framed with a CRC32 so a corrupt object is detected on restore
//! rather than replayed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::EngineContext;
use crate::cluster::model::{ClusterKey, MemberId, Timeline, WalPosition};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::PostgresClusterStatus;
use crate::storage::{BlobStore, StorageError};

/// Bytes per WAL segment (PostgreSQL default)
pub const SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Segments per 4 GiB log file number at the default segment size
const SEGMENTS_PER_LOG: u32 = 0x100;

const FRAME_MAGIC: [u8; 4] = *b"PGWA";
/// magic(4) + crc32(4) + length(8)
const FRAME_HEADER: usize = 16;

/// Timeline-qualified WAL segment name (`TTTTTTTTXXXXXXXXYYYYYYYY`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalSegmentName {
    pub timeline: Timeline,
    pub log: u32,
    pub seg: u32,
}

impl WalSegmentName {
    pub fn new(timeline: Timeline, log: u32, seg: u32) -> Self {
        Self { timeline, log, seg }
    }

    /// Position within the stream, independent of timeline
    pub fn sequence(&self) -> u64 {
        u64::from(self.log) * u64::from(SEGMENTS_PER_LOG) + u64::from(self.seg)
    }

    /// First WAL position contained in the segment
    pub fn start_position(&self) -> WalPosition {
        WalPosition((u64::from(self.log) << 32) | (u64::from(self.seg) * SEGMENT_SIZE))
    }

    /// Last WAL position contained in the segment
    pub fn end_position(&self) -> WalPosition {
        WalPosition(self.start_position().0 + SEGMENT_SIZE - 1)
    }

    /// Segment containing `position` on `timeline`
    pub fn containing(timeline: Timeline, position: WalPosition) -> Self {
        let log = (position.0 >> 32) as u32;
        let seg = ((position.0 & 0xFFFF_FFFF) / SEGMENT_SIZE) as u32;
        Self { timeline, log, seg }
    }
}

impl fmt::Display for WalSegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}", self.timeline.0, self.log, self.seg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a WAL segment name: {0}")]
pub struct ParseSegmentError(String);

impl FromStr for WalSegmentName {
    type Err = ParseSegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSegmentError(s.to_string());
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(err());
        }
        let field = |range: std::ops::Range<usize>| {
            s.get(range)
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .ok_or_else(err)
        };
        let timeline = field(0..8)?;
        let log = field(8..16)?;
        let seg = field(16..24)?;
        if timeline == 0 || seg >= SEGMENTS_PER_LOG {
            return Err(err());
        }
        Ok(Self {
            timeline: Timeline(timeline),
            log,
            seg,
        })
    }
}

/// Wrap a segment with magic, checksum and length
pub fn frame(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER + data.len());
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u32(crc32fast::hash(data));
    buf.put_u64(data.len() as u64);
    buf.put_slice(data);
    buf.freeze()
}

/// Check and strip the frame written by [`frame`]
pub fn unframe(name: &str, framed: &Bytes) -> Result<Bytes> {
    let corrupt = |what: &str| Error::IrrecoverableData(format!("segment {}: {}", name, what));
    if framed.len() < FRAME_HEADER || framed.get(..4) != Some(&FRAME_MAGIC[..]) {
        return Err(corrupt("missing frame header"));
    }
    let mut header = framed.slice(4..FRAME_HEADER);
    let crc = header.get_u32();
    let len = header.get_u64();
    let payload = framed.slice(FRAME_HEADER..);
    if payload.len() as u64 != len {
        return Err(corrupt("truncated"));
    }
    if crc32fast::hash(&payload) != crc {
        return Err(corrupt("checksum mismatch"));
    }
    Ok(payload)
}

/// What one archiver pass shipped
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArchiveReport {
    pub archived: usize,
    pub last_segment: Option<String>,
}

/// Published by the archiver side loop
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArchiverStatus {
    pub last_segment: Option<String>,
    pub archived_total: u64,
    pub last_error: Option<String>,
}

/// Ships completed segments of one cluster's primary
pub struct WalArchiver {
    cluster: ClusterKey,
    store: Arc<dyn BlobStore>,
    prefix: String,
    attempts: u32,
    retry: BackoffConfig,
}

impl WalArchiver {
    pub fn new(
        cluster: ClusterKey,
        store: Arc<dyn BlobStore>,
        prefix: String,
        attempts: u32,
        retry: BackoffConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            prefix,
            attempts: attempts.max(1),
            retry,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Ship every ready segment, oldest first. A segment is acknowledged to the
    /// database only after the store accepted it; the pass stops at the first segment
    /// that cannot be shipped so nothing is skipped.
    pub async fn archive_pending(
        &self,
        ctx: &EngineContext,
        primary: MemberId,
    ) -> Result<ArchiveReport> {
        let mut report = ArchiveReport::default();
        let ready = ctx.database.ready_segments(&self.cluster, primary).await?;

        for segment in ready {
            if segment.parse::<WalSegmentName>().is_err() {
                // History and backup-label files are not part of the replay stream
                debug!(cluster = %self.cluster, %segment, "Skipping non-segment WAL file");
                ctx.database
                    .mark_archived(&self.cluster, primary, &segment)
                    .await?;
                continue;
            }
            let data = ctx
                .database
                .read_segment(&self.cluster, primary, &segment)
                .await?;
            self.put_with_retry(&segment, frame(&data)).await?;
            ctx.database
                .mark_archived(&self.cluster, primary, &segment)
                .await?;
            report.archived += 1;
            report.last_segment = Some(segment);
        }

        if report.archived > 0 {
            ctx.metrics.record_archived(
                &self.cluster.namespace,
                &self.cluster.name,
                report.archived as u64,
            );
            debug!(
                cluster = %self.cluster,
                archived = report.archived,
                last = ?report.last_segment,
                "Archived WAL segments"
            );
        }
        Ok(report)
    }

    async fn put_with_retry(&self, segment: &str, data: Bytes) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.put(&self.prefix, segment, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        cluster = %self.cluster,
                        %segment,
                        attempt,
                        ?delay,
                        error = %e,
                        "Segment upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the whole archive prefix and confirm it lists empty
    pub async fn wipe(&self) -> Result<usize> {
        let removed = self.store.delete_prefix(&self.prefix).await?;
        info!(cluster = %self.cluster, prefix = %self.prefix, removed, "Archive wiped");
        Ok(removed)
    }
}

/// Side loop: archive from whichever member the published status names as primary
pub async fn run_archiver_loop(
    ctx: EngineContext,
    archiver: WalArchiver,
    mut status: watch::Receiver<PostgresClusterStatus>,
    mut shutdown: watch::Receiver<bool>,
    published: Arc<watch::Sender<ArchiverStatus>>,
) {
    let interval = ctx.config.archive_interval;
    info!(cluster = %archiver.cluster, prefix = %archiver.prefix, "Archiver started");
    loop {
        let primary = {
            let s = status.borrow_and_update();
            if s.pending_promotion.is_none() { s.primary } else { None }
        };
        if let Some(primary) = primary {
            match archiver.archive_pending(&ctx, primary).await {
                Ok(report) => published.send_modify(|p| {
                    p.archived_total += report.archived as u64;
                    if report.last_segment.is_some() {
                        p.last_segment = report.last_segment;
                    }
                    p.last_error = None;
                }),
                Err(e) => {
                    warn!(cluster = %archiver.cluster, error = %e, "Archive pass failed");
                    published.send_modify(|p| p.last_error = Some(e.to_string()));
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(cluster = %archiver.cluster, "Archiver stopped");
}

/// What a restore replayed
#[derive(Clone, Debug, PartialEq)]
pub struct RestoreReport {
    pub replayed: usize,
    pub last_segment: WalSegmentName,
}

/// Replay an archive into a member held in recovery.
///
/// For every stream position the segment of the highest timeline is taken, and the
/// timeline never steps back: replay ends where only an older branch continues. The
/// chosen segments must be contiguous from the first one up to the segment holding
/// `up_to` (or the last archived one), and every frame must verify; anything else fails
/// with [`Error::IrrecoverableData`] before that point is replayed.
pub async fn restore_from(
    ctx: &EngineContext,
    cluster: &ClusterKey,
    member: MemberId,
    store: &dyn BlobStore,
    prefix: &str,
    up_to: Option<WalPosition>,
) -> Result<RestoreReport> {
    let keys = store.list(prefix).await.map_err(|e| match e {
        StorageError::Io(_) => Error::StorageError(e),
        other => Error::IrrecoverableData(format!("archive {} unreadable: {}", prefix, other)),
    })?;

    let mut by_sequence: BTreeMap<u64, WalSegmentName> = BTreeMap::new();
    for key in &keys {
        let Ok(name) = key.parse::<WalSegmentName>() else {
            continue;
        };
        by_sequence
            .entry(name.sequence())
            .and_modify(|current| {
                if name.timeline > current.timeline {
                    *current = name;
                }
            })
            .or_insert(name);
    }

    let plan = replay_plan(&by_sequence, up_to)?;
    info!(
        cluster = %cluster,
        member = %member,
        %prefix,
        segments = plan.len(),
        "Replaying archived WAL"
    );

    let mut last = None;
    for name in &plan {
        let key = name.to_string();
        let framed = store.get(prefix, &key).await.map_err(|e| match e {
            StorageError::NotFound(_) => {
                Error::IrrecoverableData(format!("segment {} disappeared from archive", key))
            }
            other => Error::StorageError(other),
        })?;
        let data = unframe(&key, &framed).inspect_err(|e| {
            error!(cluster = %cluster, segment = %key, error = %e, "Corrupt archived segment");
        })?;
        ctx.database
            .replay_segment(cluster, member, &key, data)
            .await?;
        last = Some(*name);
    }

    match last {
        Some(last_segment) => Ok(RestoreReport {
            replayed: plan.len(),
            last_segment,
        }),
        None => Err(Error::IrrecoverableData(format!(
            "archive {} holds no WAL segments",
            prefix
        ))),
    }
}

/// Segments to replay in order, or the reason the archive cannot reach the target
pub fn replay_plan(
    by_sequence: &BTreeMap<u64, WalSegmentName>,
    up_to: Option<WalPosition>,
) -> Result<Vec<WalSegmentName>> {
    let mut plan = Vec::new();
    let mut expected: Option<u64> = None;

    for (&sequence, name) in by_sequence {
        if let Some(target) = up_to
            && name.start_position() > target
        {
            break;
        }
        if let Some(followed) = plan.last().map(|last: &WalSegmentName| last.timeline)
            && name.timeline < followed
        {
            // Only the abandoned branch continues past here
            if up_to.is_some() {
                return Err(Error::IrrecoverableData(format!(
                    "archive holds only timeline {} WAL after {} on timeline {}",
                    name.timeline,
                    plan.last().map(ToString::to_string).unwrap_or_default(),
                    followed
                )));
            }
            break;
        }
        if let Some(expected) = expected
            && sequence != expected
        {
            return Err(Error::IrrecoverableData(format!(
                "archive is missing WAL between segment {} and {}",
                plan.last().map(ToString::to_string).unwrap_or_default(),
                name
            )));
        }
        expected = Some(sequence + 1);
        plan.push(*name);
    }

    if let (Some(target), Some(last)) = (up_to, plan.last())
        && last.end_position() < target
    {
        return Err(Error::IrrecoverableData(format!(
            "archive ends at {} before the requested position {}",
            last.end_position(),
            target
        )));
    }
    Ok(plan)
}
