//! Validation for PostgresCluster specs and spec changes
//!
//! Everything here is synchronous and side-effect free. A failure is surfaced to the
//! caller as [`Error::ValidationError`] (or [`Error::PolicyViolation`] for deletion)
//! before any state changes.

use crate::cluster::model::WalPosition;
use crate::cluster::snapshot::Schedule;
use crate::controller::error::{Error, Result};
use crate::crd::{
    InitSource, InitSpec, PostgresClusterSpec, StorageBackend, StorageType, TerminationPolicy,
};

/// Minimum number of replicas
pub const MIN_REPLICAS: i32 = 1;

/// Maximum number of replicas (arbitrary limit for safety)
pub const MAX_REPLICAS: i32 = 100;

/// Environment variables that would override generated credentials
pub const RESERVED_ENV: &[&str] = &["POSTGRES_PASSWORD"];

/// Validate the cluster spec
pub fn validate_spec(spec: &PostgresClusterSpec) -> Result<()> {
    validate_replicas(spec)?;
    validate_storage(spec)?;
    validate_env(spec)?;
    validate_policy(spec)?;
    validate_backends(spec)?;
    validate_init(spec)?;
    if let Some(schedule) = &spec.backup_schedule {
        Schedule::parse(&schedule.cron_expression)?;
    }
    Ok(())
}

/// Validate replica count
fn validate_replicas(spec: &PostgresClusterSpec) -> Result<()> {
    let replicas = spec.replicas;

    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

/// Validate storage configuration
fn validate_storage(spec: &PostgresClusterSpec) -> Result<()> {
    let size = &spec.storage.size;

    // Validate size format (e.g., "10Gi", "100Gi")
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "storage size must end with Gi, Mi, or Ti: {}",
            size
        )));
    }

    let num_str = size.trim_end_matches(char::is_alphabetic);
    let _num: u64 = num_str
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid storage size number: {}", size)))?;

    Ok(())
}

fn validate_env(spec: &PostgresClusterSpec) -> Result<()> {
    for var in &spec.env {
        if RESERVED_ENV.contains(&var.name.as_str()) {
            return Err(Error::ValidationError(format!(
                "environment variable {} is managed by the operator and cannot be set",
                var.name
            )));
        }
    }
    Ok(())
}

fn validate_policy(spec: &PostgresClusterSpec) -> Result<()> {
    if spec.storage_type == StorageType::Ephemeral
        && spec.termination_policy == TerminationPolicy::Pause
    {
        return Err(Error::ValidationError(
            "terminationPolicy Pause needs durable storage; ephemeral members keep nothing to resume"
                .to_string(),
        ));
    }
    Ok(())
}

pub fn validate_backend(field: &str, backend: &StorageBackend) -> Result<()> {
    match backend.variant_count() {
        1 => {}
        0 => {
            return Err(Error::ValidationError(format!(
                "{}: no storage backend configured",
                field
            )));
        }
        n => {
            return Err(Error::ValidationError(format!(
                "{}: exactly one storage backend must be set, found {}",
                field, n
            )));
        }
    }
    if backend.container().is_some_and(str::is_empty) {
        return Err(Error::ValidationError(format!(
            "{}: bucket or container name is empty",
            field
        )));
    }
    Ok(())
}

fn validate_backends(spec: &PostgresClusterSpec) -> Result<()> {
    if let Some(archiver) = &spec.archiver {
        validate_backend("archiver.storage", &archiver.storage)?;
    }
    if let Some(schedule) = &spec.backup_schedule {
        validate_backend("backupSchedule.storage", &schedule.storage)?;
    }
    Ok(())
}

fn validate_init(spec: &PostgresClusterSpec) -> Result<()> {
    let Some(init) = &spec.init else {
        return Ok(());
    };
    let InitSpec {
        script,
        snapshot_source,
        postgres_wal,
    } = init;
    let sources =
        usize::from(script.is_some()) + usize::from(snapshot_source.is_some()) + usize::from(postgres_wal.is_some());
    if sources > 1 {
        return Err(Error::ValidationError(
            "init must name exactly one source".to_string(),
        ));
    }

    match spec.init_source() {
        InitSource::Snapshot(source) => {
            if source.name.is_empty() {
                return Err(Error::ValidationError(
                    "init.snapshotSource.name is required".to_string(),
                ));
            }
            // The dump carries roles owned by the original credentials
            if spec.database_secret.is_none() {
                return Err(Error::ValidationError(
                    "initializing from a snapshot requires databaseSecret".to_string(),
                ));
            }
        }
        InitSource::WalArchive(source) => {
            validate_backend("init.postgresWal.storage", &source.storage)?;
            if let Some(up_to) = &source.up_to {
                up_to
                    .parse::<WalPosition>()
                    .map_err(|e| Error::ValidationError(format!("init.postgresWal.upTo: {}", e)))?;
            }
        }
        InitSource::Script(_) | InitSource::None => {}
    }
    Ok(())
}

/// Result of comparing old and new spec
#[derive(Debug, Clone)]
pub struct SpecDiff {
    /// Number of replicas changed
    pub replicas_changed: bool,
    /// Scale direction (positive = up, negative = down)
    pub replica_delta: i32,
    pub standby_mode_changed: bool,
    /// PostgreSQL parameters or environment changed
    pub params_changed: bool,
    pub archiver_changed: bool,
    pub schedule_changed: bool,
    pub policy_changed: bool,
}

impl SpecDiff {
    /// Check if any changes require members to restart
    pub fn requires_restart(&self) -> bool {
        self.standby_mode_changed || self.params_changed
    }

    /// Check if this is a scale-only operation
    pub fn is_scale_only(&self) -> bool {
        self.replicas_changed
            && !self.standby_mode_changed
            && !self.params_changed
            && !self.archiver_changed
            && !self.schedule_changed
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.replicas_changed
            || self.standby_mode_changed
            || self.params_changed
            || self.archiver_changed
            || self.schedule_changed
            || self.policy_changed
    }
}

/// Validate an update. The new spec must be valid on its own and keep the fields
/// that are fixed at creation.
pub fn validate_spec_change(old: &PostgresClusterSpec, new: &PostgresClusterSpec) -> Result<SpecDiff> {
    validate_spec(new)?;

    if old.storage != new.storage {
        return Err(Error::ValidationError(
            "storage cannot be changed after creation".to_string(),
        ));
    }
    if old.storage_type != new.storage_type {
        return Err(Error::ValidationError(
            "storageType cannot be changed after creation".to_string(),
        ));
    }

    let replica_delta = new.replicas - old.replicas;
    if replica_delta < 0 {
        validate_scale_down(old, new);
    }

    Ok(SpecDiff {
        replicas_changed: replica_delta != 0,
        replica_delta,
        standby_mode_changed: old.standby_mode != new.standby_mode,
        params_changed: old.postgresql_params != new.postgresql_params || old.env != new.env,
        archiver_changed: old.archiver != new.archiver,
        schedule_changed: old.backup_schedule != new.backup_schedule,
        policy_changed: old.termination_policy != new.termination_policy,
    })
}

/// Scale down never drops below the minimum (checked by `validate_spec`); large steps
/// only warn
fn validate_scale_down(old: &PostgresClusterSpec, new: &PostgresClusterSpec) {
    let old_replicas = old.replicas;
    let delta = old_replicas - new.replicas;
    if old_replicas > 2 && delta > old_replicas / 2 {
        tracing::warn!(
            "Large scale down detected: {} -> {} ({}% reduction). Consider scaling down gradually.",
            old_replicas,
            new.replicas,
            (delta as f64 / old_replicas as f64 * 100.0) as i32
        );
    }
}

/// Refuse deletion under DoNotTerminate
pub fn validate_deletion(name: &str, spec: &PostgresClusterSpec) -> Result<()> {
    if spec.termination_policy == TerminationPolicy::DoNotTerminate {
        return Err(Error::PolicyViolation(format!(
            "cluster {} has terminationPolicy DoNotTerminate; change the policy before deleting",
            name
        )));
    }
    Ok(())
}
