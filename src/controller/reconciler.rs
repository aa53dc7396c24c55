//! Reconciliation of PostgresCluster resources
//!
//! The Kubernetes controller does not converge clusters itself. It hands each spec to
//! the cluster's control loop in the [`ClusterRegistry`](crate::cluster::ClusterRegistry)
//! and runs the termination policy behind a finalizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterKey, MemberId};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{ClusterPhase, PostgresCluster};
use crate::resources::common::FIELD_MANAGER;

/// Finalizer that runs the termination policy
pub const FINALIZER: &str = "guardian.postgres.io/finalizer";

/// Set once the cluster's data is initialized or resumed
pub const INITIALIZED_ANNOTATION: &str = "guardian.postgres.io/initialized";

/// Ordinal of a standby to promote; removed once the request is queued
pub const SWITCHOVER_ANNOTATION: &str = "guardian.postgres.io/switchover-to";

/// The control loop requeues itself; this only re-syncs specs the watch may have missed
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

fn cluster_key(cluster: &PostgresCluster) -> Result<ClusterKey> {
    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    Ok(ClusterKey::new(ns, cluster.name_any()))
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = %cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let key = cluster_key(&cluster)?;

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx, &key).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx, &key).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match ctx
        .registry
        .apply(key.clone(), cluster.spec.clone(), cluster.status.clone())
        .await
    {
        Ok(version) => debug!(version, "Spec handed to control loop"),
        Err(e @ Error::ValidationError(_)) => {
            // Not retried until the spec changes
            warn!(error = %e, "Rejected cluster spec");
            record_rejection(&cluster, &ctx, &key, &e).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    }

    request_switchover(&cluster, &ctx, &key).await?;
    mark_initialized(&cluster, &ctx, &key).await?;
    record_observed_generation(&cluster, &ctx, &key).await?;
    publish_phase_counts(&ctx);

    ctx.metrics()
        .record_reconcile(&key.namespace, &key.name, started.elapsed().as_secs_f64());
    if let Some(health) = &ctx.health_state {
        health.touch();
    }
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    ctx.metrics().record_error(&namespace, &name);

    let delay = BackoffConfig::default().delay_for_error(error, 0);
    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }
    Action::requeue(delay)
}

async fn record_rejection(
    cluster: &PostgresCluster,
    ctx: &Context,
    key: &ClusterKey,
    error: &Error,
) -> Result<()> {
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = serde_json::json!({
        "status": {
            "lastError": error.to_string(),
            "observedGeneration": cluster.metadata.generation,
        }
    });
    api.patch_status(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn record_observed_generation(
    cluster: &PostgresCluster,
    ctx: &Context,
    key: &ClusterKey,
) -> Result<()> {
    let observed = cluster.status.as_ref().and_then(|s| s.observed_generation);
    if observed == cluster.metadata.generation {
        return Ok(());
    }
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = serde_json::json!({
        "status": { "observedGeneration": cluster.metadata.generation }
    });
    api.patch_status(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Requested switchover target. A value that is not an ordinal is a ValidationError.
pub fn switchover_target(cluster: &PostgresCluster) -> Option<Result<MemberId>> {
    cluster.annotations().get(SWITCHOVER_ANNOTATION).map(|raw| {
        raw.trim().parse::<u32>().map(MemberId).map_err(|_| {
            Error::ValidationError(format!(
                "{} must be a member ordinal, got {:?}",
                SWITCHOVER_ANNOTATION, raw
            ))
        })
    })
}

async fn request_switchover(cluster: &PostgresCluster, ctx: &Context, key: &ClusterKey) -> Result<()> {
    let Some(target) = switchover_target(cluster) else {
        return Ok(());
    };
    match target {
        Ok(target) => {
            info!(member = %target, "Switchover requested for {}", key);
            ctx.registry.switchover(key, target)?;
        }
        Err(e) => warn!(error = %e, "Ignoring switchover request"),
    }
    patch_annotation(ctx, key, SWITCHOVER_ANNOTATION, None).await
}

async fn mark_initialized(cluster: &PostgresCluster, ctx: &Context, key: &ClusterKey) -> Result<()> {
    if cluster.annotations().contains_key(INITIALIZED_ANNOTATION) {
        return Ok(());
    }
    let initialized = ctx
        .registry
        .status(key)
        .is_some_and(|rx| rx.borrow().initialized);
    if initialized {
        patch_annotation(ctx, key, INITIALIZED_ANNOTATION, Some("true")).await?;
    }
    Ok(())
}

/// Set an annotation, or remove it with `None`
async fn patch_annotation(
    ctx: &Context,
    key: &ClusterKey,
    annotation: &str,
    value: Option<&str>,
) -> Result<()> {
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let patch = serde_json::json!({ "metadata": { "annotations": { annotation: value } } });
    api.patch(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

fn publish_phase_counts(ctx: &Context) {
    let mut counts: HashMap<ClusterPhase, i64> = HashMap::new();
    for key in ctx.registry.keys() {
        if let Some(status) = ctx.registry.status(&key) {
            *counts.entry(status.borrow().phase).or_default() += 1;
        }
    }
    for phase in [
        ClusterPhase::Provisioning,
        ClusterPhase::Running,
        ClusterPhase::Failing,
        ClusterPhase::Paused,
        ClusterPhase::Terminating,
    ] {
        ctx.metrics()
            .set_clusters_by_phase(&phase.to_string(), counts.get(&phase).copied().unwrap_or(0));
    }
}

/// Check if the finalizer is present
fn has_finalizer(cluster: &PostgresCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

/// Add the finalizer to the resource
async fn add_finalizer(cluster: &PostgresCluster, ctx: &Context, key: &ClusterKey) -> Result<()> {
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });

    api.patch(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Added finalizer to {}", key);
    Ok(())
}

async fn remove_finalizer(cluster: &PostgresCluster, ctx: &Context, key: &ClusterKey) -> Result<()> {
    let api: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let finalizers: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &key.name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    info!("Removed finalizer from {}", key);
    Ok(())
}

/// Run the termination policy, then release the resource
async fn handle_deletion(cluster: &PostgresCluster, ctx: &Context, key: &ClusterKey) -> Result<Action> {
    if !has_finalizer(cluster) {
        return Ok(Action::await_change());
    }
    info!(policy = %cluster.spec.termination_policy, "Handling deletion of {}", key);

    // After an operator restart the control loop has to exist before it can terminate
    if ctx.registry.handle(key).is_none() {
        ctx.registry
            .apply(key.clone(), cluster.spec.clone(), cluster.status.clone())
            .await?;
    }

    match ctx.registry.delete(key).await {
        Ok(phase) => {
            info!(%phase, "Termination policy applied to {}", key);
            remove_finalizer(cluster, ctx, key).await?;
            publish_phase_counts(ctx);
            Ok(Action::await_change())
        }
        Err(e @ Error::PolicyViolation(_)) => {
            warn!(error = %e, "Deletion refused for {}", key);
            record_rejection(cluster, ctx, key, &e).await?;
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

