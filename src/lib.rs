pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod postgres;
pub mod resources;
pub mod storage;
pub mod webhooks;

pub use cluster::{ClusterHandle, ClusterKey, ClusterRegistry, EngineContext};
pub use config::EngineConfig;
pub use controller::{
    BackoffConfig, Context, DORMANT_FINALIZER, Error, FINALIZER, Result, SNAPSHOT_FINALIZER,
    dormant_error_policy, error_policy, reconcile, reconcile_dormant, reconcile_snapshot,
    snapshot_error_policy,
};
pub use crd::{DormantDatabase, PostgresCluster, Snapshot};
pub use health::{HealthState, Metrics};
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Log one controller result. NotFound after deletion is expected and logged at debug.
fn log_result<K, QueueErr>(
    kind: &str,
    result: std::result::Result<(ObjectRef<K>, Action), ControllerError<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: Debug,
{
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(e) => {
            let is_not_found = matches!(
                &e,
                ControllerError::ReconcilerFailed(err, _) if err.is_not_found()
            );
            if is_not_found {
                tracing::debug!("{} no longer exists (likely deleted): {:?}", kind, e);
            } else {
                tracing::error!("{} reconciliation error: {:?}", kind, e);
            }
        }
    }
}

/// Run every controller cluster-wide.
///
/// The PostgresCluster, Snapshot and DormantDatabase controllers share one
/// [`Context`], so they see the same set of running cluster control loops.
pub async fn run_controller(
    client: Client,
    config: EngineConfig,
    health_state: Option<Arc<HealthState>>,
) {
    run_controller_scoped(client, config, health_state, None).await
}

/// Run every controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
pub async fn run_controller_scoped(
    client: Client,
    config: EngineConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controllers for PostgresCluster, Snapshot and DormantDatabase (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let snapshots: Api<Snapshot> = scoped_api(client.clone(), namespace);
    let dormant: Api<DormantDatabase> = scoped_api(client.clone(), namespace);

    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();

    let cluster_controller = Controller::new(clusters, watcher_config.clone())
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move { log_result("PostgresCluster", result) });

    let snapshot_controller = Controller::new(snapshots, watcher_config.clone())
        .run(reconcile_snapshot, snapshot_error_policy, ctx.clone())
        .for_each(|result| async move { log_result("Snapshot", result) });

    let dormant_controller = Controller::new(dormant, watcher_config)
        .run(reconcile_dormant, dormant_error_policy, ctx.clone())
        .for_each(|result| async move { log_result("DormantDatabase", result) });

    futures::join!(cluster_controller, snapshot_controller, dormant_controller);

    // This should never complete in normal operation
    ctx.registry.shutdown();
    tracing::error!("Controller streams ended unexpectedly");
}
