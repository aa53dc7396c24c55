//! Reconciliation of Snapshot resources
//!
//! Manual snapshots are taken here; scheduled ones belong to the cluster's snapshot
//! loop. Deleting any Snapshot removes its backend directory before the resource goes.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterKey;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{RetentionTag, Snapshot};
use crate::resources::common::FIELD_MANAGER;

pub const SNAPSHOT_FINALIZER: &str = "guardian.postgres.io/snapshot-data";

fn has_finalizer(snapshot: &Snapshot) -> bool {
    snapshot.finalizers().iter().any(|f| f == SNAPSHOT_FINALIZER)
}

async fn set_finalizers(api: &Api<Snapshot>, name: &str, finalizers: Vec<String>) -> Result<()> {
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[instrument(skip(snapshot, ctx), fields(name = %snapshot.name_any(), namespace = %snapshot.namespace().unwrap_or_default()))]
pub async fn reconcile_snapshot(snapshot: Arc<Snapshot>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = snapshot
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = snapshot.name_any();
    let api: Api<Snapshot> = Api::namespaced(ctx.client.clone(), &namespace);

    if snapshot.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&snapshot) {
            let existed = ctx.registry.delete_snapshot(&namespace, &name).await?;
            debug!(existed, "Snapshot data released");
            let remaining = snapshot
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != SNAPSHOT_FINALIZER)
                .cloned()
                .collect();
            set_finalizers(&api, &name, remaining).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&snapshot) {
        let mut finalizers = snapshot.finalizers().to_vec();
        finalizers.push(SNAPSHOT_FINALIZER.to_string());
        set_finalizers(&api, &name, finalizers).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let status = snapshot.status.clone().unwrap_or_default();
    if status.phase.is_terminal() || status.retention_tag == RetentionTag::Scheduled {
        return Ok(Action::await_change());
    }

    let key = ClusterKey::new(&namespace, &snapshot.spec.database_name);
    let record = ctx
        .registry
        .take_snapshot(&key, &name, snapshot.spec.storage.clone())
        .await?;
    info!(phase = %record.phase, "Manual snapshot reconciled");
    Ok(Action::await_change())
}

pub fn snapshot_error_policy(snapshot: Arc<Snapshot>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(
        "Snapshot {} failed: {}, requeuing in {:?}",
        snapshot.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
