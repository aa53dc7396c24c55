//! Reconciliation of DormantDatabase resources
//!
//! Setting `wipeOut` removes the retained volumes, credentials and backend data while
//! the record stays. Deleting the resource drops the record, wiping first when
//! `wipeOut` is set. A record consumed by a resumed cluster is released untouched.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{info, instrument, warn};

use crate::cluster::ClusterKey;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{DormantDatabase, DormantPhase};
use crate::resources::common::FIELD_MANAGER;

pub const DORMANT_FINALIZER: &str = "guardian.postgres.io/dormant-data";

fn has_finalizer(dormant: &DormantDatabase) -> bool {
    dormant.finalizers().iter().any(|f| f == DORMANT_FINALIZER)
}

async fn set_finalizers(
    api: &Api<DormantDatabase>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<()> {
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

#[instrument(skip(dormant, ctx), fields(name = %dormant.name_any(), namespace = %dormant.namespace().unwrap_or_default()))]
pub async fn reconcile_dormant(dormant: Arc<DormantDatabase>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = dormant
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let key = ClusterKey::new(&namespace, dormant.name_any());
    let api: Api<DormantDatabase> = Api::namespaced(ctx.client.clone(), &namespace);
    let running = ctx.registry.handle(&key).is_some_and(|h| h.is_running());

    if dormant.metadata.deletion_timestamp.is_some() {
        if has_finalizer(&dormant) {
            if running {
                info!("Dormant record released by resumed cluster {}", key);
            } else {
                ctx.registry
                    .delete_dormant(&key, dormant.spec.wipe_out)
                    .await?;
            }
            let remaining = dormant
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != DORMANT_FINALIZER)
                .cloned()
                .collect();
            set_finalizers(&api, &key.name, remaining).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&dormant) {
        let mut finalizers = dormant.finalizers().to_vec();
        finalizers.push(DORMANT_FINALIZER.to_string());
        set_finalizers(&api, &key.name, finalizers).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let wiped = dormant
        .status
        .as_ref()
        .is_some_and(|s| s.phase == DormantPhase::WipedOut);
    if dormant.spec.wipe_out && !wiped {
        if running {
            warn!("Ignoring wipeOut on {}: the cluster is running", key);
            return Ok(Action::await_change());
        }
        ctx.registry.wipe_dormant(&key).await?;
        info!("Dormant database {} wiped out", key);
    }
    Ok(Action::await_change())
}

pub fn dormant_error_policy(dormant: Arc<DormantDatabase>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(
        "DormantDatabase {} failed: {}, requeuing in {:?}",
        dormant.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
