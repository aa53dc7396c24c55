//! Status and conditions management for PostgresCluster resources
//!
//! Conditions are derived from the status the engine commits; [`KubeStatusSink`] writes
//! every committed status to the status subresource.

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};

use crate::cluster::model::ClusterKey;
use crate::cluster::ports::{PortResult, StatusSink};
use crate::controller::state_machine::TransitionContext;
use crate::crd::{ClusterPhase, Condition, PostgresCluster, PostgresClusterStatus};
use crate::resources::common::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// A primary accepts writes and every member is ready
    pub const READY: &str = "Ready";
    /// Members are being created, resumed or caught up
    pub const PROGRESSING: &str = "Progressing";
    /// Some members are not ready, or no primary accepts writes
    pub const DEGRADED: &str = "Degraded";
    /// The write endpoint points at a confirmed primary
    pub const PRIMARY_AVAILABLE: &str = "PrimaryAvailable";
    /// Initialization (or resume) has completed
    pub const INITIALIZED: &str = "Initialized";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    pub fn new(generation: Option<i64>) -> Self {
        Self {
            conditions: Vec::new(),
            generation,
        }
    }

    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition. The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    fn flag(self, type_: &str, value: bool, reason: &str, message: &str) -> Self {
        let status = if value {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(type_, status, reason, message)
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::READY, is_ready, reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::PROGRESSING, is_progressing, reason, message)
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::DEGRADED, is_degraded, reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Conditions for a status about to be committed
pub fn cluster_conditions(
    status: &PostgresClusterStatus,
    ctx: &TransitionContext,
) -> Vec<Condition> {
    let members = format!("{}/{} members ready", ctx.ready_members, ctx.desired_members);
    let ready = status.phase == ClusterPhase::Running && ctx.all_members_ready();
    let builder =
        ConditionBuilder::from_existing(status.conditions.clone(), status.observed_generation);

    let builder = if ready {
        builder.ready(true, "ClusterReady", &members)
    } else {
        builder.ready(false, &status.phase.to_string(), &members)
    };

    let builder = match (&ctx.error_message, status.phase) {
        (Some(error), _) => builder.progressing(false, "InitializationFailed", error),
        (None, ClusterPhase::Provisioning) => {
            builder.progressing(true, "Provisioning", "Members are being created")
        }
        (None, _) if !ctx.all_members_ready() => {
            builder.progressing(true, "CatchingUp", &members)
        }
        (None, _) => builder.progressing(false, "Stable", "Cluster is stable"),
    };

    let builder = if status.phase == ClusterPhase::Failing {
        builder.degraded(true, "NoPrimary", "No primary accepts writes")
    } else if ctx.is_degraded() {
        builder.degraded(true, "MembersNotReady", &members)
    } else {
        builder.degraded(false, "Healthy", &members)
    };

    let builder = match status.write_endpoint {
        Some(primary) if ctx.primary_available => builder.flag(
            condition_types::PRIMARY_AVAILABLE,
            true,
            "PrimaryRouted",
            &format!("member {} on timeline {}", primary, status.timeline.0),
        ),
        _ => builder.flag(
            condition_types::PRIMARY_AVAILABLE,
            false,
            "WritesFenced",
            "the write endpoint has no target",
        ),
    };

    builder
        .flag(
            condition_types::INITIALIZED,
            ctx.initialized,
            if ctx.initialized { "Initialized" } else { "Pending" },
            if ctx.initialized {
                "initial data is in place"
            } else {
                "waiting for the first primary"
            },
        )
        .build()
}

/// Writes committed statuses to the PostgresCluster status subresource
#[derive(Clone)]
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn publish(&self, cluster: &ClusterKey, status: &PostgresClusterStatus) -> PortResult<()> {
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &cluster.namespace);
        // `primary` and the endpoints are cleared explicitly; a merge patch would keep them
        let mut patch = serde_json::json!({ "status": status });
        if let Some(obj) = patch.get_mut("status").and_then(|s| s.as_object_mut()) {
            for key in ["primary", "writeEndpoint", "pendingPromotion", "lastError"] {
                obj.entry(key).or_insert(serde_json::Value::Null);
            }
        }
        match api
            .patch_status(
                &cluster.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            // Resource already gone; the engine still owns the in-memory status
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
