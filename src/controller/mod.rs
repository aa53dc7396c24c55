pub mod context;
pub mod dormant_reconciler;
pub mod error;
pub mod reconciler;
pub mod snapshot_reconciler;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use context::Context;
pub use dormant_reconciler::{DORMANT_FINALIZER, dormant_error_policy, reconcile_dormant};
pub use error::{BackoffConfig, Error, ErrorContext, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use snapshot_reconciler::{SNAPSHOT_FINALIZER, reconcile_snapshot, snapshot_error_policy};
pub use state_machine::{ClusterEvent, ClusterStateMachine, TransitionContext};
pub use status::{ConditionBuilder, KubeStatusSink, cluster_conditions};
pub use validation::{
    MAX_REPLICAS, MIN_REPLICAS, SpecDiff, validate_deletion, validate_spec, validate_spec_change,
};
