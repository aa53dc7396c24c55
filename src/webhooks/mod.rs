//! Admission webhooks
//!
//! Refuses invalid PostgresCluster specs, deletion under DoNotTerminate, creation over an
//! incompatible dormant record, and edits to fixed Snapshot and DormantDatabase fields.
//! The control loop repeats the cluster checks, so the webhook is a fast path, not the
//! only guard.

pub mod policies;
mod server;

pub use policies::{AdmissionOperation, ValidationContext, ValidationResult};
pub use server::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};
