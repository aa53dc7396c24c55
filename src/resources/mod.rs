//! Kubernetes-backed collaborators
//!
//! Members are Pods with their own data volumes, reached through a headless service.
//! Writes and reads are routed by service selectors. Snapshots and dormant records are
//! custom resources.

pub mod catalog;
pub mod common;
pub mod member;
pub mod secret;
pub mod service;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
