// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for postgres-guardian
//!
//! This module contains unit tests for:
//! - Resource generators (member pods and volumes, services, secrets)
//! - Validation logic
//! - Status management
//! - State machine transitions
//! - Admission policies
//! - Storage backends

#[path = "../common/mod.rs"]
mod common;

mod resources;
mod status;
mod storage;
mod validation;
mod webhooks;
