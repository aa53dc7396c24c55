//! PostgreSQL access for members running in pods

pub mod client;
pub mod exec;

pub use client::KubeDatabaseClient;
pub use exec::PodExec;
