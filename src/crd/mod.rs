pub mod backend;
mod dormant_database;
mod postgres_cluster;
mod snapshot;

pub use backend::{BackendKind, StorageBackend};
pub use dormant_database::*;
pub use postgres_cluster::*;
pub use snapshot::*;
