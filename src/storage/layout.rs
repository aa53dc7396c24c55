//! Key layout inside a backend
//!
//! ```text
//! {root}/{namespace}/{cluster}/archive/{timeline-qualified segment}
//! {root}/{namespace}/{cluster}/snapshots/{snapshot}/dump.sql
//! {root}/{namespace}/{cluster}/snapshots/{snapshot}/manifest.json
//! ```

use crate::cluster::model::ClusterKey;
use crate::crd::StorageBackend;

/// Root used when a backend has no prefix of its own
pub const DEFAULT_ROOT: &str = "guardian";

pub const SNAPSHOT_DUMP_KEY: &str = "dump.sql";
pub const SNAPSHOT_MANIFEST_KEY: &str = "manifest.json";

fn root(backend: &StorageBackend) -> &str {
    match backend.prefix() {
        "" => DEFAULT_ROOT,
        p => p,
    }
}

/// All objects that belong to one cluster
pub fn cluster_prefix(backend: &StorageBackend, cluster: &ClusterKey) -> String {
    format!("{}/{}/{}", root(backend), cluster.namespace, cluster.name)
}

/// Where the archiver ships WAL segments of a cluster
pub fn archive_prefix(backend: &StorageBackend, cluster: &ClusterKey) -> String {
    format!("{}/archive", cluster_prefix(backend, cluster))
}

/// Parent of every snapshot directory of a cluster
pub fn snapshots_prefix(backend: &StorageBackend, cluster: &ClusterKey) -> String {
    format!("{}/snapshots", cluster_prefix(backend, cluster))
}

/// Directory owned by exactly one snapshot record
pub fn snapshot_prefix(backend: &StorageBackend, cluster: &ClusterKey, snapshot: &str) -> String {
    format!("{}/{}", snapshots_prefix(backend, cluster), snapshot)
}

/// Prefix of an existing archive named in an init spec; used verbatim
pub fn restore_prefix(backend: &StorageBackend) -> String {
    backend.prefix().to_string()
}
