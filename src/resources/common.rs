//! Common utilities for Kubernetes resource generation
//!
//! Shared label scheme and owner references for everything created on behalf of a
//! PostgresCluster.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::cluster::model::{ClusterKey, MemberId};
use crate::crd::PostgresCluster;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "guardian.postgres.io/v1alpha1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "postgres-guardian";

/// Label naming the owning cluster
pub const CLUSTER_LABEL: &str = "guardian.postgres.io/cluster";

/// Label carrying a member's ordinal
pub const MEMBER_LABEL: &str = "guardian.postgres.io/member";

/// Set on members currently behind the read endpoint
pub const READ_TARGET_LABEL: &str = "guardian.postgres.io/read-target";

/// Port every member listens on
pub const POSTGRES_PORT: i32 = 5432;

/// Generate an owner reference for a PostgresCluster
///
/// Only routing objects are owned. Members and volumes are removed by the termination
/// policy, never by garbage collection.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a PostgresCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels of one member's pod and volume
pub fn member_labels(cluster: &ClusterKey, id: MemberId) -> BTreeMap<String, String> {
    let mut labels = standard_labels(&cluster.name);
    labels.insert(MEMBER_LABEL.to_string(), id.0.to_string());
    labels
}

/// Label selector string matching every object of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster_name)
}

/// Host name of a member through the cluster's headless service
pub fn member_host(cluster: &ClusterKey, id: MemberId) -> String {
    format!(
        "{}.{}-members.{}.svc",
        cluster.member_name(id),
        cluster.name,
        cluster.namespace
    )
}

/// Parse the ordinal back out of a member label value
pub fn parse_member_label(labels: &BTreeMap<String, String>) -> Option<MemberId> {
    labels
        .get(MEMBER_LABEL)
        .and_then(|v| v.parse::<u32>().ok())
        .map(MemberId)
}
