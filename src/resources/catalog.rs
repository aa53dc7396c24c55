//! Snapshot and DormantDatabase resources as engine persistence
//!
//! Records are written as custom resources without owner references so they outlive the
//! PostgresCluster they describe.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, ResourceExt};
use serde_json::json;

use crate::cluster::dormant::DormantRecord;
use crate::cluster::model::ClusterKey;
use crate::cluster::ports::{CollaboratorError, DormantStore, PortResult, SnapshotCatalog};
use crate::cluster::snapshot::SnapshotRecord;
use crate::crd::{
    DormantDatabase, DormantDatabaseSpec, DormantDatabaseStatus, DormantOrigin, DormantPhase,
    Snapshot, SnapshotSpec, SnapshotStatus,
};
use crate::resources::common::{FIELD_MANAGER, standard_labels};

/// Creation time of a record, kept stable across status rewrites
pub const CREATED_AT_ANNOTATION: &str = "guardian.postgres.io/created-at";

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn ignore_not_found<T>(result: kube::Result<T>) -> PortResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Convert a Snapshot resource to the engine's record
pub fn snapshot_record(snapshot: &Snapshot) -> PortResult<SnapshotRecord> {
    let namespace = snapshot
        .namespace()
        .ok_or_else(|| CollaboratorError::Corrupt("snapshot without namespace".to_string()))?;
    let status = snapshot.status.clone().unwrap_or_default();
    let created_at = parse_time(snapshot.annotations().get(CREATED_AT_ANNOTATION))
        .or_else(|| snapshot.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or_else(Utc::now);

    let mut record = SnapshotRecord::new(
        &ClusterKey::new(namespace, snapshot.spec.database_name.clone()),
        snapshot.name_any(),
        snapshot.spec.storage.clone(),
        status.retention_tag,
        created_at,
    );
    record.phase = status.phase;
    record.started_at = parse_time(status.start_time.as_ref());
    record.completed_at = parse_time(status.completion_time.as_ref());
    record.location = status.location;
    record.size_bytes = status.size_bytes;
    record.reason = status.reason;
    Ok(record)
}

pub fn snapshot_status(record: &SnapshotRecord) -> SnapshotStatus {
    SnapshotStatus {
        phase: record.phase,
        start_time: record.started_at.map(|t| t.to_rfc3339()),
        completion_time: record.completed_at.map(|t| t.to_rfc3339()),
        reason: record.reason.clone(),
        location: record.location.clone(),
        size_bytes: record.size_bytes,
        retention_tag: record.retention,
    }
}

/// [`SnapshotCatalog`] backed by Snapshot resources
#[derive(Clone)]
pub struct KubeSnapshotCatalog {
    client: Client,
}

impl KubeSnapshotCatalog {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Snapshot> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SnapshotCatalog for KubeSnapshotCatalog {
    async fn get(&self, namespace: &str, name: &str) -> PortResult<Option<SnapshotRecord>> {
        match self.api(namespace).get_opt(name).await? {
            Some(snapshot) => Ok(Some(snapshot_record(&snapshot)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, record: &SnapshotRecord) -> PortResult<()> {
        let api = self.api(&record.namespace);
        if api.get_opt(&record.name).await?.is_none() {
            let snapshot = Snapshot {
                metadata: ObjectMeta {
                    name: Some(record.name.clone()),
                    namespace: Some(record.namespace.clone()),
                    labels: Some(standard_labels(&record.cluster)),
                    annotations: Some(BTreeMap::from([(
                        CREATED_AT_ANNOTATION.to_string(),
                        record.created_at.to_rfc3339(),
                    )])),
                    ..Default::default()
                },
                spec: SnapshotSpec {
                    database_name: record.cluster.clone(),
                    storage: record.storage.clone(),
                },
                status: None,
            };
            match api.create(&PostParams::default(), &snapshot).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }

        let patch = json!({ "status": snapshot_status(record) });
        api.patch_status(
            &record.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn list(&self, cluster: &ClusterKey) -> PortResult<Vec<SnapshotRecord>> {
        let snapshots = self
            .api(&cluster.namespace)
            .list(&ListParams::default())
            .await?;
        snapshots
            .items
            .iter()
            .filter(|s| s.spec.database_name == cluster.name)
            .map(snapshot_record)
            .collect()
    }

    async fn remove(&self, namespace: &str, name: &str) -> PortResult<()> {
        ignore_not_found(self.api(namespace).delete(name, &DeleteParams::default()).await)
    }
}

/// Convert a DormantDatabase resource to the engine's record
pub fn dormant_record(dormant: &DormantDatabase) -> PortResult<DormantRecord> {
    let namespace = dormant
        .namespace()
        .ok_or_else(|| CollaboratorError::Corrupt("dormant database without namespace".to_string()))?;
    let status = dormant.status.clone().unwrap_or_default();
    let origin = &dormant.spec.origin;
    Ok(DormantRecord {
        cluster: ClusterKey::new(namespace, dormant.name_any()),
        spec: origin.spec.clone(),
        volumes: origin.volumes.clone(),
        credentials_secret: origin.credentials_secret.clone(),
        last_primary: origin.last_primary,
        timeline: origin.timeline,
        initialized: origin.initialized,
        wipe_out: dormant.spec.wipe_out,
        phase: status.phase,
        paused_at: parse_time(status.paused_at.as_ref())
            .or_else(|| dormant.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .unwrap_or_else(Utc::now),
    })
}

/// [`DormantStore`] backed by DormantDatabase resources named after the cluster
#[derive(Clone)]
pub struct KubeDormantStore {
    client: Client,
}

impl KubeDormantStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DormantDatabase> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DormantStore for KubeDormantStore {
    async fn get(&self, cluster: &ClusterKey) -> PortResult<Option<DormantRecord>> {
        match self.api(&cluster.namespace).get_opt(&cluster.name).await? {
            Some(dormant) => Ok(Some(dormant_record(&dormant)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &DormantRecord) -> PortResult<()> {
        let api = self.api(&record.cluster.namespace);
        let dormant = DormantDatabase {
            metadata: ObjectMeta {
                name: Some(record.cluster.name.clone()),
                namespace: Some(record.cluster.namespace.clone()),
                labels: Some(standard_labels(&record.cluster.name)),
                ..Default::default()
            },
            spec: DormantDatabaseSpec {
                wipe_out: record.wipe_out,
                origin: DormantOrigin {
                    spec: record.spec.clone(),
                    volumes: record.volumes.clone(),
                    credentials_secret: record.credentials_secret.clone(),
                    last_primary: record.last_primary,
                    timeline: record.timeline,
                    initialized: record.initialized,
                },
            },
            status: None,
        };
        api.patch(
            &record.cluster.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&dormant),
        )
        .await?;

        let status = DormantDatabaseStatus {
            phase: record.phase,
            paused_at: Some(record.paused_at.to_rfc3339()),
            wiped_out_at: (record.phase == DormantPhase::WipedOut)
                .then(|| Utc::now().to_rfc3339()),
            reason: None,
        };
        api.patch_status(
            &record.cluster.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, cluster: &ClusterKey) -> PortResult<()> {
        ignore_not_found(
            self.api(&cluster.namespace)
                .delete(&cluster.name, &DeleteParams::default())
                .await,
        )
    }
}
