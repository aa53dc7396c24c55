//! In-process implementations of the persistence ports
//!
//! Used by the test suite and by embedders that run the engine without a Kubernetes API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::cluster::dormant::DormantRecord;
use crate::cluster::model::ClusterKey;
use crate::cluster::ports::{
    CollaboratorError, CredentialStore, DormantStore, PortResult, SnapshotCatalog, StatusSink,
};
use crate::cluster::snapshot::SnapshotRecord;
use crate::crd::PostgresClusterStatus;
use crate::resources::secret::{credentials_secret_name, generate_password};

fn lock<T>(mutex: &Mutex<T>) -> PortResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| CollaboratorError::Unavailable("in-memory store lock poisoned".to_string()))
}

#[derive(Clone, Default)]
pub struct MemoryDormantStore {
    records: Arc<Mutex<HashMap<ClusterKey, DormantRecord>>>,
}

impl MemoryDormantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, cluster: &ClusterKey) -> bool {
        self.records
            .lock()
            .map(|r| r.contains_key(cluster))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DormantStore for MemoryDormantStore {
    async fn get(&self, cluster: &ClusterKey) -> PortResult<Option<DormantRecord>> {
        Ok(lock(&self.records)?.get(cluster).cloned())
    }

    async fn put(&self, record: &DormantRecord) -> PortResult<()> {
        lock(&self.records)?.insert(record.cluster.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, cluster: &ClusterKey) -> PortResult<()> {
        lock(&self.records)?.remove(cluster);
        Ok(())
    }
}

/// Snapshot records keyed by namespace and name
#[derive(Clone, Default)]
pub struct MemorySnapshotCatalog {
    records: Arc<Mutex<BTreeMap<(String, String), SnapshotRecord>>>,
}

impl MemorySnapshotCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotCatalog for MemorySnapshotCatalog {
    async fn get(&self, namespace: &str, name: &str) -> PortResult<Option<SnapshotRecord>> {
        Ok(lock(&self.records)?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn upsert(&self, record: &SnapshotRecord) -> PortResult<()> {
        lock(&self.records)?.insert(
            (record.namespace.clone(), record.name.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn list(&self, cluster: &ClusterKey) -> PortResult<Vec<SnapshotRecord>> {
        Ok(lock(&self.records)?
            .values()
            .filter(|r| r.namespace == cluster.namespace && r.cluster == cluster.name)
            .cloned()
            .collect())
    }

    async fn remove(&self, namespace: &str, name: &str) -> PortResult<()> {
        lock(&self.records)?.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// Credentials secrets held as name to password
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    secrets: Arc<Mutex<BTreeMap<(String, String), String>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret created outside the engine
    pub fn insert(&self, namespace: &str, name: &str, password: &str) {
        if let Ok(mut secrets) = self.secrets.lock() {
            secrets.insert((namespace.to_string(), name.to_string()), password.to_string());
        }
    }

    pub fn password(&self, namespace: &str, name: &str) -> Option<String> {
        self.secrets
            .lock()
            .ok()
            .and_then(|s| s.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    pub fn count(&self, namespace: &str) -> usize {
        self.secrets
            .lock()
            .map(|s| s.keys().filter(|(ns, _)| ns == namespace).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn ensure(&self, cluster: &ClusterKey, existing: Option<&str>) -> PortResult<String> {
        let mut secrets = lock(&self.secrets)?;
        match existing {
            Some(name) => {
                if secrets.contains_key(&(cluster.namespace.clone(), name.to_string())) {
                    Ok(name.to_string())
                } else {
                    Err(CollaboratorError::NotFound(format!(
                        "secret {}/{}",
                        cluster.namespace, name
                    )))
                }
            }
            None => {
                let name = credentials_secret_name(&cluster.name);
                secrets
                    .entry((cluster.namespace.clone(), name.clone()))
                    .or_insert_with(|| generate_password(24));
                Ok(name)
            }
        }
    }

    async fn exists(&self, cluster: &ClusterKey, name: &str) -> PortResult<bool> {
        Ok(lock(&self.secrets)?.contains_key(&(cluster.namespace.clone(), name.to_string())))
    }

    async fn delete(&self, cluster: &ClusterKey, name: &str) -> PortResult<()> {
        lock(&self.secrets)?.remove(&(cluster.namespace.clone(), name.to_string()));
        Ok(())
    }
}

/// Keeps every status it was handed, in order
#[derive(Clone, Default)]
pub struct RecordingStatusSink {
    history: Arc<Mutex<Vec<(ClusterKey, PostgresClusterStatus)>>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, cluster: &ClusterKey) -> Vec<PostgresClusterStatus> {
        self.history
            .lock()
            .map(|h| {
                h.iter()
                    .filter(|(k, _)| k == cluster)
                    .map(|(_, s)| s.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusSink for RecordingStatusSink {
    async fn publish(
        &self,
        cluster: &ClusterKey,
        status: &PostgresClusterStatus,
    ) -> PortResult<()> {
        lock(&self.history)?.push((cluster.clone(), status.clone()));
        Ok(())
    }
}
