use std::sync::Arc;

use kube::Client;

use crate::cluster::{ClusterRegistry, EngineContext};
use crate::config::EngineConfig;
use crate::controller::status::KubeStatusSink;
use crate::health::{HealthState, Metrics};
use crate::postgres::KubeDatabaseClient;
use crate::resources::catalog::{KubeDormantStore, KubeSnapshotCatalog};
use crate::resources::member::KubeComputeRuntime;
use crate::resources::secret::KubeCredentialStore;
use crate::storage::ObjectStoreResolver;

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// One control loop per PostgresCluster
    pub registry: ClusterRegistry,
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Wire the engine to Kubernetes-backed collaborators
    pub fn new(
        client: Client,
        config: EngineConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let metrics = health_state
            .as_ref()
            .map(|h| h.metrics.clone())
            .unwrap_or_else(|| Arc::new(Metrics::new()));
        let engine = EngineContext {
            compute: Arc::new(KubeComputeRuntime::new(client.clone())),
            database: Arc::new(KubeDatabaseClient::new(client.clone())),
            credentials: Arc::new(KubeCredentialStore::new(client.clone())),
            dormant: Arc::new(KubeDormantStore::new(client.clone())),
            snapshots: Arc::new(KubeSnapshotCatalog::new(client.clone())),
            storage: Arc::new(ObjectStoreResolver::new(client.clone())),
            status_sink: Some(Arc::new(KubeStatusSink::new(client.clone()))),
            config,
            metrics,
        };
        Self {
            client,
            registry: ClusterRegistry::new(engine),
            health_state,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.registry.context().metrics
    }
}
