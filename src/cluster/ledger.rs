//! Single owner of one cluster's status
//!
//! Every status change goes through the ledger held by the cluster's control loop.
//! `commit` publishes to the watch channel first, then to the optional sink (the
//! Kubernetes status subresource).

use std::sync::Arc;

use tokio::sync::watch;

use crate::cluster::model::ClusterKey;
use crate::cluster::ports::StatusSink;
use crate::controller::error::Result;
use crate::crd::PostgresClusterStatus;

pub struct StatusLedger {
    cluster: ClusterKey,
    status: PostgresClusterStatus,
    tx: watch::Sender<PostgresClusterStatus>,
    sink: Option<Arc<dyn StatusSink>>,
}

impl StatusLedger {
    pub fn new(
        cluster: ClusterKey,
        tx: watch::Sender<PostgresClusterStatus>,
        sink: Option<Arc<dyn StatusSink>>,
    ) -> Self {
        let status = tx.borrow().clone();
        Self {
            cluster,
            status,
            tx,
            sink,
        }
    }

    pub fn cluster(&self) -> &ClusterKey {
        &self.cluster
    }

    pub fn status(&self) -> &PostgresClusterStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut PostgresClusterStatus {
        &mut self.status
    }

    /// Readers of the published status
    pub fn subscribe(&self) -> watch::Receiver<PostgresClusterStatus> {
        self.tx.subscribe()
    }

    /// Publish the working copy. A sink failure is returned after local
    /// subscribers have already seen the change.
    pub async fn commit(&mut self) -> Result<()> {
        self.tx.send_if_modified(|published| {
            if *published == self.status {
                false
            } else {
                *published = self.status.clone();
                true
            }
        });
        if let Some(sink) = &self.sink {
            sink.publish(&self.cluster, &self.status).await?;
        }
        Ok(())
    }
}
