//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the controllers are
//! watching, and `/metrics` serves the [`Metrics`] registry in Prometheus text format.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

const HEALTH_ADDR: &str = "0.0.0.0:8080";

/// One cluster identity
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn of(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SnapshotLabels {
    pub namespace: String,
    pub name: String,
    pub outcome: String,
}

/// Register `metric` under the crate prefix and hand it back
fn registered<M: Metric + Clone>(registry: &mut Registry, name: &str, help: &str, metric: M) -> M {
    registry.register(format!("postgres_guardian_{}", name), help, metric.clone());
    metric
}

/// Engine and controller metrics. The engine records into it directly; the health
/// server only encodes.
pub struct Metrics {
    pub reconciliations_total: Family<ClusterLabels, Counter>,
    pub reconciliation_errors_total: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,
    pub clusters_total: Family<PhaseLabels, Gauge>,
    pub cluster_replicas_desired: Family<ClusterLabels, Gauge>,
    pub cluster_replicas_ready: Family<ClusterLabels, Gauge>,
    pub promotions_total: Family<ClusterLabels, Counter>,
    pub forced_demotions_total: Family<ClusterLabels, Counter>,
    pub snapshots_total: Family<SnapshotLabels, Counter>,
    pub archived_segments_total: Family<ClusterLabels, Counter>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut r = Registry::default();
        let durations = Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 15))
        });

        Self {
            reconciliations_total: registered(
                &mut r,
                "reconciliations",
                "Reconciliation passes completed",
                Family::default(),
            ),
            reconciliation_errors_total: registered(
                &mut r,
                "reconciliation_errors",
                "Reconciliation passes that returned an error",
                Family::default(),
            ),
            reconcile_duration_seconds: registered(
                &mut r,
                "reconcile_duration_seconds",
                "Duration of a reconciliation pass in seconds",
                durations,
            ),
            clusters_total: registered(
                &mut r,
                "clusters_total",
                "PostgreSQL clusters by lifecycle phase",
                Family::default(),
            ),
            cluster_replicas_desired: registered(
                &mut r,
                "cluster_replicas_desired",
                "Members each cluster should have",
                Family::default(),
            ),
            cluster_replicas_ready: registered(
                &mut r,
                "cluster_replicas_ready",
                "Members of each cluster answering as ready",
                Family::default(),
            ),
            promotions_total: registered(
                &mut r,
                "promotions",
                "Promotions completed, each starting a new timeline",
                Family::default(),
            ),
            forced_demotions_total: registered(
                &mut r,
                "forced_demotions",
                "Stale primaries demoted and re-joined as standby",
                Family::default(),
            ),
            snapshots_total: registered(
                &mut r,
                "snapshots",
                "Snapshots finished, by outcome",
                Family::default(),
            ),
            archived_segments_total: registered(
                &mut r,
                "archived_segments",
                "WAL segments shipped to the archive",
                Family::default(),
            ),
            registry: r,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::of(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ClusterLabels::of(namespace, name))
            .inc();
    }

    /// Set the number of clusters in `phase`; called after every full listing
    pub fn set_clusters_by_phase(&self, phase: &str, count: i64) {
        self.clusters_total
            .get_or_create(&PhaseLabels {
                phase: phase.to_string(),
            })
            .set(count);
    }

    pub fn set_cluster_replicas(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::of(namespace, name);
        self.cluster_replicas_desired.get_or_create(&labels).set(desired);
        self.cluster_replicas_ready.get_or_create(&labels).set(ready);
    }

    pub fn record_promotion(&self, namespace: &str, name: &str) {
        self.promotions_total
            .get_or_create(&ClusterLabels::of(namespace, name))
            .inc();
    }

    pub fn record_forced_demotion(&self, namespace: &str, name: &str) {
        self.forced_demotions_total
            .get_or_create(&ClusterLabels::of(namespace, name))
            .inc();
    }

    pub fn record_snapshot(&self, namespace: &str, name: &str, outcome: &str) {
        let labels = SnapshotLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            outcome: outcome.to_string(),
        };
        self.snapshots_total.get_or_create(&labels).inc();
    }

    pub fn record_archived(&self, namespace: &str, name: &str, segments: u64) {
        self.archived_segments_total
            .get_or_create(&ClusterLabels::of(namespace, name))
            .inc_by(segments);
    }

    /// Prometheus text exposition; empty if encoding fails
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        match encode(&mut buffer, &self.registry) {
            Ok(()) => buffer,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// What the probe endpoints report
pub struct HealthState {
    /// Set once the controllers are watching
    pub ready: RwLock<bool>,
    pub metrics: Arc<Metrics>,
    /// Unix seconds of the last successful reconcile
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Arc::new(Metrics::new()),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    pub fn touch(&self) {
        let now = chrono::Utc::now().timestamp();
        self.last_reconcile
            .store(u64::try_from(now).unwrap_or(0), Ordering::Relaxed);
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    match state.is_ready().await {
        true => (StatusCode::OK, "ready").into_response(),
        false => (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response(),
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probe endpoints until the listener fails
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    tracing::info!(addr = HEALTH_ADDR, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
