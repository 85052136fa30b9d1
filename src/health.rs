//! Probe and metrics endpoints.
//!
//! - `/healthz` answers while the process runs
//! - `/readyz` answers 200 only once this instance leads and runs the controllers
//! - `/metrics` renders the registry in the Prometheus text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use tracing::{error, info};

/// Address the probe server binds when none is configured.
pub const DEFAULT_BIND_ADDRESS: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);

const OPENMETRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Identifies one cluster object in metric labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    pub fn new(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        for (key, value) in [
            ("kind", self.kind),
            ("namespace", self.namespace.as_str()),
            ("name", self.name.as_str()),
        ] {
            (key, value).encode(encoder.encode_label())?;
        }
        Ok(())
    }
}

type PerCluster<M> = Family<ClusterLabels, M>;

fn register<M: Metric + Clone>(registry: &mut Registry, name: &str, help: &str, metric: M) -> M {
    registry.register(name, help, metric.clone());
    metric
}

/// Reconciliation and rollout metrics, all prefixed `clickhouse_operator_`.
pub struct Metrics {
    reconciliations: PerCluster<Counter>,
    reconcile_errors: PerCluster<Counter>,
    reconcile_duration: PerCluster<Histogram>,
    last_reconcile: Gauge,
    ready: PerCluster<Gauge>,
    replicas_desired: PerCluster<Gauge>,
    replicas_ready: PerCluster<Gauge>,
    /// Replica updates the rollout sequencer held back in the last pass.
    replicas_held: PerCluster<Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("clickhouse_operator");
        let r = &mut registry;

        let reconciliations = register(
            r,
            "reconciliations",
            "Reconciliation passes run",
            PerCluster::<Counter>::default(),
        );
        let reconcile_errors = register(
            r,
            "reconcile_errors",
            "Reconciliation passes that ended in an error",
            PerCluster::<Counter>::default(),
        );
        let reconcile_duration = register(
            r,
            "reconcile_duration_seconds",
            "Wall time of one reconciliation pass",
            PerCluster::<Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            }),
        );
        let last_reconcile = register(
            r,
            "last_reconcile_timestamp_seconds",
            "Unix time of the most recent finished pass",
            Gauge::default(),
        );
        let ready = register(
            r,
            "cluster_ready",
            "1 while the cluster reports the Ready condition",
            PerCluster::<Gauge>::default(),
        );
        let replicas_desired = register(
            r,
            "cluster_replicas_desired",
            "Replicas requested by the cluster",
            PerCluster::<Gauge>::default(),
        );
        let replicas_ready = register(
            r,
            "cluster_replicas_ready",
            "Replicas whose workload reports ready",
            PerCluster::<Gauge>::default(),
        );
        let replicas_held = register(
            r,
            "cluster_replicas_held",
            "Replica updates held back to preserve availability",
            PerCluster::<Gauge>::default(),
        );

        Self {
            reconciliations,
            reconcile_errors,
            reconcile_duration,
            last_reconcile,
            ready,
            replicas_desired,
            replicas_ready,
            replicas_held,
            registry,
        }
    }

    /// Count a finished pass and observe its duration.
    pub fn record_reconcile(&self, labels: &ClusterLabels, duration_secs: f64) {
        self.reconciliations.get_or_create(labels).inc();
        self.reconcile_duration
            .get_or_create(labels)
            .observe(duration_secs);
        self.last_reconcile.set(jiff::Timestamp::now().as_second());
    }

    pub fn record_error(&self, labels: &ClusterLabels) {
        self.reconcile_errors.get_or_create(labels).inc();
    }

    /// Publish the per-cluster gauges of the last pass.
    pub fn set_cluster_state(
        &self,
        labels: &ClusterLabels,
        ready: bool,
        desired_replicas: i64,
        ready_replicas: i64,
        held_replicas: i64,
    ) {
        self.ready.get_or_create(labels).set(i64::from(ready));
        self.replicas_desired
            .get_or_create(labels)
            .set(desired_replicas);
        self.replicas_ready.get_or_create(labels).set(ready_replicas);
        self.replicas_held.get_or_create(labels).set(held_replicas);
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// State shared between the controllers and the probe server.
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    /// Starts out not ready.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
                String::new(),
            )
        }
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probe and metrics endpoints on `addr` until the listener fails.
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
