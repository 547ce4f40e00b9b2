//! Health endpoints and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (any method, always 200 while the server runs)
//! - `/readyz` - Readiness probe (503 once shutdown has started)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;

/// Body returned by the liveness probe
pub const HEALTHY_BODY: &str = "200 - Healthy";

/// How an admission review was answered
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Allowed with an injection patch
    Patched,
    /// Allowed without a patch
    Skipped,
    /// Denied after a valid request
    Denied,
    /// Rejected before the request could be read
    Invalid,
}

impl AdmissionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AdmissionOutcome::Patched => "patched",
            AdmissionOutcome::Skipped => "skipped",
            AdmissionOutcome::Denied => "denied",
            AdmissionOutcome::Invalid => "invalid",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub outcome: AdmissionOutcome,
}

impl EncodeLabelSet for OutcomeLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Admission reviews answered, by outcome
    pub admission_reviews_total: Family<OutcomeLabels, Counter>,
    /// Time spent answering an admission review
    pub admission_duration_seconds: Histogram,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admission_reviews_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "appmesh_inject_admission_reviews",
            "Total number of admission reviews by outcome",
            admission_reviews_total.clone(),
        );

        let admission_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "appmesh_inject_admission_duration_seconds",
            "Duration of admission review handling in seconds",
            admission_duration_seconds.clone(),
        );

        Self {
            admission_reviews_total,
            admission_duration_seconds,
            registry,
        }
    }

    /// Record one answered admission review
    pub fn record_admission(&self, outcome: AdmissionOutcome, duration_secs: f64) {
        self.admission_reviews_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
        self.admission_duration_seconds.observe(duration_secs);
    }

    /// Count of reviews answered with the given outcome
    pub fn admissions(&self, outcome: AdmissionOutcome) -> u64 {
        self.admission_reviews_total
            .get_or_create(&OutcomeLabels { outcome })
            .get()
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health endpoints
pub struct HealthState {
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, HEALTHY_BODY)
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health router, merged into the webhook router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", any(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
