//! Mutating admission webhook server.
//!
//! `POST /` receives a pod AdmissionReview and answers with an
//! AdmissionReview that carries the injection patch when the pod wants the
//! proxy. Every answer is HTTP 200 except a wrong content type, which is
//! rejected with 415 before the body is read.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::health::{self, AdmissionOutcome, HealthState};
use crate::patch::build_patch;
use crate::pod::PodDescriptor;
use crate::webhooks::annotations::{injection_enabled, resolve};
use crate::webhooks::owner::ReplicaSetLookup;

/// Body returned for a request that is not JSON
pub const WRONG_CONTENT_TYPE_BODY: &str = "415 - Wrong Content Type";

/// Shared state for webhook handlers
pub struct WebhookState {
    pub config: Arc<ServerConfig>,
    pub owners: Arc<dyn ReplicaSetLookup>,
    pub health: Arc<HealthState>,
}

impl WebhookState {
    pub fn new(
        config: Arc<ServerConfig>,
        owners: Arc<dyn ReplicaSetLookup>,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            config,
            owners,
            health,
        }
    }
}

/// Create the webhook router, health endpoints included
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    let health = state.health.clone();
    Router::new()
        .route("/", post(inject))
        .with_state(state)
        .merge(health::create_router(health))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
}

async fn inject(State(state): State<Arc<WebhookState>>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();

    if !is_json(&headers) {
        warn!(content_type = ?headers.get(CONTENT_TYPE), "Rejecting request with wrong content type");
        state
            .health
            .metrics
            .record_admission(AdmissionOutcome::Invalid, start.elapsed().as_secs_f64());
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, WRONG_CONTENT_TYPE_BODY).into_response();
    }

    let (outcome, review) = admit(&state, &body).await;
    state
        .health
        .metrics
        .record_admission(outcome, start.elapsed().as_secs_f64());
    (StatusCode::OK, Json(review)).into_response()
}

/// Decode the review and check it carries a request with a UID
fn decode(body: &[u8]) -> Result<AdmissionRequest<DynamicObject>> {
    let review: AdmissionReview<DynamicObject> =
        serde_json::from_slice(body).map_err(Error::Decode)?;
    let request: AdmissionRequest<DynamicObject> =
        review.try_into().map_err(|_| Error::NoObject)?;
    if request.uid.is_empty() {
        return Err(Error::NoUid);
    }
    Ok(request)
}

async fn admit(
    state: &WebhookState,
    body: &[u8],
) -> (AdmissionOutcome, AdmissionReview<DynamicObject>) {
    let request = match decode(body) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Invalid admission review");
            return (
                AdmissionOutcome::Invalid,
                AdmissionResponse::invalid(e.to_string()).into_review(),
            );
        }
    };

    let uid = request.uid.as_str();
    debug!(
        uid = %uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );

    let response = AdmissionResponse::from(&request);
    match mutate(state, &request).await {
        Ok(Some(patch)) => match response.with_patch(patch) {
            Ok(response) => {
                info!(uid = %uid, "Admission request patched");
                (AdmissionOutcome::Patched, response.into_review())
            }
            Err(e) => {
                let e = Error::from(e);
                error!(uid = %uid, error = %e, "Admission request denied");
                (
                    AdmissionOutcome::Denied,
                    AdmissionResponse::from(&request)
                        .deny(e.to_string())
                        .into_review(),
                )
            }
        },
        Ok(None) => (AdmissionOutcome::Skipped, response.into_review()),
        Err(e) => {
            error!(uid = %uid, error = %e, "Admission request denied");
            (
                AdmissionOutcome::Denied,
                response.deny(e.to_string()).into_review(),
            )
        }
    }
}

/// Work out the injection patch for the pod in the request.
///
/// `Ok(None)` admits the pod unchanged.
async fn mutate(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<Option<Patch>> {
    let object = request.object.clone().ok_or(Error::NoObject)?;
    let pod: Pod = object
        .try_parse()
        .map_err(|e| Error::PodDecode(e.to_string()))?;
    let pod = PodDescriptor::from_pod(&pod, request.namespace.as_deref());

    if !injection_enabled(&pod, state.config.inject_default) {
        info!(
            uid = %request.uid,
            pod = %pod.name,
            namespace = %pod.namespace,
            "Injection disabled for pod"
        );
        return Ok(None);
    }

    let meta = match resolve(&state.config, &pod, state.owners.as_ref()).await {
        Ok(meta) => meta,
        Err(e) if e.is_skip() => {
            info!(
                uid = %request.uid,
                pod = %pod.name,
                namespace = %pod.namespace,
                reason = %e,
                "Skipping injection"
            );
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let patch = build_patch(&meta)?;
    debug!(uid = %request.uid, patch = ?patch, "Rendered patch");
    Ok(Some(patch))
}

/// Serve the webhook until `handle` is told to shut down.
///
/// Uses TLS from the configured cert and key files, or plain HTTP in dev
/// mode.
pub async fn run_webhook_server(state: Arc<WebhookState>, handle: Handle) -> Result<()> {
    let config = state.config.clone();
    let app = create_webhook_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if config.dev {
        info!(port = config.port, "Webhook server listening without TLS");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| Error::Server(e.to_string()))?;
        return Ok(());
    }

    let tls = RustlsConfig::from_pem_file(&config.tls_cert, &config.tls_key)
        .await
        .map_err(|e| Error::TlsConfig(e.to_string()))?;

    info!(port = config.port, "Webhook server listening with TLS");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::Server(e.to_string()))?;

    Ok(())
}
