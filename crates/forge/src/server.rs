//! HTTP surface.
//!
//! Provides endpoints for:
//! - Payment provider webhooks
//! - Status callbacks from training pods
//! - Job submission, status, cancellation and payment renewal
//! - Health and readiness checks

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use forge_gpu::PodStatus;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::OrchestratorError;
use crate::model::{JobId, JobStatus, JobView, OwnerId};
use crate::orchestrator::{Orchestrator, PaymentOutcome, ProvisionOutcome};
use crate::training::SubmitJob;

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "Forge-Signature";
/// Header carrying the authenticated owner, set by the upstream auth layer.
pub const OWNER_HEADER: &str = "X-Forge-Owner";

/// Server state shared across handlers.
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/webhooks/payments", post(payment_webhook_handler))
        .route("/callbacks/pods/{job_id}", post(pod_callback_handler))
        .route("/api/jobs", post(submit_handler).get(list_handler))
        .route("/api/jobs/{job_id}", get(job_handler))
        .route("/api/jobs/{job_id}/cancel", post(cancel_handler))
        .route("/api/jobs/{job_id}/payment", post(renew_payment_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and serve until `shutdown` turns true.
///
/// # Errors
///
/// Returns an error if the server fails to bind to the address.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Forge server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Handler error mapped to an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    Orchestrator(OrchestratorError),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::Orchestrator(err)
    }
}

impl From<forge_payments::SignatureError> for ApiError {
    fn from(err: forge_payments::SignatureError) -> Self {
        Self::Orchestrator(err.into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message.to_string()),
            Self::Orchestrator(err) => {
                let status = match &err {
                    OrchestratorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                    OrchestratorError::StaleStateConflict { .. }
                    | OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
                    OrchestratorError::Signature(_) => StatusCode::BAD_REQUEST,
                    OrchestratorError::Payment(_)
                    | OrchestratorError::Provider(_)
                    | OrchestratorError::Transient(_)
                    | OrchestratorError::Capacity(_)
                    | OrchestratorError::Teardown { .. } => StatusCode::BAD_GATEWAY,
                    OrchestratorError::Invariant(_)
                    | OrchestratorError::Store(_)
                    | OrchestratorError::Artifact(_) => {
                        error!(error = %err, "Internal error");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn owner(headers: &HeaderMap) -> ApiResult<OwnerId> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(OwnerId::from)
        .ok_or(ApiError::Unauthorized("missing owner"))
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Webhook acknowledgement.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// `processed`, `duplicate` or `ignored`.
    pub status: String,
}

/// Status report posted by a training pod.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackRequest {
    #[serde(default)]
    pub pod_id: Option<String>,
    pub status: PodStatus,
}

/// Job state after a callback.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn ready_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.orchestrator.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Store not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                }),
            )
        }
    }
}

async fn payment_webhook_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let event = state
        .orchestrator
        .gateway()
        .verify_webhook(&body, signature)
        .inspect_err(|e| warn!(error = %e, "Rejected webhook"))?;

    let outcome = state
        .orchestrator
        .handle_payment_event(&event, Utc::now())
        .await?;

    let status = match outcome {
        PaymentOutcome::Processed { job_id, provision } => {
            if provision {
                spawn_provisioning(Arc::clone(&state.orchestrator), job_id);
            }
            "processed"
        }
        PaymentOutcome::Duplicate => "duplicate",
        PaymentOutcome::Ignored => "ignored",
    };
    Ok(Json(WebhookResponse {
        status: status.to_string(),
    }))
}

/// Allocate in the background so the webhook is acknowledged promptly.
/// Failures are picked up by reconciliation.
fn spawn_provisioning(orchestrator: Arc<Orchestrator>, job_id: JobId) {
    tokio::spawn(async move {
        match orchestrator.provision(job_id, Utc::now()).await {
            Ok(ProvisionOutcome::Exhausted(reason)) => {
                warn!(job_id = %job_id, reason = %reason, "Provisioning exhausted");
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Provisioning deferred to reconciliation"),
        }
    });
}

async fn pod_callback_handler(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
    Json(request): Json<CallbackRequest>,
) -> ApiResult<Json<CallbackResponse>> {
    let Some(expected) = state.config.callback_token.as_deref() else {
        return Err(ApiError::Unauthorized("callbacks are disabled"));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if !presented.is_some_and(|token| token_matches(token, expected)) {
        return Err(ApiError::Unauthorized("invalid callback token"));
    }

    let record = state
        .orchestrator
        .apply_pod_status(job_id, request.pod_id.as_deref(), request.status, Utc::now())
        .await?;

    Ok(Json(CallbackResponse {
        job_id,
        status: record.job.status,
    }))
}

/// Compare a presented bearer token without leaking where it differs.
fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

async fn submit_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<SubmitJob>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let owner = owner(&headers)?;
    let view = state.orchestrator.submit(owner, request, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<JobView>>> {
    let owner = owner(&headers)?;
    Ok(Json(state.orchestrator.jobs(&owner).await?))
}

async fn job_handler(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
) -> ApiResult<Json<JobView>> {
    let owner = owner(&headers)?;
    Ok(Json(state.orchestrator.job(job_id, &owner).await?))
}

async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
) -> ApiResult<Json<JobView>> {
    let owner = owner(&headers)?;
    Ok(Json(
        state.orchestrator.cancel(job_id, &owner, Utc::now()).await?,
    ))
}

async fn renew_payment_handler(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<JobId>,
    headers: HeaderMap,
) -> ApiResult<Json<JobView>> {
    let owner = owner(&headers)?;
    Ok(Json(
        state
            .orchestrator
            .renew_payment(job_id, &owner, Utc::now())
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                OrchestratorError::Validation("bad".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (OrchestratorError::NotFound(JobId::new()), StatusCode::NOT_FOUND),
            (
                OrchestratorError::StaleStateConflict { job_id: JobId::new() },
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::Signature(forge_payments::SignatureError::Mismatch),
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::Teardown {
                    pod_id: "pod".into(),
                    message: "timeout".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("cb-token", "cb-token"));
        assert!(!token_matches("cb-toke", "cb-token"));
        assert!(!token_matches("cb-token-and-more", "cb-token"));
        assert!(!token_matches("CB-TOKEN", "cb-token"));
        assert!(!token_matches("", ""));
    }

    #[test]
    fn test_owner_header_is_required() {
        let mut headers = HeaderMap::new();
        assert!(owner(&headers).is_err());
        headers.insert(OWNER_HEADER, " ".parse().unwrap());
        assert!(owner(&headers).is_err());
        headers.insert(OWNER_HEADER, "alice".parse().unwrap());
        assert_eq!(owner(&headers).unwrap(), OwnerId::from("alice"));
    }
}
