/// HTTP API for evidence receipts.
///
/// A thin layer over the pipeline and verifier:
/// - Intake and status of receipts, bundle download, re-drive
/// - Verification of hashes, stored bundles and uploaded bundles
/// - Live receipt updates over WebSocket
pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{EvidenceError, Result};
use crate::pipeline::ReceiptPipeline;
use crate::verify::Verifier;

/// Shared application state available to all handlers.
pub struct AppState {
    pub pipeline: ReceiptPipeline,
    pub verifier: Arc<Verifier>,
    /// Ledger endpoint reported by `/health`.
    pub rpc_url: Option<String>,
    pub contract_address: Option<String>,
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a domain error to an HTTP status and JSON body.
pub fn error_response(err: EvidenceError) -> ApiError {
    let status = match &err {
        EvidenceError::Validation(_) => StatusCode::BAD_REQUEST,
        EvidenceError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EvidenceError::NotFound(_) | EvidenceError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
        EvidenceError::Conflict(_) | EvidenceError::InvalidTransition(_) => StatusCode::CONFLICT,
        EvidenceError::Ledger(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::receipt_routes())
        .merge(routes::verify_routes())
        .merge(ws::ws_routes())
        .with_state(Arc::new(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the API server.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("evidence-anchor API listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
