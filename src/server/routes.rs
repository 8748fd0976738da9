/// REST routes for receipts and verification.
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{error_response, ApiError, AppState};
use crate::crypto::hash::ContentHash;
use crate::error::EvidenceError;
use crate::state::models::{ReceiptSnapshot, ReceiptStatus, TransferFacts};
use crate::verify::VerifyOutcome;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

// ─── Health ──────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    rpc_url: Option<String>,
    contract_address: Option<String>,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        rpc_url: state.rpc_url.clone(),
        contract_address: state.contract_address.clone(),
    })
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ─── Receipts ────────────────────────────────────────────

/// Amounts must arrive as decimal strings. A JSON number has already been
/// rounded to a float by the parser and is refused.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AmountInput {
    Text(String),
    Number(serde_json::Number),
}

impl AmountInput {
    fn into_string(self) -> Result<String, EvidenceError> {
        match self {
            AmountInput::Text(s) => Ok(s),
            AmountInput::Number(n) => Err(EvidenceError::Validation(format!(
                "amount must be a decimal string, not a JSON number ({n})"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntakeRequest {
    reference: String,
    chain: String,
    source_tx_hash: String,
    amount: AmountInput,
    currency: String,
    sender: String,
    receiver: String,
    #[serde(default)]
    callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct IntakeResponse {
    id: Uuid,
    status: ReceiptStatus,
    reference: String,
    created: bool,
}

/// POST /v1/receipts: Register a transfer. 202 when created, 200 with the
/// existing receipt for a repeated reference.
async fn create_receipt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IntakeRequest>,
) -> Result<(StatusCode, Json<IntakeResponse>), ApiError> {
    let amount = req.amount.into_string().map_err(error_response)?;
    let facts = TransferFacts {
        reference: req.reference,
        chain: req.chain,
        source_tx_hash: req.source_tx_hash,
        amount,
        currency: req.currency,
        sender: req.sender,
        receiver: req.receiver,
    };

    let intake = state
        .pipeline
        .intake(facts, req.callback_url)
        .await
        .map_err(error_response)?;

    let status = if intake.is_created() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    let created = intake.is_created();
    let receipt = intake.into_receipt();
    Ok((
        status,
        Json(IntakeResponse {
            id: receipt.id,
            status: receipt.status,
            reference: receipt.facts.reference,
            created,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

/// GET /v1/receipts: Most recent receipts first.
async fn list_receipts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ReceiptSnapshot>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let receipts = state
        .pipeline
        .list_recent(limit)
        .await
        .map_err(error_response)?;
    Ok(Json(receipts.iter().map(|r| r.snapshot()).collect()))
}

/// GET /v1/receipts/{id}
async fn get_receipt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReceiptSnapshot>, ApiError> {
    let receipt = state.pipeline.get(id).await.map_err(error_response)?;
    Ok(Json(receipt.snapshot()))
}

/// GET /v1/receipts/{id}/bundle: Raw evidence bundle.
async fn get_bundle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.pipeline.bundle(id).await.map_err(error_response)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"evidence-{id}.bundle\""),
            ),
        ],
        bytes,
    ))
}

/// POST /v1/receipts/{id}/retry: Re-drive a failed receipt.
async fn retry_receipt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<ReceiptSnapshot>), ApiError> {
    let receipt = state.pipeline.retry(id).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(receipt.snapshot())))
}

pub fn receipt_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/receipts", post(create_receipt).get(list_receipts))
        .route("/v1/receipts/{id}", get(get_receipt))
        .route("/v1/receipts/{id}/bundle", get(get_bundle))
        .route("/v1/receipts/{id}/retry", post(retry_receipt))
}

// ─── Verification ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    bundle_ref: Option<String>,
}

/// POST /v1/verify: Exactly one of `content_hash` or `bundle_ref`.
async fn verify(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerifyOutcome>, ApiError> {
    let outcome = match (req.content_hash, req.bundle_ref) {
        (Some(hash), None) => {
            let hash = ContentHash::parse(&hash).map_err(error_response)?;
            state.verifier.verify_hash(&hash).await
        }
        (None, Some(reference)) => state
            .verifier
            .verify_reference(&reference)
            .await
            .map_err(error_response)?,
        _ => {
            return Err(error_response(EvidenceError::Validation(
                "provide exactly one of content_hash or bundle_ref".into(),
            )))
        }
    };
    Ok(Json(outcome))
}

/// POST /v1/verify/bundle: Verify uploaded bundle bytes.
async fn verify_bundle(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<VerifyOutcome>, ApiError> {
    if body.is_empty() {
        return Err(error_response(EvidenceError::Validation("empty bundle".into())));
    }
    let outcome = state
        .verifier
        .verify_bundle(&body)
        .await
        .map_err(error_response)?;
    Ok(Json(outcome))
}

pub fn verify_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/verify", post(verify))
        .route("/v1/verify/bundle", post(verify_bundle))
}
