//! Route handlers. Thin: validate, call the engine, translate errors.
//! Anything expensive is enqueued, never run inline.

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::jobs::JobKind;
use crate::matching::ScoredCandidate;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ============================================================================
// Receipts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub user_id: Uuid,
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReceiptUploadResponse {
    pub receipt_id: Uuid,
    pub job_id: Uuid,
}

pub async fn upload_receipt(
    State(state): State<AppState>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    if body.is_empty() {
        return Err(AppError::Validation("empty upload".to_string()));
    }

    let key = q.filename.clone().unwrap_or_else(|| "receipt".to_string());
    let blob_ref = state.blob.put(&key, &body).await?;

    let receipt_id = Uuid::new_v4();
    state
        .store
        .insert_receipt(receipt_id, q.user_id, &blob_ref, state.clock.now())?;
    let job_id = state.runtime.enqueue(
        JobKind::OcrExtract,
        &json!({"receipt_id": receipt_id, "user_id": q.user_id}),
    )?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ReceiptUploadResponse { receipt_id, job_id }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CorrectionRequest {
    pub user_id: Uuid,
    pub field: String,
    pub original: String,
    pub corrected: String,
}

/// User fix of an extracted field: recorded append-only and written back
/// into the exact cache so the corrected value wins next time.
pub async fn correct_extraction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CorrectionRequest>,
) -> AppResult<impl IntoResponse> {
    // 404 for unknown receipts before recording anything.
    state.store.get_receipt(id)?;
    state.learning.on_extraction_corrected(
        id,
        req.user_id,
        &req.field,
        &req.original,
        &req.corrected,
    )?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Statements
// ============================================================================

pub async fn upload_statement(
    State(state): State<AppState>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    if body.is_empty() {
        return Err(AppError::Validation("empty upload".to_string()));
    }
    let outcome = state
        .importer
        .import(q.user_id, q.filename.as_deref(), &body)
        .await?;

    let status = if outcome.imported > 0 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

pub async fn confirm_fingerprint(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.store.fingerprint_set_verified(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Matching
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RunMatchingQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct RunMatchingResponse {
    pub proposals_created: usize,
}

pub async fn run_matching(
    State(state): State<AppState>,
    Query(q): Query<RunMatchingQuery>,
) -> AppResult<Json<RunMatchingResponse>> {
    let proposals_created = state.matching.run_for_user(q.user_id)?;
    Ok(Json(RunMatchingResponse { proposals_created }))
}

#[derive(Debug, Serialize)]
pub struct ProposalsResponse {
    pub candidates: Vec<ScoredCandidate>,
}

pub async fn get_proposals(
    State(state): State<AppState>,
    Path(receipt_id): Path<Uuid>,
) -> AppResult<Json<ProposalsResponse>> {
    let receipt = state.store.get_receipt(receipt_id)?;
    let candidates = state.matching.candidates_for_receipt(&receipt)?;
    Ok(Json(ProposalsResponse { candidates }))
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionedBody {
    pub row_version: Option<i64>,
}

pub async fn confirm_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<VersionedBody>>,
) -> AppResult<impl IntoResponse> {
    let expected = body.and_then(|Json(b)| b.row_version);
    let confirmed = state.matching.confirm(id, expected)?;
    state.learning.on_match_confirmed(&confirmed).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reject_proposal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<VersionedBody>>,
) -> AppResult<impl IntoResponse> {
    let expected = body.and_then(|Json(b)| b.row_version);
    state.matching.reject(id, expected)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ManualMatchResponse {
    pub proposal_id: Uuid,
}

pub async fn manual_match(
    State(state): State<AppState>,
    Json(req): Json<ManualMatchRequest>,
) -> AppResult<Json<ManualMatchResponse>> {
    let confirmed =
        state
            .matching
            .manual_match(req.receipt_id, req.transaction_id, req.group_id)?;
    state.learning.on_match_confirmed(&confirmed).await?;
    Ok(Json(ManualMatchResponse {
        proposal_id: confirmed.id,
    }))
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(req): Json<EnqueueJobRequest>,
) -> AppResult<impl IntoResponse> {
    let kind = JobKind::parse(&req.kind)
        .ok_or_else(|| AppError::Validation(format!("unknown job kind: {}", req.kind)))?;
    let job_id = state.runtime.enqueue(kind, &req.payload)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))))
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub kind: &'static str,
    pub status: &'static str,
    pub attempt: i64,
    pub progress: crate::jobs::JobProgress,
    pub eta: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobResponse>> {
    let job = state.store.get_job(id)?;
    Ok(Json(JobResponse {
        id: job.id,
        kind: job.kind.as_str(),
        status: job.status.as_str(),
        attempt: job.attempt,
        progress: job.progress,
        eta: job.eta.map(|t| t.to_rfc3339()),
        result_ref: job.result_ref,
        error: job.error,
    }))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    state.store.request_job_cancel(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Resolver observability
// ============================================================================

pub async fn resolver_stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let now = state.clock.now();
    let month_start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let rows = state.store.resolver_stats_since(month_start)?;
    let total_cost: f64 = rows.iter().map(|r| r.cost_units).sum();
    Ok(Json(json!({
        "since": month_start.to_rfc3339(),
        "tiers": rows,
        "total_cost_units": total_cost,
    })))
}
