//! HTTP API surface.

pub mod routes;

use crate::ingest::StatementImporter;
use crate::jobs::JobRuntime;
use crate::learning::LearningWritebacks;
use crate::matching::MatchingEngine;
use crate::ports::{BlobStore, Clock};
use crate::store::ExpenseStore;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ExpenseStore>,
    pub blob: Arc<dyn BlobStore>,
    pub importer: Arc<StatementImporter>,
    pub matching: Arc<MatchingEngine>,
    pub learning: Arc<LearningWritebacks>,
    pub runtime: Arc<JobRuntime>,
    pub clock: Arc<dyn Clock>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/receipts/upload", post(routes::upload_receipt))
        .route(
            "/receipts/:id/corrections",
            post(routes::correct_extraction),
        )
        .route("/statements/upload", post(routes::upload_statement))
        .route("/matching/run", post(routes::run_matching))
        .route("/matching/proposals/:id", get(routes::get_proposals))
        .route(
            "/matching/proposals/:id/confirm",
            post(routes::confirm_proposal),
        )
        .route(
            "/matching/proposals/:id/reject",
            post(routes::reject_proposal),
        )
        .route("/matching/manual", post(routes::manual_match))
        .route("/jobs", post(routes::enqueue_job))
        .route("/jobs/:id", get(routes::get_job))
        .route("/jobs/:id/cancel", post(routes::cancel_job))
        .route(
            "/fingerprints/:id/confirm",
            post(routes::confirm_fingerprint),
        )
        .route("/resolver/stats", get(routes::resolver_stats))
        .with_state(state)
}
