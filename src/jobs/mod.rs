//! Durable background-job runtime.
//!
//! DB-backed queue with at-least-once delivery: workers claim jobs under a
//! lease, renew it while running, and either complete, release for retry
//! with exponential backoff, or fail. Cancellation is cooperative via
//! checkpoints. Handlers must be idempotent keyed by job id: redelivery
//! after a lease expiry is expected, not exceptional.

pub mod handlers;

use crate::error::{AppError, AppResult};
use crate::ports::Clock;
use crate::store::ExpenseStore;
use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use handlers::JobHandlers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    OcrExtract,
    CategorizeTransaction,
    MatchReceipt,
    GenerateReport,
    SyncReferenceData,
    WarmCache,
    PurgeStaleEmbeddings,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::OcrExtract => "ocr_extract",
            JobKind::CategorizeTransaction => "categorize_transaction",
            JobKind::MatchReceipt => "match_receipt",
            JobKind::GenerateReport => "generate_report",
            JobKind::SyncReferenceData => "sync_reference_data",
            JobKind::WarmCache => "warm_cache",
            JobKind::PurgeStaleEmbeddings => "purge_stale_embeddings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ocr_extract" => Some(Self::OcrExtract),
            "categorize_transaction" => Some(Self::CategorizeTransaction),
            "match_receipt" => Some(Self::MatchReceipt),
            "generate_report" => Some(Self::GenerateReport),
            "sync_reference_data" => Some(Self::SyncReferenceData),
            "warm_cache" => Some(Self::WarmCache),
            "purge_stale_embeddings" => Some(Self::PurgeStaleEmbeddings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    CancelRequested,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::CancelRequested => "cancel_requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "cancel_requested" => Some(Self::CancelRequested),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempt: i64,
    pub max_attempts: i64,
    pub next_visible_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub eta: Option<DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
}

/// Retry backoff: min(60s * 2^attempt, 1h).
pub fn backoff_secs(attempt: i64) -> i64 {
    let exp = attempt.clamp(0, 10) as u32;
    60i64.saturating_mul(1i64 << exp).min(3600)
}

/// What a handler reports back to the worker loop.
#[derive(Debug)]
pub enum HandlerOutcome {
    Completed(Option<String>),
    Cancelled,
}

/// Checkpoint verdict inside a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    CancelRequested,
}

/// Per-job context handed to handlers: lease renewal, cancellation polling,
/// and progress reporting.
pub struct JobCtx {
    store: Arc<ExpenseStore>,
    clock: Arc<dyn Clock>,
    pub job_id: Uuid,
    pub owner: String,
    lease_ttl_secs: i64,
    last_renewal: Mutex<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl JobCtx {
    fn new(
        store: Arc<ExpenseStore>,
        clock: Arc<dyn Clock>,
        job_id: Uuid,
        owner: String,
        lease_ttl_secs: i64,
    ) -> Self {
        let now = clock.now();
        Self {
            store,
            clock,
            job_id,
            owner,
            lease_ttl_secs,
            last_renewal: Mutex::new(now),
            started_at: now,
        }
    }

    /// Call between units of work and before every external-port call.
    /// Renews the lease when it is a third through its TTL and reports
    /// whether cancellation was requested.
    pub fn checkpoint(&self) -> AppResult<Checkpoint> {
        let now = self.clock.now();
        let renew_after = Duration::seconds((self.lease_ttl_secs / 3).max(1));
        {
            let mut last = self.last_renewal.lock();
            if now - *last >= renew_after {
                let renewed =
                    self.store
                        .renew_lease(self.job_id, &self.owner, now, self.lease_ttl_secs)?;
                if !renewed && !self.store.is_cancel_requested(self.job_id)? {
                    // Lease lost to another worker; abandon without touching state.
                    return Err(AppError::Conflict(format!(
                        "job {} lease lost by {}",
                        self.job_id, self.owner
                    )));
                }
                *last = now;
            }
        }
        if self.store.is_cancel_requested(self.job_id)? {
            return Ok(Checkpoint::CancelRequested);
        }
        Ok(Checkpoint::Continue)
    }

    /// Persist progress and derive an ETA from observed throughput.
    pub fn report_progress(&self, progress: JobProgress) -> AppResult<()> {
        let now = self.clock.now();
        let eta = if progress.processed > 0 && progress.total > progress.processed {
            let elapsed_ms = (now - self.started_at).num_milliseconds().max(1);
            let avg_per_unit_ms = elapsed_ms / progress.processed;
            let remaining = progress.total - progress.processed;
            Some(now + Duration::milliseconds(avg_per_unit_ms * remaining))
        } else {
            None
        };
        self.store.update_job_progress(self.job_id, progress, eta)
    }
}

/// A lane is a set of kinds sharing a concurrency cap.
#[derive(Debug, Clone)]
pub struct WorkerLane {
    pub name: &'static str,
    pub kinds: Vec<JobKind>,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct JobRuntimeConfig {
    pub lease_ttl_seconds: i64,
    pub max_attempts: i64,
    pub poll_interval_ms: u64,
    pub lanes: Vec<WorkerLane>,
}

impl JobRuntimeConfig {
    pub fn from_app_config(cfg: &crate::models::Config) -> Self {
        Self {
            lease_ttl_seconds: cfg.jobs_lease_ttl_seconds,
            max_attempts: cfg.jobs_max_attempts,
            poll_interval_ms: cfg.jobs_poll_interval_ms,
            lanes: vec![
                WorkerLane {
                    name: "ocr",
                    kinds: vec![JobKind::OcrExtract],
                    concurrency: cfg.concurrency_ocr,
                },
                WorkerLane {
                    name: "categorize",
                    kinds: vec![JobKind::CategorizeTransaction],
                    concurrency: cfg.concurrency_categorize,
                },
                WorkerLane {
                    name: "match",
                    kinds: vec![JobKind::MatchReceipt],
                    concurrency: cfg.concurrency_match,
                },
                WorkerLane {
                    name: "report",
                    kinds: vec![JobKind::GenerateReport],
                    concurrency: cfg.concurrency_report,
                },
                WorkerLane {
                    name: "maintenance",
                    kinds: vec![
                        JobKind::SyncReferenceData,
                        JobKind::WarmCache,
                        JobKind::PurgeStaleEmbeddings,
                    ],
                    concurrency: cfg.concurrency_maintenance,
                },
            ],
        }
    }
}

pub struct JobRuntime {
    store: Arc<ExpenseStore>,
    clock: Arc<dyn Clock>,
    handlers: Arc<JobHandlers>,
    cfg: JobRuntimeConfig,
}

impl JobRuntime {
    pub fn new(
        store: Arc<ExpenseStore>,
        clock: Arc<dyn Clock>,
        handlers: Arc<JobHandlers>,
        cfg: JobRuntimeConfig,
    ) -> Self {
        Self {
            store,
            clock,
            handlers,
            cfg,
        }
    }

    pub fn enqueue(&self, kind: JobKind, payload: &serde_json::Value) -> AppResult<Uuid> {
        self.store
            .enqueue_job(kind, payload, self.cfg.max_attempts, self.clock.now())
    }

    /// Spawn all worker lanes. Returns the task handles so the composition
    /// root can keep them alive.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for lane in self.cfg.lanes.clone() {
            for i in 0..lane.concurrency.max(1) {
                let runtime = Arc::clone(self);
                let kinds = lane.kinds.clone();
                let owner = format!("{}-{}-{}", lane.name, std::process::id(), i);
                handles.push(tokio::spawn(async move {
                    runtime.worker_loop(kinds, owner).await;
                }));
            }
        }
        info!(workers = handles.len(), "Job workers started");
        handles
    }

    async fn worker_loop(&self, kinds: Vec<JobKind>, owner: String) {
        loop {
            let claimed = self.store.claim_next_job(
                &kinds,
                &owner,
                self.clock.now(),
                self.cfg.lease_ttl_seconds,
            );
            match claimed {
                Ok(Some(job)) => {
                    self.run_job(job, &owner).await;
                }
                Ok(None) => {
                    // Small jitter so idle workers do not poll in lockstep.
                    let jitter = rand::random::<u64>() % 100;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.cfg.poll_interval_ms + jitter,
                    ))
                    .await;
                }
                Err(e) => {
                    warn!(worker = %owner, error = %e, "Job claim failed");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.cfg.poll_interval_ms,
                    ))
                    .await;
                }
            }
        }
    }

    /// Run one claimed job to a terminal or retriable state. Failures never
    /// escape this function; the worker loop survives everything.
    pub async fn run_job(&self, job: Job, owner: &str) {
        let ctx = JobCtx::new(
            self.store.clone(),
            self.clock.clone(),
            job.id,
            owner.to_string(),
            self.cfg.lease_ttl_seconds,
        );
        info!(job = %job.id, kind = job.kind.as_str(), attempt = job.attempt, "Job started");

        // Keep the lease alive across long provider calls; checkpoints alone
        // cannot renew while a handler is blocked on an external port.
        let renewer = {
            let store = self.store.clone();
            let clock = self.clock.clone();
            let job_id = job.id;
            let owner = owner.to_string();
            let ttl = self.cfg.lease_ttl_seconds;
            tokio::spawn(async move {
                let period = std::time::Duration::from_secs((ttl / 3).max(1) as u64);
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match store.renew_lease(job_id, &owner, clock.now(), ttl) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => warn!(job = %job_id, error = %e, "Lease renewal failed"),
                    }
                }
            })
        };

        let outcome = AssertUnwindSafe(self.handlers.run(&job, &ctx))
            .catch_unwind()
            .await;
        renewer.abort();

        match outcome {
            Ok(Ok(HandlerOutcome::Completed(result_ref))) => {
                if let Err(e) = self
                    .store
                    .complete_job(job.id, owner, result_ref.as_deref())
                {
                    warn!(job = %job.id, error = %e, "Completion write failed");
                } else {
                    metrics::counter!("jobs_completed_total", 1, "kind" => job.kind.as_str());
                    info!(job = %job.id, "Job succeeded");
                }
            }
            Ok(Ok(HandlerOutcome::Cancelled)) => {
                if let Err(e) = self.store.mark_job_cancelled(job.id, owner) {
                    warn!(job = %job.id, error = %e, "Cancel write failed");
                } else {
                    info!(job = %job.id, "Job cancelled at checkpoint");
                }
            }
            Ok(Err(e)) => self.handle_failure(&job, owner, e),
            Err(_panic) => {
                error!(job = %job.id, kind = job.kind.as_str(), "Job handler panicked");
                self.handle_failure(
                    &job,
                    owner,
                    AppError::Internal(anyhow::anyhow!("handler panicked")),
                );
            }
        }
    }

    fn handle_failure(&self, job: &Job, owner: &str, e: AppError) {
        // Uncaught internals count as transient for the first two attempts,
        // then become fatal.
        let retry = match &e {
            AppError::ProviderTransient(_)
            | AppError::ProviderUnavailable(_)
            | AppError::Conflict(_) => true,
            AppError::Internal(_) => job.attempt <= 2,
            AppError::Validation(_) | AppError::NotFound(_) | AppError::UnrecognizedFormat(_) => {
                false
            }
        };
        metrics::counter!("jobs_failed_total", 1, "kind" => job.kind.as_str());

        if retry {
            let backoff = backoff_secs(job.attempt);
            match self.store.release_job_for_retry(
                job.id,
                owner,
                self.clock.now(),
                backoff,
                &e.to_string(),
            ) {
                Ok(JobStatus::Pending) => {
                    warn!(job = %job.id, backoff_secs = backoff, error = %e, "Job released for retry")
                }
                Ok(_) => warn!(job = %job.id, error = %e, "Job failed after max attempts"),
                Err(we) => warn!(job = %job.id, error = %we, "Retry release failed"),
            }
        } else {
            warn!(job = %job.id, error = %e, "Job failed permanently");
            if let Err(we) = self.store.fail_job(job.id, owner, &e.to_string()) {
                warn!(job = %job.id, error = %we, "Failure write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_secs(0), 60);
        assert_eq!(backoff_secs(1), 120);
        assert_eq!(backoff_secs(2), 240);
        assert_eq!(backoff_secs(5), 1920);
        assert_eq!(backoff_secs(6), 3600);
        assert_eq!(backoff_secs(50), 3600);
    }

    #[test]
    fn kind_round_trip() {
        for kind in [
            JobKind::OcrExtract,
            JobKind::CategorizeTransaction,
            JobKind::MatchReceipt,
            JobKind::GenerateReport,
            JobKind::SyncReferenceData,
            JobKind::WarmCache,
            JobKind::PurgeStaleEmbeddings,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("nope"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::CancelRequested.is_terminal());
    }
}
