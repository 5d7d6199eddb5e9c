//! Job handlers, one per kind. All are idempotent keyed by the state they
//! touch: redelivering a job whose side-effects already landed converges on
//! the same final state.

use crate::error::{AppError, AppResult};
use crate::jobs::{Checkpoint, HandlerOutcome, Job, JobCtx, JobKind, JobProgress};
use crate::learning::LearningWritebacks;
use crate::matching::{score, MatchingEngine};
use crate::models::{parse_cents, LineItem, OcrStatus, ReimbursabilitySource};
use crate::ports::{BlobStore, Clock, EmbeddingProvider, OcrProvider};
use crate::resolver::{Question, QuestionKind, TieredResolver};
use crate::store::ExpenseStore;
use chrono::{Duration, NaiveDate};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct OcrExtractPayload {
    pub receipt_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CategorizePayload {
    pub user_id: Uuid,
    pub transaction_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MatchReceiptPayload {
    pub receipt_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct GenerateReportPayload {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct WarmCachePayload {
    #[serde(default = "default_warm_limit")]
    pub limit: usize,
}

fn default_warm_limit() -> usize {
    100
}

pub struct JobHandlers {
    store: Arc<ExpenseStore>,
    blob: Arc<dyn BlobStore>,
    ocr: Arc<dyn OcrProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    resolver: Arc<TieredResolver>,
    matching: Arc<MatchingEngine>,
    learning: Arc<LearningWritebacks>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    reference_data_url: Option<String>,
    /// Advisory lock: at most one matching job in flight per receipt.
    matching_in_flight: Mutex<HashSet<Uuid>>,
}

impl JobHandlers {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ExpenseStore>,
        blob: Arc<dyn BlobStore>,
        ocr: Arc<dyn OcrProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        resolver: Arc<TieredResolver>,
        matching: Arc<MatchingEngine>,
        learning: Arc<LearningWritebacks>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
        reference_data_url: Option<String>,
    ) -> Self {
        Self {
            store,
            blob,
            ocr,
            embedder,
            resolver,
            matching,
            learning,
            clock,
            http,
            reference_data_url,
            matching_in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(&self, job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        match job.kind {
            JobKind::OcrExtract => self.ocr_extract(job, ctx).await,
            JobKind::CategorizeTransaction => self.categorize(job, ctx).await,
            JobKind::MatchReceipt => self.match_receipt(job, ctx).await,
            JobKind::GenerateReport => self.generate_report(job, ctx).await,
            JobKind::SyncReferenceData => self.sync_reference_data(job, ctx).await,
            JobKind::WarmCache => self.warm_cache(job, ctx).await,
            JobKind::PurgeStaleEmbeddings => self.purge_stale_embeddings(job, ctx).await,
        }
    }

    // ------------------------------------------------------------------
    // ocr_extract
    // ------------------------------------------------------------------

    async fn ocr_extract(&self, job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        let payload: OcrExtractPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("bad payload: {e}")))?;
        let receipt = self.store.get_receipt(payload.receipt_id)?;

        // Redelivery after a successful run: nothing left to do.
        if receipt.ocr_status == OcrStatus::Extracted {
            return Ok(HandlerOutcome::Completed(None));
        }
        self.store.mark_receipt_processing(receipt.id)?;
        ctx.report_progress(JobProgress {
            total: 1,
            processed: 0,
            failed: 0,
        })?;

        let bytes = self.blob.get(&receipt.blob_ref).await?;
        if ctx.checkpoint()? == Checkpoint::CancelRequested {
            return Ok(HandlerOutcome::Cancelled);
        }

        let extraction = self.ocr.extract(&bytes, None).await?;

        let field = |name: &str| extraction.fields.get(name).map(|f| f.value.trim().to_string());
        let date = field("date").and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok());
        let amount_cents = field("amount").and_then(|a| parse_cents(&a));

        if date.is_none() || amount_cents.is_none() {
            warn!(receipt = %receipt.id, "OCR extraction missing amount or date");
            self.store.mark_receipt_ocr_failed(receipt.id)?;
            return Ok(HandlerOutcome::Completed(None));
        }

        // Vendor normalization flows through the tiered resolver; on provider
        // outage, present the raw extracted value and let matching cope.
        let vendor_raw = field("vendor").unwrap_or_default();
        let vendor = if vendor_raw.is_empty() {
            None
        } else {
            let question = Question {
                kind: QuestionKind::NormalizeVendor,
                user_id: payload.user_id,
                raw: vendor_raw.clone(),
                context: None,
            };
            match self.resolver.resolve(&question).await {
                Ok(resolution) => resolution.answer["vendor"]
                    .as_str()
                    .map(|s| s.to_string())
                    .or(Some(vendor_raw)),
                Err(AppError::ProviderUnavailable(msg)) => {
                    warn!(receipt = %receipt.id, %msg, "Vendor normalization degraded to raw value");
                    Some(vendor_raw)
                }
                Err(e) => return Err(e),
            }
        };

        let tax_cents = field("tax").and_then(|t| parse_cents(&t));
        let currency = field("currency").unwrap_or_else(|| "USD".to_string());
        let confidence: HashMap<String, f64> = extraction
            .fields
            .iter()
            .map(|(k, f)| (k.clone(), f.confidence))
            .collect();
        let line_items: Vec<LineItem> = extraction
            .line_items
            .iter()
            .map(|li| LineItem {
                description: li.description.clone(),
                quantity: li.quantity,
                unit_price_cents: parse_cents(&li.unit_price).unwrap_or(0),
            })
            .collect();

        self.store.apply_receipt_extraction(
            receipt.id,
            vendor.as_deref(),
            date,
            amount_cents,
            tax_cents,
            &currency,
            &confidence,
            &line_items,
        )?;
        ctx.report_progress(JobProgress {
            total: 1,
            processed: 1,
            failed: 0,
        })?;

        // Chain the matching pass.
        self.store.enqueue_job(
            JobKind::MatchReceipt,
            &json!({"receipt_id": receipt.id, "user_id": payload.user_id}),
            job.max_attempts,
            self.clock.now(),
        )?;
        info!(receipt = %receipt.id, "Receipt extracted");
        Ok(HandlerOutcome::Completed(None))
    }

    // ------------------------------------------------------------------
    // categorize_transaction
    // ------------------------------------------------------------------

    async fn categorize(&self, job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        let payload: CategorizePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("bad payload: {e}")))?;
        let total = payload.transaction_ids.len() as i64;
        let mut progress = JobProgress {
            total,
            ..Default::default()
        };
        ctx.report_progress(progress)?;

        let gl_codes = self.store.gl_codes_all()?;
        let chart: Vec<serde_json::Value> = gl_codes
            .iter()
            .map(|(code, desc)| json!({"code": code, "description": desc}))
            .collect();

        for tx_id in &payload.transaction_ids {
            if ctx.checkpoint()? == Checkpoint::CancelRequested {
                ctx.report_progress(progress)?;
                return Ok(HandlerOutcome::Cancelled);
            }

            match self.categorize_one(*tx_id, payload.user_id, &chart).await {
                Ok(()) => progress.processed += 1,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(transaction = %tx_id, error = %e, "Categorization failed for row");
                    progress.failed += 1;
                    progress.processed += 1;
                }
            }
            ctx.report_progress(progress)?;
        }
        Ok(HandlerOutcome::Completed(None))
    }

    async fn categorize_one(
        &self,
        tx_id: Uuid,
        user_id: Uuid,
        chart: &[serde_json::Value],
    ) -> AppResult<()> {
        let tx = self.store.get_transaction(tx_id)?;
        // Redelivered batch: skip rows a previous attempt already decided.
        if tx.category_code.is_some() {
            return Ok(());
        }

        let vendor_norm = score::normalize_vendor(&tx.merchant_raw);

        // Split patterns outrank the resolver: the user has told us exactly
        // how this vendor's charges allocate.
        if let Some(pattern) = self.store.split_pattern_get(user_id, &vendor_norm)? {
            let primary = pattern
                .allocations
                .iter()
                .max_by(|a, b| {
                    a.pct
                        .partial_cmp(&b.pct)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .ok_or_else(|| AppError::Validation("empty split pattern".to_string()))?;
            self.store.set_transaction_category(
                tx.id,
                tx.row_version,
                &primary.gl_code,
                ReimbursabilitySource::Override,
            )?;
            return Ok(());
        }

        let question = Question {
            kind: QuestionKind::SuggestGlCode,
            user_id,
            raw: vendor_norm,
            context: (!chart.is_empty()).then(|| json!({"chart_of_accounts": chart})),
        };
        let resolution = self.resolver.resolve(&question).await?;
        let gl_code = resolution.answer["gl_code"]
            .as_str()
            .ok_or_else(|| AppError::Validation("resolver answer missing gl_code".to_string()))?;
        self.store.set_transaction_category(
            tx.id,
            tx.row_version,
            gl_code,
            ReimbursabilitySource::Prediction,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // match_receipt
    // ------------------------------------------------------------------

    async fn match_receipt(&self, job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        let payload: MatchReceiptPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("bad payload: {e}")))?;

        {
            let mut in_flight = self.matching_in_flight.lock();
            if !in_flight.insert(payload.receipt_id) {
                return Err(AppError::Conflict(format!(
                    "matching already in flight for receipt {}",
                    payload.receipt_id
                )));
            }
        }
        let _guard = InFlightGuard {
            set: &self.matching_in_flight,
            id: payload.receipt_id,
        };

        if ctx.checkpoint()? == Checkpoint::CancelRequested {
            return Ok(HandlerOutcome::Cancelled);
        }
        let proposal = self.matching.run_for_receipt(payload.receipt_id)?;
        if let Some(p) = proposal
            .as_ref()
            .filter(|p| p.status == crate::models::ProposalStatus::Confirmed)
        {
            // Auto-confirmed: the confirmation writebacks still apply.
            self.learning.on_match_confirmed(p).await?;
        }
        ctx.report_progress(JobProgress {
            total: 1,
            processed: 1,
            failed: 0,
        })?;
        Ok(HandlerOutcome::Completed(
            proposal.map(|p| p.id.to_string()),
        ))
    }

    // ------------------------------------------------------------------
    // generate_report
    // ------------------------------------------------------------------

    async fn generate_report(&self, job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        let payload: GenerateReportPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| AppError::Validation(format!("bad payload: {e}")))?;

        let transactions = self.store.categorized_transactions(payload.user_id)?;
        let mut progress = JobProgress {
            total: transactions.len() as i64,
            ..Default::default()
        };
        ctx.report_progress(progress)?;
        if ctx.checkpoint()? == Checkpoint::CancelRequested {
            return Ok(HandlerOutcome::Cancelled);
        }

        let mut by_category: HashMap<String, i64> = HashMap::new();
        let mut total_cents = 0i64;
        for (i, tx) in transactions.iter().enumerate() {
            if i % 50 == 0 && ctx.checkpoint()? == Checkpoint::CancelRequested {
                ctx.report_progress(progress)?;
                return Ok(HandlerOutcome::Cancelled);
            }
            let code = tx.category_code.clone().unwrap_or_default();
            *by_category.entry(code).or_insert(0) += tx.amount_cents;
            total_cents += tx.amount_cents;
            progress.processed += 1;
        }
        ctx.report_progress(progress)?;
        if ctx.checkpoint()? == Checkpoint::CancelRequested {
            return Ok(HandlerOutcome::Cancelled);
        }

        let report = json!({
            "user_id": payload.user_id,
            "generated_at": self.clock.now().to_rfc3339(),
            "transactions": transactions.len(),
            "total_cents": total_cents,
            "by_category": by_category,
        });
        let key = format!("reports/{}/{}.json", payload.user_id, ctx.job_id);
        let blob_ref = self
            .blob
            .put(&key, report.to_string().as_bytes())
            .await?;
        Ok(HandlerOutcome::Completed(Some(blob_ref)))
    }

    // ------------------------------------------------------------------
    // sync_reference_data
    // ------------------------------------------------------------------

    async fn sync_reference_data(&self, _job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        let Some(url) = &self.reference_data_url else {
            info!("No reference data endpoint configured; skipping sync");
            return Ok(HandlerOutcome::Completed(None));
        };
        if ctx.checkpoint()? == Checkpoint::CancelRequested {
            return Ok(HandlerOutcome::Cancelled);
        }

        #[derive(Deserialize)]
        struct GlCodeRow {
            code: String,
            description: String,
        }
        let rows: Vec<GlCodeRow> = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("reference fetch: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("reference parse: {e}")))?;

        let codes: Vec<(String, String)> =
            rows.into_iter().map(|r| (r.code, r.description)).collect();
        let count = codes.len();
        self.store.gl_codes_replace(&codes, self.clock.now())?;
        info!(count, "Reference GL codes refreshed");
        Ok(HandlerOutcome::Completed(None))
    }

    // ------------------------------------------------------------------
    // warm_cache
    // ------------------------------------------------------------------

    async fn warm_cache(&self, job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        let payload: WarmCachePayload = serde_json::from_value(job.payload.clone())
            .unwrap_or(WarmCachePayload { limit: 100 });

        let entries = self.store.unseeded_cache_entries(payload.limit)?;
        let mut progress = JobProgress {
            total: entries.len() as i64,
            ..Default::default()
        };
        ctx.report_progress(progress)?;
        if entries.is_empty() {
            return Ok(HandlerOutcome::Completed(None));
        }

        for chunk in entries.chunks(32) {
            if ctx.checkpoint()? == Checkpoint::CancelRequested {
                ctx.report_progress(progress)?;
                return Ok(HandlerOutcome::Cancelled);
            }
            let texts: Vec<String> = chunk.iter().map(|(_, c, _)| c.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            let now = self.clock.now();
            for ((user_id, canonical, answer), vector) in chunk.iter().zip(vectors) {
                let embedding = crate::models::ExpenseEmbedding {
                    id: Uuid::new_v4(),
                    subject_kind: crate::models::SubjectKind::Description,
                    subject_text: canonical.clone(),
                    user_id: Some(*user_id),
                    vector,
                    category_code: None,
                    answer: answer.clone(),
                    verified_by_user: true,
                    verified_at: now,
                    stale_after: now + Duration::days(180),
                };
                if let Err(e) = self.store.embedding_insert(&embedding) {
                    warn!(error = %e, "Warm-cache embedding insert failed");
                    progress.failed += 1;
                }
                progress.processed += 1;
            }
            ctx.report_progress(progress)?;
        }
        info!(seeded = progress.processed, "Cache warm complete");
        Ok(HandlerOutcome::Completed(None))
    }

    // ------------------------------------------------------------------
    // purge_stale_embeddings
    // ------------------------------------------------------------------

    async fn purge_stale_embeddings(&self, _job: &Job, ctx: &JobCtx) -> AppResult<HandlerOutcome> {
        if ctx.checkpoint()? == Checkpoint::CancelRequested {
            return Ok(HandlerOutcome::Cancelled);
        }
        let purged = self.store.purge_stale_embeddings(self.clock.now())?;
        info!(purged, "Stale embeddings purged");
        ctx.report_progress(JobProgress {
            total: purged as i64,
            processed: purged as i64,
            failed: 0,
        })?;
        Ok(HandlerOutcome::Completed(None))
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}
