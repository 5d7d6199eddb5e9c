//! End-to-end pipeline tests over fake ports and a temp database:
//! statement import, receipt OCR with retry, tiered resolution with
//! writeback, matching, confirmation, and job cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use expensebot_backend::{
    error::AppError,
    ingest::StatementImporter,
    jobs::{JobHandlers, JobKind, JobRuntime, JobRuntimeConfig, JobStatus, WorkerLane},
    learning::LearningWritebacks,
    matching::{MatchingConfig, MatchingEngine},
    models::{MatchStatus, OcrStatus, ProposalStatus},
    ports::{BlobStore, Clock, FakeEmbedding, FakeLlm, FakeOcr, MemoryBlobStore, SimClock},
    resolver::{Question, QuestionKind, ResolverConfig, Tier, TieredResolver},
    store::ExpenseStore,
};

struct World {
    store: Arc<ExpenseStore>,
    clock: Arc<SimClock>,
    blob: MemoryBlobStore,
    embedder: Arc<FakeEmbedding>,
    resolver: Arc<TieredResolver>,
    matching: Arc<MatchingEngine>,
    learning: Arc<LearningWritebacks>,
    importer: StatementImporter,
    runtime: Arc<JobRuntime>,
    _db_dir: tempfile::TempDir,
}

fn build_world(llm: FakeLlm, ocr: FakeOcr) -> World {
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("pipeline.db");
    let store = Arc::new(ExpenseStore::open(db_path.to_str().unwrap()).unwrap());
    let clock = Arc::new(SimClock::from_unix_secs(1_770_000_000));
    let blob = MemoryBlobStore::new();
    let embedder = Arc::new(FakeEmbedding::new(64));
    let llm = Arc::new(llm);

    let resolver = Arc::new(TieredResolver::new(
        store.clone(),
        embedder.clone(),
        llm,
        clock.clone(),
        ResolverConfig::default(),
    ));
    let matching = Arc::new(MatchingEngine::new(
        store.clone(),
        clock.clone(),
        MatchingConfig::default(),
    ));
    let learning = Arc::new(LearningWritebacks::new(
        store.clone(),
        embedder.clone(),
        clock.clone(),
    ));
    let importer = StatementImporter::new(store.clone(), resolver.clone(), clock.clone());

    let handlers = Arc::new(JobHandlers::new(
        store.clone(),
        Arc::new(blob.clone()),
        Arc::new(ocr),
        embedder.clone(),
        resolver.clone(),
        matching.clone(),
        learning.clone(),
        clock.clone(),
        reqwest::Client::new(),
        None,
    ));
    let runtime = Arc::new(JobRuntime::new(
        store.clone(),
        clock.clone(),
        handlers,
        JobRuntimeConfig {
            lease_ttl_seconds: 90,
            max_attempts: 5,
            poll_interval_ms: 10,
            lanes: vec![WorkerLane {
                name: "test",
                kinds: all_kinds(),
                concurrency: 1,
            }],
        },
    ));

    World {
        store,
        clock,
        blob,
        embedder,
        resolver,
        matching,
        learning,
        importer,
        runtime,
        _db_dir: db_dir,
    }
}

fn all_kinds() -> Vec<JobKind> {
    vec![
        JobKind::OcrExtract,
        JobKind::CategorizeTransaction,
        JobKind::MatchReceipt,
        JobKind::GenerateReport,
        JobKind::SyncReferenceData,
        JobKind::WarmCache,
        JobKind::PurgeStaleEmbeddings,
    ]
}

/// Drain the queue: claim and run jobs until none are visible.
async fn pump(world: &World) {
    loop {
        let claimed = world
            .store
            .claim_next_job(&all_kinds(), "test-worker", world.clock.now(), 90)
            .unwrap();
        match claimed {
            Some(job) => world.runtime.run_job(job, "test-worker").await,
            None => break,
        }
    }
}

const MAPPING_ANSWER: &str = r#"{
    "date_idx": 0, "description_idx": 1, "amount_idx": 2,
    "sign_convention": "debits_negative", "date_locale": "iso",
    "confidence": 0.93
}"#;

const STATEMENT_CSV: &str = "Post Date,Description,Amount\n\
    2026-01-02,STARBUCKS #1234,-4.75\n\
    2026-01-03,Amazon Mktplace*AB12,-19.99\n\
    2026-01-03,Amazon Mktplace*AB12,-19.99\n";

fn mapping_value() -> serde_json::Value {
    serde_json::from_str(MAPPING_ANSWER).unwrap()
}

// ---------------------------------------------------------------------------
// S1: idempotent statement import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn statement_import_is_idempotent() {
    let llm = FakeLlm::scripted(vec![Ok(mapping_value())]);
    let world = build_world(llm, FakeOcr::with_result(FakeOcr::sample()));
    let user = Uuid::new_v4();

    let first = world
        .importer
        .import(user, Some("jan.csv"), STATEMENT_CSV.as_bytes())
        .await
        .unwrap();
    assert_eq!(first.imported, 2);
    assert_eq!(first.duplicates, 1);
    assert!(first.needs_mapping_confirmation);

    // Exact same bytes again: fingerprint cache answers, zero new rows.
    let second = world
        .importer
        .import(user, Some("jan.csv"), STATEMENT_CSV.as_bytes())
        .await
        .unwrap();
    assert_eq!(second.imported, 0);
    assert_eq!(second.duplicates, 3);
    assert_eq!(second.fingerprint_id, first.fingerprint_id);
}

// ---------------------------------------------------------------------------
// S2: tier-1 cache hit costs nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cached_description_resolves_at_tier_one() {
    let world = build_world(
        FakeLlm::unavailable(),
        FakeOcr::with_result(FakeOcr::sample()),
    );
    let user = Uuid::new_v4();
    world
        .store
        .description_cache_upsert(user, "starbucks", "Starbucks", 0.95, world.clock.now())
        .unwrap();

    let resolution = world
        .resolver
        .resolve(&Question {
            kind: QuestionKind::NormalizeVendor,
            user_id: user,
            raw: "STARBUCKS #1234".to_string(),
            context: None,
        })
        .await
        .unwrap();

    assert_eq!(resolution.tier, Tier::T1);
    assert_eq!(resolution.answer["vendor"], "Starbucks");
    assert_eq!(resolution.cost_estimate, 0.0);
    assert_eq!(world.embedder.call_count(), 0);
}

// ---------------------------------------------------------------------------
// S3: tier-3 answer, confirm, next call is tier-1
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_llm_answer_writes_back_to_cache() {
    let llm = FakeLlm::scripted(vec![Ok(
        json!({"vendor": "Joe's Coffee", "confidence": 0.82}),
    )]);
    let world = build_world(llm, FakeOcr::with_result(FakeOcr::sample()));
    let user = Uuid::new_v4();
    let question = Question {
        kind: QuestionKind::NormalizeVendor,
        user_id: user,
        raw: "SQ *JOES COFFEE".to_string(),
        context: None,
    };

    let resolution = world.resolver.resolve(&question).await.unwrap();
    assert_eq!(resolution.tier, Tier::T3);
    assert_eq!(resolution.answer["vendor"], "Joe's Coffee");

    world
        .resolver
        .confirm_answer(&question, &resolution)
        .await
        .unwrap();

    // The fake LLM script is exhausted; only the cache can answer now.
    let again = world.resolver.resolve(&question).await.unwrap();
    assert_eq!(again.tier, Tier::T1);
    assert_eq!(again.answer["vendor"], "Joe's Coffee");
}

// ---------------------------------------------------------------------------
// S7 + full pipeline: upload, OCR retry, matching, confirm
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receipt_pipeline_with_transient_ocr_failure() {
    // Script: statement mapping, then one vendor normalization during OCR.
    let llm = FakeLlm::scripted(vec![
        Ok(mapping_value()),
        Ok(json!({"vendor": "Joe's Coffee", "confidence": 0.88})),
    ]);
    let ocr = FakeOcr::failing_first(FakeOcr::sample(), 1);
    let world = build_world(llm, ocr);
    let user = Uuid::new_v4();

    // Statement carrying the matching charge.
    let csv = "Post Date,Description,Amount\n2026-01-10,SQ *JOES COFFEE,-23.47\n";
    world
        .importer
        .import(user, None, csv.as_bytes())
        .await
        .unwrap();

    // Receipt upload: blob + row + ocr job.
    let blob_ref = world.blob.put("receipt.jpg", b"image-bytes").await.unwrap();
    let receipt_id = Uuid::new_v4();
    world
        .store
        .insert_receipt(receipt_id, user, &blob_ref, world.clock.now())
        .unwrap();
    let job_id = world
        .runtime
        .enqueue(
            JobKind::OcrExtract,
            &json!({"receipt_id": receipt_id, "user_id": user}),
        )
        .unwrap();

    // First pump: OCR fails transiently, job is released with backoff.
    pump(&world).await;
    let job = world.store.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 1);

    // After the backoff window the retry succeeds and chains matching.
    world.clock.advance_by(chrono::Duration::seconds(180));
    pump(&world).await;

    let job = world.store.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt, 2);

    let receipt = world.store.get_receipt(receipt_id).unwrap();
    assert_eq!(receipt.ocr_status, OcrStatus::Extracted);
    assert_eq!(receipt.amount_cents, Some(2345));
    assert_eq!(receipt.vendor_extracted.as_deref(), Some("Joe's Coffee"));

    // Matching ran as a chained job and proposed the Joe's Coffee charge.
    let proposals = world
        .store
        .proposals_for_receipt(receipt_id, Some(ProposalStatus::Proposed))
        .unwrap();
    assert_eq!(proposals.len(), 1);
    let proposal = &proposals[0];
    assert!(proposal.confidence >= 90.0);

    // Confirm: both sides flip, writebacks land.
    let confirmed = world.matching.confirm(proposal.id, None).unwrap();
    world.learning.on_match_confirmed(&confirmed).await.unwrap();

    assert_eq!(
        world.store.get_receipt(receipt_id).unwrap().match_status,
        MatchStatus::Matched
    );
    let tx = world
        .store
        .get_transaction(confirmed.transaction_id.unwrap())
        .unwrap();
    assert_eq!(tx.match_status, MatchStatus::Matched);
    assert_eq!(tx.matched_receipt_id, Some(receipt_id));
    assert!(world.store.alias_find("joes coffee").unwrap().is_some());

    // At-most-one confirmed match: a second confirm attempt conflicts.
    assert!(matches!(
        world.matching.confirm(proposal.id, None),
        Err(AppError::Conflict(_))
    ));
}

// ---------------------------------------------------------------------------
// S5: ambiguity holds for manual review
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ambiguous_charges_wait_for_manual_review() {
    let llm = FakeLlm::scripted(vec![Ok(mapping_value())]);
    let world = build_world(llm, FakeOcr::with_result(FakeOcr::sample()));
    let user = Uuid::new_v4();

    let csv = "Post Date,Description,Amount\n\
        2026-02-01,AMZN Mktp,-49.99\n\
        2026-02-02,AMZN Mktp,-50.01\n";
    world.importer.import(user, None, csv.as_bytes()).await.unwrap();

    let receipt_id = Uuid::new_v4();
    world
        .store
        .insert_receipt(receipt_id, user, "blobref", world.clock.now())
        .unwrap();
    world.store.mark_receipt_processing(receipt_id).unwrap();
    world
        .store
        .apply_receipt_extraction(
            receipt_id,
            Some("Amazon"),
            Some(NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()),
            Some(5000),
            None,
            "USD",
            &HashMap::new(),
            &[],
        )
        .unwrap();

    let created = world.matching.run_for_user(user).unwrap();
    assert_eq!(created, 0);

    let receipt = world.store.get_receipt(receipt_id).unwrap();
    let candidates = world.matching.candidates_for_receipt(&receipt).unwrap();
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c.score >= 70.0));
    assert!(candidates[0].score - candidates[1].score < 8.0);

    // Manual override resolves the ambiguity.
    let target = candidates[0].clone();
    let target_tx = match target.target {
        expensebot_backend::matching::CandidateTarget::Transaction(id) => id,
        _ => panic!("expected transaction candidate"),
    };
    let confirmed = world
        .matching
        .manual_match(receipt_id, Some(target_tx), None)
        .unwrap();
    assert_eq!(confirmed.status, ProposalStatus::Confirmed);
    assert!(confirmed.is_manual);
}

// ---------------------------------------------------------------------------
// Property 9: cancellation persists progress, no further side-effects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_report_job_keeps_progress() {
    let world = build_world(
        FakeLlm::unavailable(),
        FakeOcr::with_result(FakeOcr::sample()),
    );
    let user = Uuid::new_v4();

    let job_id = world
        .runtime
        .enqueue(JobKind::GenerateReport, &json!({"user_id": user}))
        .unwrap();

    // Claim, then request cancellation before running the handler: the
    // first checkpoint observes the flag.
    let job = world
        .store
        .claim_next_job(&all_kinds(), "test-worker", world.clock.now(), 90)
        .unwrap()
        .unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(
        world.store.request_job_cancel(job_id).unwrap(),
        JobStatus::CancelRequested
    );

    world.runtime.run_job(job, "test-worker").await;

    let job = world.store.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_ref.is_none());
    assert_eq!(job.progress.processed, 0);
    assert!(world.blob.is_empty());
}

// ---------------------------------------------------------------------------
// Cache warming closes the loop from exact cache to vector tier
// ---------------------------------------------------------------------------

#[tokio::test]
async fn warm_cache_seeds_embeddings_for_confirmed_entries() {
    let world = build_world(
        FakeLlm::unavailable(),
        FakeOcr::with_result(FakeOcr::sample()),
    );
    let user = Uuid::new_v4();
    world
        .store
        .description_cache_upsert(user, "joes coffee", "Joe's Coffee", 1.0, world.clock.now())
        .unwrap();

    let job_id = world
        .runtime
        .enqueue(JobKind::WarmCache, &json!({"limit": 10}))
        .unwrap();
    pump(&world).await;

    assert_eq!(
        world.store.get_job(job_id).unwrap().status,
        JobStatus::Succeeded
    );
    assert!(world
        .store
        .embedding_exists(
            expensebot_backend::models::SubjectKind::Description,
            "joes coffee",
            Some(user)
        )
        .unwrap());

    // Re-running finds nothing left to seed.
    let again = world
        .runtime
        .enqueue(JobKind::WarmCache, &json!({"limit": 10}))
        .unwrap();
    pump(&world).await;
    let job = world.store.get_job(again).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.progress.total, 0);
}
