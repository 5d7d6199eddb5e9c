//! Expensebot backend: tiered AI-cost-minimizing expense resolution.
//!
//! Composition root: configuration, port adapter selection, job workers,
//! and the HTTP server all get wired here and nowhere else.

use anyhow::{Context, Result};
use axum::routing::get;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use expensebot_backend::{
    api::{self, AppState},
    ingest::StatementImporter,
    jobs::{JobHandlers, JobRuntime, JobRuntimeConfig},
    learning::LearningWritebacks,
    matching::{MatchingConfig, MatchingEngine},
    models::Config,
    ports::{
        BlobStore, Clock, EmbeddingClient, EmbeddingProvider, FakeEmbedding, FakeLlm, FakeOcr,
        FsBlobStore, HttpOcr, LlmProvider, OcrProvider, OpenRouterLlm, SystemClock,
    },
    resolver::{ResolverConfig, TieredResolver},
    store::ExpenseStore,
};

#[derive(Debug, Parser)]
#[command(name = "expensebot", about = "Expense resolution backend")]
struct Args {
    /// HTTP port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut cfg = Config::from_env()?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(db_path) = args.db_path {
        cfg.database_path = db_path;
    }

    info!("🚀 Expensebot backend starting - tiered resolution active");

    let store = Arc::new(ExpenseStore::open(&cfg.database_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    // Port adapters: real when configured, deterministic fakes otherwise so
    // a dev checkout runs end-to-end without credentials.
    let blob: Arc<dyn BlobStore> = {
        let signing_key = std::env::var("BLOB_SIGNING_KEY")
            .unwrap_or_else(|_| "dev-signing-key-change-in-production".to_string());
        Arc::new(FsBlobStore::new(cfg.blob_root.clone(), &signing_key))
    };

    let llm: Arc<dyn LlmProvider> = match &cfg.llm_api_key {
        Some(key) => Arc::new(OpenRouterLlm::new(
            http.clone(),
            key.clone(),
            cfg.llm_small_model.clone(),
            cfg.llm_large_model.clone(),
        )),
        None => {
            warn!("LLM_API_KEY not set; LLM tiers disabled (cache and vector tiers only)");
            Arc::new(FakeLlm::unavailable())
        }
    };

    let embedder: Arc<dyn EmbeddingProvider> = match &cfg.embedding_api_url {
        Some(url) => Arc::new(EmbeddingClient::new(
            http.clone(),
            url.clone(),
            cfg.embedding_model.clone(),
        )),
        None => {
            warn!("EMBEDDING_API_URL not set; using deterministic local embeddings");
            Arc::new(FakeEmbedding::new(384))
        }
    };

    let ocr: Arc<dyn OcrProvider> = match &cfg.ocr_api_url {
        Some(url) => Arc::new(HttpOcr::new(http.clone(), url.clone())),
        None => {
            warn!("OCR_API_URL not set; using stub extractions");
            Arc::new(FakeOcr::with_result(FakeOcr::sample()))
        }
    };

    let resolver = Arc::new(TieredResolver::new(
        store.clone(),
        embedder.clone(),
        llm,
        clock.clone(),
        ResolverConfig {
            vector_similarity_threshold: cfg.vector_similarity_threshold,
            vector_margin_threshold: cfg.vector_margin_threshold,
            small_llm_min_self_confidence: cfg.small_llm_min_self_confidence,
            breaker_error_rate_open: cfg.breaker_error_rate_open,
            breaker_timeout_rate_open: cfg.breaker_timeout_rate_open,
        },
    ));

    let matching = Arc::new(MatchingEngine::new(
        store.clone(),
        clock.clone(),
        MatchingConfig {
            score_threshold: cfg.matching_score_threshold,
            ambiguity_margin: cfg.matching_ambiguity_margin,
            auto_confirm_threshold: cfg.matching_auto_confirm_threshold,
            auto_confirm: cfg.matching_auto_confirm,
        },
    ));

    let learning = Arc::new(LearningWritebacks::new(
        store.clone(),
        embedder.clone(),
        clock.clone(),
    ));

    let importer = Arc::new(StatementImporter::new(
        store.clone(),
        resolver.clone(),
        clock.clone(),
    ));

    let handlers = Arc::new(JobHandlers::new(
        store.clone(),
        blob.clone(),
        ocr,
        embedder,
        resolver,
        matching.clone(),
        learning.clone(),
        clock.clone(),
        http.clone(),
        cfg.reference_data_url.clone(),
    ));

    let runtime = Arc::new(JobRuntime::new(
        store.clone(),
        clock.clone(),
        handlers,
        JobRuntimeConfig::from_app_config(&cfg),
    ));
    let _workers = runtime.spawn_workers();

    // Prometheus exporter for the resolver/matching/jobs counters.
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let state = AppState {
        store,
        blob,
        importer,
        matching,
        learning,
        runtime,
        clock,
    };

    let app = api::router(state)
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        );

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
