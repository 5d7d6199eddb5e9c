//! Capability ports consumed by the core.
//!
//! Each port is a trait with one real adapter (HTTP or filesystem) and one
//! deterministic fake. Variants are selected only at the composition root;
//! nothing below `main` knows which is in play.

pub mod blob;
pub mod clock;
pub mod embedding;
pub mod llm;
pub mod ocr;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use clock::{Clock, SimClock, SystemClock};
pub use embedding::{EmbeddingClient, EmbeddingProvider, FakeEmbedding};
pub use llm::{FakeLlm, LlmProvider, LlmRequest, LlmResponse, ModelClass, OpenRouterLlm, SchemaDescriptor};
pub use ocr::{FakeOcr, HttpOcr, OcrExtraction, OcrField, OcrLineItem, OcrProvider};

use std::time::Duration;

/// Upstream timeouts per external port. Timeouts count as transient failures
/// and feed the circuit breaker.
pub const OCR_TIMEOUT: Duration = Duration::from_secs(120);
pub const LLM_SMALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const LLM_LARGE_TIMEOUT: Duration = Duration::from_secs(90);
pub const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(10);
