//! Core domain entities shared across the resolver, matching engine,
//! ingestion pipeline, and job runtime.
//!
//! Money is fixed-point cents (`Cents`); binary floats never participate in
//! amount comparisons. All timestamps are UTC.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Monetary amount in cents (scale-2 fixed point).
pub type Cents = i64;

/// Parse a statement amount string ("1,234.56", "(12.50)", "$4.75-") into cents.
///
/// Returns `None` for anything that does not survive decimal parsing; the
/// caller records the raw text as a failed row instead of guessing.
pub fn parse_cents(raw: &str) -> Option<Cents> {
    let mut s = raw.trim().to_string();
    if s.is_empty() {
        return None;
    }

    // Accounting negatives: "(12.50)" and trailing-minus "12.50-"
    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    if s.ends_with('-') {
        negative = true;
        s.pop();
    }

    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | ' '))
        .collect();

    let dec = Decimal::from_str(&cleaned).ok()?;
    let dec = if negative { -dec } else { dec };
    let scaled = (dec * Decimal::new(100, 0)).round();
    scaled.to_i64()
}

/// Render cents as a plain decimal string ("-4.75").
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// ============================================================================
// Receipts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Pending,
    Processing,
    Extracted,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Pending => "pending",
            OcrStatus::Processing => "processing",
            OcrStatus::Extracted => "extracted",
            OcrStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "extracted" => Some(Self::Extracted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price_cents: Cents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub blob_ref: String,
    pub ocr_status: OcrStatus,
    pub vendor_extracted: Option<String>,
    pub date: Option<NaiveDate>,
    pub amount_cents: Option<Cents>,
    pub tax_cents: Option<Cents>,
    pub currency: String,
    /// Per-field extraction confidence in [0, 1], keyed by field name.
    pub confidence_by_field: std::collections::HashMap<String, f64>,
    pub line_items: Vec<LineItem>,
    pub match_status: MatchStatus,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Transactions and groups
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Unmatched,
    Proposed,
    Matched,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Unmatched => "unmatched",
            MatchStatus::Proposed => "proposed",
            MatchStatus::Matched => "matched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unmatched" => Some(Self::Unmatched),
            "proposed" => Some(Self::Proposed),
            "matched" => Some(Self::Matched),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReimbursabilitySource {
    None,
    Prediction,
    Override,
}

impl ReimbursabilitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReimbursabilitySource::None => "none",
            ReimbursabilitySource::Prediction => "prediction",
            ReimbursabilitySource::Override => "override",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "prediction" => Some(Self::Prediction),
            "override" => Some(Self::Override),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub statement_id: Option<Uuid>,
    pub description: String,
    pub merchant_raw: String,
    pub amount_cents: Cents,
    pub date: NaiveDate,
    pub post_date: Option<NaiveDate>,
    pub group_id: Option<Uuid>,
    pub match_status: MatchStatus,
    pub matched_receipt_id: Option<Uuid>,
    pub category_code: Option<String>,
    pub reimbursability_source: ReimbursabilitySource,
    pub row_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionGroup {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub display_date: NaiveDate,
    pub combined_amount_cents: Cents,
    pub members_count: i64,
    pub match_status: MatchStatus,
    pub matched_receipt_id: Option<Uuid>,
    pub row_version: i64,
}

// ============================================================================
// Match proposals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Confirmed,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Proposed => "proposed",
            ProposalStatus::Confirmed => "confirmed",
            ProposalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(Self::Proposed),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A proposed or confirmed link between a receipt and exactly one of a
/// transaction or a transaction group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchProposal {
    pub id: Uuid,
    pub receipt_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub transaction_group_id: Option<Uuid>,
    pub status: ProposalStatus,
    /// Composite score in [0, 100].
    pub confidence: f64,
    pub amount_score: f64,
    pub date_score: f64,
    pub vendor_score: f64,
    pub reason: String,
    pub is_manual: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
}

impl MatchProposal {
    /// Exactly one of transaction / group must be set.
    pub fn target_is_valid(&self) -> bool {
        self.transaction_id.is_some() ^ self.transaction_group_id.is_some()
    }
}

// ============================================================================
// Statement fingerprints
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignConvention {
    /// Debits appear as positive numbers; spend is positive.
    DebitsPositive,
    /// Debits appear as negative numbers (most card exports).
    DebitsNegative,
}

impl SignConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignConvention::DebitsPositive => "debits_positive",
            SignConvention::DebitsNegative => "debits_negative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debits_positive" => Some(Self::DebitsPositive),
            "debits_negative" => Some(Self::DebitsNegative),
            _ => None,
        }
    }
}

/// Column mapping inferred for a statement shape. Indexes are zero-based
/// positions within a data row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub date_idx: usize,
    pub description_idx: usize,
    pub amount_idx: usize,
    pub merchant_idx: Option<usize>,
    pub post_date_idx: Option<usize>,
    /// Locale hint for date parsing ("iso", "us", "eu").
    pub date_locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementFingerprint {
    pub id: Uuid,
    /// SHA-256 over normalized headers + sample row shapes, hex-encoded.
    pub shape_hash: String,
    pub mapping: ColumnMapping,
    pub header_row_idx: usize,
    pub sign_convention: SignConvention,
    pub created_by_user_id: Uuid,
    pub uses: i64,
    pub verified: bool,
}

// ============================================================================
// Caches, aliases, embeddings, patterns
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionCacheEntry {
    pub raw_description: String,
    pub normalized_vendor: String,
    pub confidence: f64,
    pub last_used_at: DateTime<Utc>,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorAlias {
    pub id: Uuid,
    /// Exact canonical form, or a regex when wrapped in slashes ("/amzn.*/").
    pub vendor_pattern: String,
    pub canonical_vendor: String,
    pub default_category_code: Option<String>,
    pub confirmed_by_user_id: Option<Uuid>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Description,
    Vendor,
    ReceiptLine,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Description => "description",
            SubjectKind::Vendor => "vendor",
            SubjectKind::ReceiptLine => "receipt_line",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "description" => Some(Self::Description),
            "vendor" => Some(Self::Vendor),
            "receipt_line" => Some(Self::ReceiptLine),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseEmbedding {
    pub id: Uuid,
    pub subject_kind: SubjectKind,
    pub subject_text: String,
    /// None for vendor embeddings (global); set for per-user subjects.
    pub user_id: Option<Uuid>,
    pub vector: Vec<f32>,
    pub category_code: Option<String>,
    /// The answer this embedding resolves to (canonical vendor, GL code, ...).
    pub answer: String,
    pub verified_by_user: bool,
    pub verified_at: DateTime<Utc>,
    pub stale_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitAllocation {
    pub gl_code: String,
    pub dept_code: String,
    pub pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitPattern {
    pub id: Uuid,
    pub user_id: Uuid,
    pub trigger_vendor: String,
    pub allocations: Vec<SplitAllocation>,
}

impl SplitPattern {
    /// Allocations must sum to 100% within a cent of slack.
    pub fn is_balanced(&self) -> bool {
        let total: f64 = self.allocations.iter().map(|a| a.pct).sum();
        (total - 100.0).abs() <= 0.01
    }
}

/// Append-only training record; immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionFeedback {
    pub id: Uuid,
    pub subject_id: Uuid,
    pub field: String,
    pub original: String,
    pub corrected: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Application configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub blob_root: String,
    pub port: u16,

    // Resolver
    pub vector_similarity_threshold: f64,
    pub vector_margin_threshold: f64,
    pub small_llm_min_self_confidence: f64,

    // Matching
    pub matching_score_threshold: f64,
    pub matching_ambiguity_margin: f64,
    pub matching_auto_confirm_threshold: f64,
    pub matching_auto_confirm: bool,

    // Jobs
    pub jobs_max_attempts: i64,
    pub jobs_lease_ttl_seconds: i64,
    pub jobs_poll_interval_ms: u64,
    pub concurrency_ocr: usize,
    pub concurrency_categorize: usize,
    pub concurrency_match: usize,
    pub concurrency_report: usize,
    pub concurrency_maintenance: usize,

    // Circuit breaker
    pub breaker_error_rate_open: f64,
    pub breaker_timeout_rate_open: f64,

    // Providers
    pub llm_api_key: Option<String>,
    pub llm_small_model: String,
    pub llm_large_model: String,
    pub embedding_model: String,
    pub embedding_api_url: Option<String>,
    pub ocr_api_url: Option<String>,
    pub reference_data_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./expensebot.db".to_string()),
            blob_root: std::env::var("BLOB_ROOT").unwrap_or_else(|_| "./blobs".to_string()),
            port: env_parse("PORT", 8080),

            vector_similarity_threshold: env_parse("RESOLVER_VECTOR_SIMILARITY_THRESHOLD", 0.88),
            vector_margin_threshold: env_parse("RESOLVER_VECTOR_MARGIN_THRESHOLD", 0.03),
            small_llm_min_self_confidence: env_parse(
                "RESOLVER_SMALL_LLM_MIN_SELF_CONFIDENCE",
                0.70,
            ),

            matching_score_threshold: env_parse("MATCHING_SCORE_THRESHOLD", 70.0),
            matching_ambiguity_margin: env_parse("MATCHING_AMBIGUITY_MARGIN", 8.0),
            matching_auto_confirm_threshold: env_parse("MATCHING_AUTO_CONFIRM_THRESHOLD", 95.0),
            matching_auto_confirm: env_flag("MATCHING_AUTO_CONFIRM", false),

            jobs_max_attempts: env_parse("JOBS_MAX_ATTEMPTS", 5),
            jobs_lease_ttl_seconds: env_parse("JOBS_LEASE_TTL_SECONDS", 90),
            jobs_poll_interval_ms: env_parse("JOBS_POLL_INTERVAL_MS", 500),
            concurrency_ocr: env_parse("JOBS_CONCURRENCY_OCR", 4),
            concurrency_categorize: env_parse("JOBS_CONCURRENCY_CATEGORIZE", 2),
            concurrency_match: env_parse("JOBS_CONCURRENCY_MATCH", 4),
            concurrency_report: env_parse("JOBS_CONCURRENCY_REPORT", 1),
            concurrency_maintenance: env_parse("JOBS_CONCURRENCY_MAINTENANCE", 1),

            breaker_error_rate_open: env_parse("BREAKER_ERROR_RATE_OPEN", 0.30),
            breaker_timeout_rate_open: env_parse("BREAKER_TIMEOUT_RATE_OPEN", 0.10),

            llm_api_key: std::env::var("LLM_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            llm_small_model: std::env::var("LLM_SMALL_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            llm_large_model: std::env::var("LLM_LARGE_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-sonnet-4".to_string()),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            embedding_api_url: std::env::var("EMBEDDING_API_URL").ok(),
            ocr_api_url: std::env::var("OCR_API_URL").ok(),
            reference_data_url: std::env::var("REFERENCE_DATA_URL").ok(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cents_plain_and_formatted() {
        assert_eq!(parse_cents("-4.75"), Some(-475));
        assert_eq!(parse_cents("1,234.56"), Some(123456));
        assert_eq!(parse_cents("$19.99"), Some(1999));
        assert_eq!(parse_cents("(12.50)"), Some(-1250));
        assert_eq!(parse_cents("12.50-"), Some(-1250));
        assert_eq!(parse_cents("0"), Some(0));
        assert_eq!(parse_cents("abc"), None);
        assert_eq!(parse_cents(""), None);
    }

    #[test]
    fn format_cents_round_trips() {
        assert_eq!(format_cents(-475), "-4.75");
        assert_eq!(format_cents(123456), "1234.56");
        assert_eq!(parse_cents(&format_cents(-475)), Some(-475));
    }

    #[test]
    fn split_pattern_balance() {
        let mut p = SplitPattern {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            trigger_vendor: "twilio".to_string(),
            allocations: vec![
                SplitAllocation {
                    gl_code: "6100".into(),
                    dept_code: "ENG".into(),
                    pct: 60.0,
                },
                SplitAllocation {
                    gl_code: "6200".into(),
                    dept_code: "OPS".into(),
                    pct: 40.0,
                },
            ],
        };
        assert!(p.is_balanced());
        p.allocations[1].pct = 39.5;
        assert!(!p.is_balanced());
    }

    #[test]
    fn proposal_target_xor() {
        let base = MatchProposal {
            id: Uuid::new_v4(),
            receipt_id: Uuid::new_v4(),
            transaction_id: Some(Uuid::new_v4()),
            transaction_group_id: None,
            status: ProposalStatus::Proposed,
            confidence: 80.0,
            amount_score: 1.0,
            date_score: 1.0,
            vendor_score: 0.5,
            reason: String::new(),
            is_manual: false,
            confirmed_at: None,
            row_version: 0,
            created_at: Utc::now(),
        };
        assert!(base.target_is_valid());

        let mut both = base.clone();
        both.transaction_group_id = Some(Uuid::new_v4());
        assert!(!both.target_is_valid());

        let mut neither = base;
        neither.transaction_id = None;
        assert!(!neither.target_is_valid());
    }
}
