//! SQLite-backed persistence.
//!
//! One WAL-mode connection behind a mutex; schema applied at open. The store
//! is the authoritative state; in-memory caches elsewhere are read-through
//! only. Optimistic concurrency uses the `row_version` column: every
//! state-changing update is guarded by the version the caller read, and a
//! mismatch surfaces as `Conflict`.

mod caches;
mod feedback;
mod jobs;
mod matches;
mod receipts;
mod transactions;

pub use caches::ResolverStatsRow;
pub use transactions::ImportCounts;

use crate::error::AppResult;
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS receipts (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    blob_ref TEXT NOT NULL,
    ocr_status TEXT NOT NULL,
    vendor_extracted TEXT,
    date TEXT,
    amount_cents INTEGER,
    tax_cents INTEGER,
    currency TEXT NOT NULL DEFAULT 'USD',
    confidence_json TEXT NOT NULL DEFAULT '{}',
    line_items_json TEXT NOT NULL DEFAULT '[]',
    match_status TEXT NOT NULL DEFAULT 'unmatched',
    row_version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_receipts_user_status
    ON receipts(user_id, match_status);

CREATE TABLE IF NOT EXISTS statements (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    fingerprint_id TEXT,
    filename TEXT,
    imported_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    statement_id TEXT,
    description TEXT NOT NULL,
    merchant_raw TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    date TEXT NOT NULL,
    post_date TEXT,
    group_id TEXT,
    match_status TEXT NOT NULL DEFAULT 'unmatched',
    matched_receipt_id TEXT,
    category_code TEXT,
    reimbursability_source TEXT NOT NULL DEFAULT 'none',
    dedup_key TEXT NOT NULL,
    row_version INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_dedup
    ON transactions(dedup_key);
CREATE INDEX IF NOT EXISTS idx_transactions_user_date
    ON transactions(user_id, date);
CREATE INDEX IF NOT EXISTS idx_transactions_user_status
    ON transactions(user_id, match_status);

CREATE TABLE IF NOT EXISTS transaction_groups (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    display_date TEXT NOT NULL,
    combined_amount_cents INTEGER NOT NULL,
    members_count INTEGER NOT NULL DEFAULT 0,
    match_status TEXT NOT NULL DEFAULT 'unmatched',
    matched_receipt_id TEXT,
    row_version INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_groups_user_status
    ON transaction_groups(user_id, match_status);

-- Exactly one of transaction_id / transaction_group_id per proposal.
CREATE TABLE IF NOT EXISTS match_proposals (
    id TEXT PRIMARY KEY,
    receipt_id TEXT NOT NULL,
    transaction_id TEXT,
    transaction_group_id TEXT,
    status TEXT NOT NULL DEFAULT 'proposed',
    confidence REAL NOT NULL,
    amount_score REAL NOT NULL,
    date_score REAL NOT NULL,
    vendor_score REAL NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    is_manual INTEGER NOT NULL DEFAULT 0,
    confirmed_at INTEGER,
    row_version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    CHECK ((transaction_id IS NULL) <> (transaction_group_id IS NULL))
) WITHOUT ROWID;

-- At most one confirmed match per receipt and per transaction/group.
CREATE UNIQUE INDEX IF NOT EXISTS idx_match_confirmed_receipt
    ON match_proposals(receipt_id) WHERE status = 'confirmed';
CREATE UNIQUE INDEX IF NOT EXISTS idx_match_confirmed_tx
    ON match_proposals(transaction_id)
    WHERE status = 'confirmed' AND transaction_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_match_confirmed_group
    ON match_proposals(transaction_group_id)
    WHERE status = 'confirmed' AND transaction_group_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_match_receipt
    ON match_proposals(receipt_id, status);

CREATE TABLE IF NOT EXISTS statement_fingerprints (
    id TEXT PRIMARY KEY,
    shape_hash TEXT NOT NULL UNIQUE,
    mapping_json TEXT NOT NULL,
    header_row_idx INTEGER NOT NULL,
    sign_convention TEXT NOT NULL,
    created_by_user_id TEXT NOT NULL,
    uses INTEGER NOT NULL DEFAULT 0,
    verified INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS statement_row_errors (
    id TEXT PRIMARY KEY,
    statement_id TEXT NOT NULL,
    row_idx INTEGER NOT NULL,
    raw_text TEXT NOT NULL,
    error TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS description_cache (
    user_id TEXT NOT NULL,
    raw_description TEXT NOT NULL,
    normalized_vendor TEXT NOT NULL,
    confidence REAL NOT NULL,
    last_used_at INTEGER NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, raw_description)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS vendor_aliases (
    id TEXT PRIMARY KEY,
    vendor_pattern TEXT NOT NULL UNIQUE,
    canonical_vendor TEXT NOT NULL,
    default_category_code TEXT,
    confirmed_by_user_id TEXT,
    confirmed_at INTEGER
) WITHOUT ROWID;

-- Vendor embeddings are global (user_id NULL); descriptions and receipt
-- lines are per-user.
CREATE TABLE IF NOT EXISTS expense_embeddings (
    id TEXT PRIMARY KEY,
    subject_kind TEXT NOT NULL,
    subject_text TEXT NOT NULL,
    user_id TEXT,
    vector BLOB NOT NULL,
    category_code TEXT,
    answer TEXT NOT NULL,
    verified_by_user INTEGER NOT NULL DEFAULT 0,
    verified_at INTEGER NOT NULL,
    stale_after INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_embeddings_kind
    ON expense_embeddings(subject_kind, user_id);

CREATE TABLE IF NOT EXISTS split_patterns (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    trigger_vendor TEXT NOT NULL,
    allocations_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_split_patterns_user_vendor
    ON split_patterns(user_id, trigger_vendor);

-- Append-only; no UPDATE path exists for these two tables.
CREATE TABLE IF NOT EXISTS prediction_feedback (
    id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    field TEXT NOT NULL,
    original TEXT NOT NULL,
    corrected TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS extraction_corrections (
    id TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL,
    field TEXT NOT NULL,
    original TEXT NOT NULL,
    corrected TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS rejected_pairs (
    user_id TEXT NOT NULL,
    vendor_a TEXT NOT NULL,
    vendor_b TEXT NOT NULL,
    rejected_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, vendor_a, vendor_b)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS resolution_log (
    id TEXT PRIMARY KEY,
    question_kind TEXT NOT NULL,
    canonical_hash TEXT NOT NULL,
    tier_reached TEXT NOT NULL,
    cache_hit INTEGER NOT NULL,
    confidence REAL NOT NULL,
    latency_ms INTEGER NOT NULL,
    provider_id TEXT,
    cost_estimate REAL NOT NULL,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_resolution_log_created
    ON resolution_log(created_at DESC);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    next_visible_at INTEGER NOT NULL,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    progress_total INTEGER NOT NULL DEFAULT 0,
    progress_processed INTEGER NOT NULL DEFAULT 0,
    progress_failed INTEGER NOT NULL DEFAULT 0,
    eta INTEGER,
    result_ref TEXT,
    error TEXT,
    row_version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_jobs_pending
    ON jobs(status, next_visible_at, created_at);

CREATE TABLE IF NOT EXISTS gl_codes (
    code TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

/// Persistence port. All reads and writes go through here.
pub struct ExpenseStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl ExpenseStore {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && db_path != ":memory:" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("📊 Database initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::open(":memory:")
    }

    pub fn insert_statement(
        &self,
        id: Uuid,
        user_id: Uuid,
        fingerprint_id: Option<Uuid>,
        filename: Option<&str>,
        imported_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO statements (id, user_id, fingerprint_id, filename, imported_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id.to_string(),
                user_id.to_string(),
                fingerprint_id.map(|f| f.to_string()),
                filename,
                imported_at.timestamp(),
            ],
        )?;
        Ok(())
    }
}

// ============================================================================
// Column conversion helpers shared by the submodules
// ============================================================================

pub(crate) fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_uuid_opt(s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|v| parse_uuid(&v)).transpose()
}

pub(crate) fn parse_date(s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_date_opt(s: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    s.map(|v| parse_date(&v)).transpose()
}

pub(crate) fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

pub(crate) fn ts_to_datetime_opt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(ts_to_datetime)
}
