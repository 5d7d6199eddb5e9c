//! Statement ingestion: sniff, locate the header, fingerprint the shape,
//! map columns (cache first, resolver otherwise), extract rows, dedup.
//!
//! Importing the same bytes twice inserts nothing the second time; the
//! dedup key protects the table, not the importer.

pub mod fingerprint;
pub mod header;
pub mod sniff;

use crate::error::{AppError, AppResult};
use crate::models::{
    parse_cents, ColumnMapping, MatchStatus, ReimbursabilitySource, SignConvention,
    StatementFingerprint, Transaction,
};
use crate::ports::Clock;
use crate::resolver::{Question, QuestionKind, TieredResolver};
use crate::store::ExpenseStore;
use calamine::Reader;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub statement_id: Uuid,
    pub imported: usize,
    pub duplicates: usize,
    pub failed_rows: usize,
    pub fingerprint_id: Uuid,
    pub needs_mapping_confirmation: bool,
}

pub struct StatementImporter {
    store: Arc<ExpenseStore>,
    resolver: Arc<TieredResolver>,
    clock: Arc<dyn Clock>,
}

impl StatementImporter {
    pub fn new(
        store: Arc<ExpenseStore>,
        resolver: Arc<TieredResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
        }
    }

    pub async fn import(
        &self,
        user_id: Uuid,
        filename: Option<&str>,
        bytes: &[u8],
    ) -> AppResult<ImportOutcome> {
        let rows = parse_rows(bytes)?;
        let Some(header_idx) = header::find_header_row(&rows) else {
            return Err(AppError::UnrecognizedFormat(
                "no header row found in the first 10 rows".to_string(),
            ));
        };
        let header_row = rows[header_idx].clone();
        let data_rows = &rows[header_idx + 1..];
        let hash = fingerprint::shape_hash(&header_row, data_rows);

        let (fp, reused) = match self.store.fingerprint_get_by_hash(&hash)? {
            Some(fp) => (fp, true),
            None => {
                let fp = self
                    .infer_mapping(user_id, &hash, header_idx, &header_row, data_rows)
                    .await?;
                (fp, false)
            }
        };
        let needs_mapping_confirmation = !fp.verified;
        if reused {
            info!(fingerprint = %fp.id, uses = fp.uses + 1, "Reusing cached statement mapping");
        }

        let statement_id = Uuid::new_v4();
        self.store.insert_statement(
            statement_id,
            user_id,
            Some(fp.id),
            filename,
            self.clock.now(),
        )?;

        let mut transactions = Vec::new();
        let mut failed_rows = 0usize;
        for (offset, row) in data_rows.iter().enumerate() {
            match extract_row(user_id, statement_id, row, &fp.mapping, fp.sign_convention) {
                Ok(Some(t)) => transactions.push(t),
                Ok(None) => {}
                Err(e) => {
                    failed_rows += 1;
                    self.store.statement_row_error(
                        statement_id,
                        header_idx + 1 + offset,
                        &row.join(","),
                        &e.to_string(),
                    )?;
                }
            }
        }

        if transactions.is_empty() && failed_rows > 0 {
            return Err(AppError::Validation(format!(
                "no rows parsed ({failed_rows} failed)"
            )));
        }

        let counts = self.store.insert_transactions_dedup(&transactions)?;
        info!(
            statement = %statement_id,
            imported = counts.inserted,
            duplicates = counts.duplicates,
            failed = failed_rows,
            "Statement import complete"
        );
        metrics::counter!("statements_imported_total", 1);
        metrics::counter!("statement_rows_inserted_total", counts.inserted as u64);

        Ok(ImportOutcome {
            statement_id,
            imported: counts.inserted,
            duplicates: counts.duplicates,
            failed_rows,
            fingerprint_id: fp.id,
            needs_mapping_confirmation,
        })
    }

    /// Unknown shape: ask the resolver for a column mapping and persist the
    /// fingerprint for next month's statement.
    async fn infer_mapping(
        &self,
        user_id: Uuid,
        shape_hash: &str,
        header_idx: usize,
        header_row: &[String],
        data_rows: &[Vec<String>],
    ) -> AppResult<StatementFingerprint> {
        let samples: Vec<&Vec<String>> =
            data_rows.iter().take(fingerprint::SAMPLE_ROWS).collect();
        let question = Question {
            kind: QuestionKind::MapStatementColumns,
            user_id,
            raw: header_row.join(" | "),
            context: Some(json!({
                "headers": header_row,
                "sample_rows": samples,
            })),
        };
        let resolution = self.resolver.resolve(&question).await?;
        let (mapping, sign) = mapping_from_answer(&resolution.answer, header_row.len())?;

        let fp = StatementFingerprint {
            id: Uuid::new_v4(),
            shape_hash: shape_hash.to_string(),
            mapping,
            header_row_idx: header_idx,
            sign_convention: sign,
            created_by_user_id: user_id,
            uses: 0,
            verified: false,
        };
        self.store.fingerprint_insert(&fp)?;
        info!(fingerprint = %fp.id, tier = resolution.tier.as_str(), "Inferred and cached new statement mapping");
        Ok(fp)
    }
}

/// Parse upload bytes into rows of cells.
fn parse_rows(bytes: &[u8]) -> AppResult<Vec<Vec<String>>> {
    match sniff::detect_kind(bytes) {
        sniff::FileKind::Delimited => {
            let text = sniff::decode_text(bytes);
            let delimiter = detect_delimiter(&text);
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .delimiter(delimiter)
                .from_reader(text.as_bytes());
            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record
                    .map_err(|e| AppError::Validation(format!("csv parse: {e}")))?;
                rows.push(record.iter().map(|c| c.to_string()).collect());
            }
            Ok(rows)
        }
        sniff::FileKind::Spreadsheet => {
            let cursor = std::io::Cursor::new(bytes.to_vec());
            let mut workbook = calamine::Xlsx::new(cursor).map_err(|e| {
                AppError::UnrecognizedFormat(format!("spreadsheet open failed: {e}"))
            })?;
            let range = workbook
                .worksheet_range_at(0)
                .ok_or_else(|| AppError::UnrecognizedFormat("empty workbook".to_string()))?
                .map_err(|e| {
                    AppError::UnrecognizedFormat(format!("worksheet read failed: {e}"))
                })?;
            let rows = range
                .rows()
                .map(|r| r.iter().map(cell_to_string).collect())
                .collect();
            Ok(rows)
        }
    }
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                format!("{}", *f as i64)
            } else {
                format!("{f}")
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().to_string())
            .unwrap_or_default(),
        other => {
            warn!(cell = ?other, "Unhandled spreadsheet cell type");
            String::new()
        }
    }
}

/// Pick the delimiter by frequency in the first non-empty line.
fn detect_delimiter(text: &str) -> u8 {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let commas = first_line.matches(',').count();
    let tabs = first_line.matches('\t').count();
    let semis = first_line.matches(';').count();
    if tabs > commas && tabs > semis {
        b'\t'
    } else if semis > commas {
        b';'
    } else {
        b','
    }
}

/// Validate and convert a resolver column-mapping answer.
fn mapping_from_answer(
    answer: &serde_json::Value,
    column_count: usize,
) -> AppResult<(ColumnMapping, SignConvention)> {
    let idx = |key: &str| -> AppResult<usize> {
        answer[key]
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| AppError::UnrecognizedFormat(format!("mapping missing {key}")))
    };
    let date_idx = idx("date_idx")?;
    let description_idx = idx("description_idx")?;
    let amount_idx = idx("amount_idx")?;
    for (name, i) in [
        ("date_idx", date_idx),
        ("description_idx", description_idx),
        ("amount_idx", amount_idx),
    ] {
        if i >= column_count {
            return Err(AppError::UnrecognizedFormat(format!(
                "inferred {name} = {i} out of range for {column_count} columns"
            )));
        }
    }

    let sign = answer["sign_convention"]
        .as_str()
        .and_then(SignConvention::parse)
        .ok_or_else(|| {
            AppError::UnrecognizedFormat("mapping missing sign_convention".to_string())
        })?;
    let date_locale = answer["date_locale"].as_str().unwrap_or("iso").to_string();

    Ok((
        ColumnMapping {
            date_idx,
            description_idx,
            amount_idx,
            merchant_idx: answer["merchant_idx"].as_u64().map(|v| v as usize),
            post_date_idx: answer["post_date_idx"].as_u64().map(|v| v as usize),
            date_locale,
        },
        sign,
    ))
}

/// One statement row to a transaction. `Ok(None)` for blank rows; errors for
/// rows that have content but do not parse.
fn extract_row(
    user_id: Uuid,
    statement_id: Uuid,
    row: &[String],
    mapping: &ColumnMapping,
    sign: SignConvention,
) -> AppResult<Option<Transaction>> {
    if row.iter().all(|c| c.trim().is_empty()) {
        return Ok(None);
    }

    let cell = |idx: usize| row.get(idx).map(|s| s.trim()).unwrap_or_default();

    let date_raw = cell(mapping.date_idx);
    let date = parse_row_date(date_raw, &mapping.date_locale)
        .ok_or_else(|| AppError::Validation(format!("unparseable date: {date_raw:?}")))?;

    let amount_raw = cell(mapping.amount_idx);
    let parsed = parse_cents(amount_raw)
        .ok_or_else(|| AppError::Validation(format!("unparseable amount: {amount_raw:?}")))?;
    // Canonical storage: spend is negative.
    let amount_cents = match sign {
        SignConvention::DebitsNegative => parsed,
        SignConvention::DebitsPositive => -parsed,
    };

    let description = cell(mapping.description_idx).to_string();
    if description.is_empty() {
        return Err(AppError::Validation("empty description".to_string()));
    }
    let merchant_raw = mapping
        .merchant_idx
        .map(|i| cell(i).to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| description.clone());
    let post_date = mapping
        .post_date_idx
        .and_then(|i| parse_row_date(cell(i), &mapping.date_locale));

    Ok(Some(Transaction {
        id: Uuid::new_v4(),
        user_id,
        statement_id: Some(statement_id),
        description,
        merchant_raw,
        amount_cents,
        date,
        post_date,
        group_id: None,
        match_status: MatchStatus::Unmatched,
        matched_receipt_id: None,
        category_code: None,
        reimbursability_source: ReimbursabilitySource::None,
        row_version: 0,
    }))
}

fn parse_row_date(raw: &str, locale: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let formats: &[&str] = match locale {
        "us" => &["%m/%d/%Y", "%m/%d/%y", "%Y-%m-%d"],
        "eu" => &["%d/%m/%Y", "%d/%m/%y", "%Y-%m-%d"],
        _ => &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m/%d/%y"],
    };
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}
