//! Receipt persistence.

use crate::error::{AppError, AppResult};
use crate::models::{LineItem, MatchStatus, OcrStatus, Receipt};
use crate::store::{parse_date_opt, parse_uuid, ts_to_datetime, ExpenseStore};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Row};
use std::collections::HashMap;
use uuid::Uuid;

fn row_to_receipt(row: &Row<'_>) -> rusqlite::Result<Receipt> {
    let confidence_json: String = row.get("confidence_json")?;
    let line_items_json: String = row.get("line_items_json")?;
    let id: String = row.get("id")?;
    let user_id: String = row.get("user_id")?;
    let ocr_status: String = row.get("ocr_status")?;
    let match_status: String = row.get("match_status")?;
    let date: Option<String> = row.get("date")?;

    Ok(Receipt {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        blob_ref: row.get("blob_ref")?,
        ocr_status: OcrStatus::parse(&ocr_status).unwrap_or(OcrStatus::Pending),
        vendor_extracted: row.get("vendor_extracted")?,
        date: parse_date_opt(date)?,
        amount_cents: row.get("amount_cents")?,
        tax_cents: row.get("tax_cents")?,
        currency: row.get("currency")?,
        confidence_by_field: serde_json::from_str::<HashMap<String, f64>>(&confidence_json)
            .unwrap_or_default(),
        line_items: serde_json::from_str::<Vec<LineItem>>(&line_items_json).unwrap_or_default(),
        match_status: MatchStatus::parse(&match_status).unwrap_or(MatchStatus::Unmatched),
        row_version: row.get("row_version")?,
        created_at: ts_to_datetime(row.get("created_at")?),
    })
}

const RECEIPT_COLS: &str = "id, user_id, blob_ref, ocr_status, vendor_extracted, date, \
     amount_cents, tax_cents, currency, confidence_json, line_items_json, match_status, \
     row_version, created_at";

impl ExpenseStore {
    pub fn insert_receipt(
        &self,
        id: Uuid,
        user_id: Uuid,
        blob_ref: &str,
        created_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO receipts (id, user_id, blob_ref, ocr_status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![
                id.to_string(),
                user_id.to_string(),
                blob_ref,
                created_at.timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn get_receipt(&self, id: Uuid) -> AppResult<Receipt> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {RECEIPT_COLS} FROM receipts WHERE id = ?1"))?;
        let receipt = stmt
            .query_row(params![id.to_string()], row_to_receipt)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    AppError::NotFound(format!("receipt {id}"))
                }
                other => other.into(),
            })?;
        Ok(receipt)
    }

    /// Transition pending -> processing; idempotent for re-delivered jobs
    /// (already-processing or already-extracted rows are left alone).
    pub fn mark_receipt_processing(&self, id: Uuid) -> AppResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE receipts
             SET ocr_status = 'processing', row_version = row_version + 1
             WHERE id = ?1 AND ocr_status IN ('pending', 'failed')",
            params![id.to_string()],
        )?;
        Ok(n == 1)
    }

    /// Apply OCR extraction. An `extracted` receipt always carries an amount
    /// and date; callers with partial extractions must mark `failed` instead.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_receipt_extraction(
        &self,
        id: Uuid,
        vendor: Option<&str>,
        date: Option<NaiveDate>,
        amount_cents: Option<i64>,
        tax_cents: Option<i64>,
        currency: &str,
        confidence_by_field: &HashMap<String, f64>,
        line_items: &[LineItem],
    ) -> AppResult<()> {
        if amount_cents.is_none() || date.is_none() {
            return Err(AppError::Validation(
                "extracted receipts require amount and date".to_string(),
            ));
        }
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE receipts
             SET ocr_status = 'extracted', vendor_extracted = ?2, date = ?3,
                 amount_cents = ?4, tax_cents = ?5, currency = ?6,
                 confidence_json = ?7, line_items_json = ?8,
                 row_version = row_version + 1
             WHERE id = ?1",
            params![
                id.to_string(),
                vendor,
                date.map(|d| d.to_string()),
                amount_cents,
                tax_cents,
                currency,
                serde_json::to_string(confidence_by_field)?,
                serde_json::to_string(line_items)?,
            ],
        )?;
        if n == 0 {
            return Err(AppError::NotFound(format!("receipt {id}")));
        }
        Ok(())
    }

    pub fn mark_receipt_ocr_failed(&self, id: Uuid) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE receipts SET ocr_status = 'failed', row_version = row_version + 1
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Optimistic match-status flip. `Conflict` when the version is stale.
    pub fn set_receipt_match_status(
        &self,
        id: Uuid,
        expected_version: i64,
        status: MatchStatus,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE receipts
             SET match_status = ?3, row_version = row_version + 1
             WHERE id = ?1 AND row_version = ?2",
            params![id.to_string(), expected_version, status.as_str()],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!("receipt {id} version stale")));
        }
        Ok(())
    }

    /// Extracted receipts with no confirmed or proposed match.
    pub fn unmatched_extracted_receipts(&self, user_id: Uuid) -> AppResult<Vec<Receipt>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RECEIPT_COLS} FROM receipts
             WHERE user_id = ?1 AND ocr_status = 'extracted' AND match_status = 'unmatched'
             ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_receipt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ocr::FakeOcr;

    #[test]
    fn receipt_lifecycle() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let user = Uuid::new_v4();
        store
            .insert_receipt(id, user, "abc123", Utc::now())
            .unwrap();

        let r = store.get_receipt(id).unwrap();
        assert_eq!(r.ocr_status, OcrStatus::Pending);
        assert_eq!(r.row_version, 0);

        assert!(store.mark_receipt_processing(id).unwrap());
        // Second transition is a no-op (already processing)
        assert!(!store.mark_receipt_processing(id).unwrap());

        let sample = FakeOcr::sample();
        let mut conf = HashMap::new();
        for (k, f) in &sample.fields {
            conf.insert(k.clone(), f.confidence);
        }
        store
            .apply_receipt_extraction(
                id,
                Some("Joe's Coffee"),
                Some(NaiveDate::from_ymd_opt(2026, 1, 10).unwrap()),
                Some(2345),
                None,
                "USD",
                &conf,
                &[],
            )
            .unwrap();

        let r = store.get_receipt(id).unwrap();
        assert_eq!(r.ocr_status, OcrStatus::Extracted);
        assert_eq!(r.amount_cents, Some(2345));
        assert_eq!(r.vendor_extracted.as_deref(), Some("Joe's Coffee"));
    }

    #[test]
    fn extraction_without_amount_rejected() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store
            .insert_receipt(id, Uuid::new_v4(), "ref", Utc::now())
            .unwrap();
        let err = store
            .apply_receipt_extraction(id, Some("v"), None, None, None, "USD", &HashMap::new(), &[])
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn stale_version_conflicts() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store
            .insert_receipt(id, Uuid::new_v4(), "ref", Utc::now())
            .unwrap();

        store
            .set_receipt_match_status(id, 0, MatchStatus::Proposed)
            .unwrap();
        let err = store
            .set_receipt_match_status(id, 0, MatchStatus::Matched)
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
