//! Append-only training records. No update or delete path exists on purpose;
//! retention is indefinite.

use crate::error::AppResult;
use crate::models::PredictionFeedback;
use crate::store::{parse_uuid, ts_to_datetime, ExpenseStore};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

impl ExpenseStore {
    pub fn feedback_insert(
        &self,
        subject_id: Uuid,
        field: &str,
        original: &str,
        corrected: &str,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO prediction_feedback
             (id, subject_id, field, original, corrected, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                subject_id.to_string(),
                field,
                original,
                corrected,
                user_id.to_string(),
                at.timestamp(),
            ],
        )?;
        Ok(id)
    }

    pub fn correction_insert(
        &self,
        subject_id: Uuid,
        field: &str,
        original: &str,
        corrected: &str,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO extraction_corrections
             (id, subject_id, field, original, corrected, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                subject_id.to_string(),
                field,
                original,
                corrected,
                user_id.to_string(),
                at.timestamp(),
            ],
        )?;
        Ok(id)
    }

    pub fn feedback_for_subject(&self, subject_id: Uuid) -> AppResult<Vec<PredictionFeedback>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, subject_id, field, original, corrected, user_id, created_at
             FROM prediction_feedback WHERE subject_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![subject_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let subject: String = row.get(1)?;
                let user: String = row.get(5)?;
                Ok(PredictionFeedback {
                    id: parse_uuid(&id)?,
                    subject_id: parse_uuid(&subject)?,
                    field: row.get(2)?,
                    original: row.get(3)?,
                    corrected: row.get(4)?,
                    user_id: parse_uuid(&user)?,
                    created_at: ts_to_datetime(row.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
