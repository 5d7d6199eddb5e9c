//! Job queue persistence: atomic claim, lease renewal, retry backoff,
//! cancellation flags, and progress.

use crate::error::{AppError, AppResult};
use crate::jobs::{Job, JobKind, JobProgress, JobStatus};
use crate::store::{parse_uuid, ts_to_datetime, ts_to_datetime_opt, ExpenseStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Row};
use uuid::Uuid;

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get("id")?;
    let kind: String = row.get("kind")?;
    let payload_json: String = row.get("payload_json")?;
    let status: String = row.get("status")?;

    Ok(Job {
        id: parse_uuid(&id)?,
        kind: JobKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown job kind {kind}").into(),
            )
        })?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        attempt: row.get("attempt")?,
        max_attempts: row.get("max_attempts")?,
        next_visible_at: ts_to_datetime(row.get("next_visible_at")?),
        lease_owner: row.get("lease_owner")?,
        lease_expires_at: ts_to_datetime_opt(row.get("lease_expires_at")?),
        progress: JobProgress {
            total: row.get("progress_total")?,
            processed: row.get("progress_processed")?,
            failed: row.get("progress_failed")?,
        },
        eta: ts_to_datetime_opt(row.get("eta")?),
        result_ref: row.get("result_ref")?,
        error: row.get("error")?,
        row_version: row.get("row_version")?,
        created_at: ts_to_datetime(row.get("created_at")?),
    })
}

const JOB_COLS: &str = "id, kind, payload_json, status, attempt, max_attempts, next_visible_at, \
     lease_owner, lease_expires_at, progress_total, progress_processed, progress_failed, eta, \
     result_ref, error, row_version, created_at";

impl ExpenseStore {
    pub fn enqueue_job(
        &self,
        kind: JobKind,
        payload: &serde_json::Value,
        max_attempts: i64,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (id, kind, payload_json, status, max_attempts,
                               next_visible_at, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![
                id.to_string(),
                kind.as_str(),
                serde_json::to_string(payload)?,
                max_attempts,
                now.timestamp(),
                now.timestamp(),
            ],
        )?;
        Ok(id)
    }

    pub fn get_job(&self, id: Uuid) -> AppResult<Job> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"))?;
        stmt.query_row(params![id.to_string()], row_to_job)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("job {id}")),
                other => other.into(),
            })
    }

    /// Atomically claim the oldest runnable job of one of the given kinds.
    ///
    /// Runnable means `pending` with `next_visible_at <= now`, or `running`
    /// with an expired lease (the previous owner stopped renewing). The claim
    /// is optimistic on `row_version`; a lost race returns `None` and the
    /// caller polls again.
    pub fn claim_next_job(
        &self,
        kinds: &[JobKind],
        owner: &str,
        now: DateTime<Utc>,
        lease_ttl_secs: i64,
    ) -> AppResult<Option<Job>> {
        if kinds.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; kinds.len()].join(", ");
        let conn = self.conn.lock();

        let sql = format!(
            "SELECT {JOB_COLS} FROM jobs
             WHERE kind IN ({placeholders})
               AND ((status = 'pending' AND next_visible_at <= ?)
                 OR (status = 'running' AND lease_expires_at <= ?))
             ORDER BY created_at, id LIMIT 1"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut values: Vec<rusqlite::types::Value> = kinds
            .iter()
            .map(|k| rusqlite::types::Value::Text(k.as_str().to_string()))
            .collect();
        values.push(rusqlite::types::Value::Integer(now.timestamp()));
        values.push(rusqlite::types::Value::Integer(now.timestamp()));

        let candidate = stmt
            .query_row(params_from_iter(values.iter()), row_to_job)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(AppError::from(other)),
            })?;

        let Some(job) = candidate else {
            return Ok(None);
        };

        let n = conn.execute(
            "UPDATE jobs
             SET status = 'running', lease_owner = ?3, lease_expires_at = ?4,
                 attempt = attempt + 1, error = NULL, row_version = row_version + 1
             WHERE id = ?1 AND row_version = ?2",
            params![
                job.id.to_string(),
                job.row_version,
                owner,
                now.timestamp() + lease_ttl_secs,
            ],
        )?;
        if n == 0 {
            // Another worker won the claim.
            return Ok(None);
        }
        drop(stmt);
        drop(conn);
        Ok(Some(self.get_job(job.id)?))
    }

    /// Extend the lease. Returns false when the job is no longer owned by
    /// this worker (lease expired and re-claimed, or cancel requested).
    pub fn renew_lease(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease_ttl_secs: i64,
    ) -> AppResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3
             WHERE id = ?1 AND lease_owner = ?2 AND status = 'running'",
            params![id.to_string(), owner, now.timestamp() + lease_ttl_secs],
        )?;
        Ok(n == 1)
    }

    pub fn complete_job(
        &self,
        id: Uuid,
        owner: &str,
        result_ref: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE jobs
             SET status = 'succeeded', result_ref = ?3,
                 progress_processed = progress_total,
                 lease_owner = NULL, lease_expires_at = NULL,
                 row_version = row_version + 1
             WHERE id = ?1 AND lease_owner = ?2
               AND status IN ('running', 'cancel_requested')",
            params![id.to_string(), owner, result_ref],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!("job {id} not owned by {owner}")));
        }
        Ok(())
    }

    /// Transient failure: release back to pending with backoff, or mark
    /// failed once attempts are exhausted.
    pub fn release_job_for_retry(
        &self,
        id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        backoff_secs: i64,
        error: &str,
    ) -> AppResult<JobStatus> {
        let conn = self.conn.lock();
        let (attempt, max_attempts): (i64, i64) = conn.query_row(
            "SELECT attempt, max_attempts FROM jobs WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if attempt >= max_attempts {
            conn.execute(
                "UPDATE jobs SET status = 'failed', error = ?3,
                        lease_owner = NULL, lease_expires_at = NULL,
                        row_version = row_version + 1
                 WHERE id = ?1 AND lease_owner = ?2",
                params![id.to_string(), owner, error],
            )?;
            return Ok(JobStatus::Failed);
        }

        conn.execute(
            "UPDATE jobs SET status = 'pending', next_visible_at = ?3, error = ?4,
                    lease_owner = NULL, lease_expires_at = NULL,
                    row_version = row_version + 1
             WHERE id = ?1 AND lease_owner = ?2",
            params![
                id.to_string(),
                owner,
                now.timestamp() + backoff_secs,
                error
            ],
        )?;
        Ok(JobStatus::Pending)
    }

    pub fn fail_job(&self, id: Uuid, owner: &str, error: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?3,
                    lease_owner = NULL, lease_expires_at = NULL,
                    row_version = row_version + 1
             WHERE id = ?1 AND lease_owner = ?2",
            params![id.to_string(), owner, error],
        )?;
        Ok(())
    }

    /// Cancel request. A pending job is cancelled outright; a running job is
    /// flagged for the worker to observe at its next checkpoint.
    pub fn request_job_cancel(&self, id: Uuid) -> AppResult<JobStatus> {
        let conn = self.conn.lock();
        let status: String = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("job {id}")),
                other => other.into(),
            })?;

        match status.as_str() {
            "pending" => {
                conn.execute(
                    "UPDATE jobs SET status = 'cancelled', row_version = row_version + 1
                     WHERE id = ?1 AND status = 'pending'",
                    params![id.to_string()],
                )?;
                Ok(JobStatus::Cancelled)
            }
            "running" => {
                conn.execute(
                    "UPDATE jobs SET status = 'cancel_requested', row_version = row_version + 1
                     WHERE id = ?1 AND status = 'running'",
                    params![id.to_string()],
                )?;
                Ok(JobStatus::CancelRequested)
            }
            other => Ok(JobStatus::parse(other).unwrap_or(JobStatus::Failed)),
        }
    }

    pub fn is_cancel_requested(&self, id: Uuid) -> AppResult<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM jobs WHERE id = ?1 AND status = 'cancel_requested'")?;
        Ok(stmt.exists(params![id.to_string()])?)
    }

    /// Worker acknowledgement of a cancel request: progress is persisted,
    /// completed side-effects stay.
    pub fn mark_job_cancelled(&self, id: Uuid, owner: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET status = 'cancelled',
                    lease_owner = NULL, lease_expires_at = NULL,
                    row_version = row_version + 1
             WHERE id = ?1 AND lease_owner = ?2 AND status = 'cancel_requested'",
            params![id.to_string(), owner],
        )?;
        Ok(())
    }

    /// Progress only moves forward; a stale writer cannot roll it back.
    pub fn update_job_progress(
        &self,
        id: Uuid,
        progress: JobProgress,
        eta: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs
             SET progress_total = MAX(progress_total, ?2),
                 progress_processed = MAX(progress_processed, ?3),
                 progress_failed = MAX(progress_failed, ?4),
                 eta = ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                progress.total,
                progress.processed,
                progress.failed,
                eta.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000, 0).unwrap()
    }

    #[test]
    fn claim_runs_oldest_visible() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let t0 = now();
        let first = store
            .enqueue_job(JobKind::OcrExtract, &json!({"receipt_id": "a"}), 5, t0)
            .unwrap();
        let _second = store
            .enqueue_job(
                JobKind::OcrExtract,
                &json!({"receipt_id": "b"}),
                5,
                t0 + chrono::Duration::seconds(1),
            )
            .unwrap();

        let claimed = store
            .claim_next_job(&[JobKind::OcrExtract], "w1", t0 + chrono::Duration::seconds(2), 90)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
    }

    #[test]
    fn invisible_jobs_are_not_claimed() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let t0 = now();
        store
            .enqueue_job(JobKind::WarmCache, &json!({}), 5, t0)
            .unwrap();

        // Backoff pushed visibility into the future
        let job = store
            .claim_next_job(&[JobKind::WarmCache], "w1", t0, 90)
            .unwrap()
            .unwrap();
        store
            .release_job_for_retry(job.id, "w1", t0, 120, "transient")
            .unwrap();

        assert!(store
            .claim_next_job(&[JobKind::WarmCache], "w1", t0 + chrono::Duration::seconds(60), 90)
            .unwrap()
            .is_none());
        assert!(store
            .claim_next_job(&[JobKind::WarmCache], "w1", t0 + chrono::Duration::seconds(121), 90)
            .unwrap()
            .is_some());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let t0 = now();
        let id = store
            .enqueue_job(JobKind::MatchReceipt, &json!({}), 5, t0)
            .unwrap();

        let job = store
            .claim_next_job(&[JobKind::MatchReceipt], "w1", t0, 90)
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);

        // Before expiry nobody else can take it
        assert!(store
            .claim_next_job(&[JobKind::MatchReceipt], "w2", t0 + chrono::Duration::seconds(30), 90)
            .unwrap()
            .is_none());

        // After expiry w2 claims; attempt counts the redelivery
        let reclaimed = store
            .claim_next_job(&[JobKind::MatchReceipt], "w2", t0 + chrono::Duration::seconds(91), 90)
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempt, 2);
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("w2"));

        // The original owner's renew now fails
        assert!(!store
            .renew_lease(id, "w1", t0 + chrono::Duration::seconds(92), 90)
            .unwrap());
    }

    #[test]
    fn retry_exhaustion_fails_job() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let t0 = now();
        let id = store
            .enqueue_job(JobKind::OcrExtract, &json!({}), 2, t0)
            .unwrap();

        let mut t = t0;
        for _ in 0..2 {
            let job = store
                .claim_next_job(&[JobKind::OcrExtract], "w1", t, 90)
                .unwrap()
                .unwrap();
            store
                .release_job_for_retry(job.id, "w1", t, 0, "boom")
                .unwrap();
            t += chrono::Duration::seconds(1);
        }

        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn cancel_pending_is_immediate_running_is_cooperative() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let t0 = now();
        let first = store
            .enqueue_job(JobKind::GenerateReport, &json!({}), 5, t0)
            .unwrap();
        let second = store
            .enqueue_job(
                JobKind::GenerateReport,
                &json!({}),
                5,
                t0 + chrono::Duration::seconds(1),
            )
            .unwrap();
        // The claim takes the oldest job, leaving `second` pending.
        let claimed = store
            .claim_next_job(&[JobKind::GenerateReport], "w1", t0, 90)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first);

        assert_eq!(
            store.request_job_cancel(second).unwrap(),
            JobStatus::Cancelled
        );
        assert_eq!(
            store.request_job_cancel(first).unwrap(),
            JobStatus::CancelRequested
        );
        assert!(store.is_cancel_requested(first).unwrap());

        store
            .update_job_progress(
                first,
                JobProgress {
                    total: 10,
                    processed: 4,
                    failed: 0,
                },
                None,
            )
            .unwrap();
        store.mark_job_cancelled(first, "w1").unwrap();

        let job = store.get_job(first).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress.processed, 4);
    }

    #[test]
    fn progress_never_decreases() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let t0 = now();
        let id = store
            .enqueue_job(JobKind::CategorizeTransaction, &json!({}), 5, t0)
            .unwrap();

        store
            .update_job_progress(
                id,
                JobProgress {
                    total: 10,
                    processed: 7,
                    failed: 1,
                },
                None,
            )
            .unwrap();
        store
            .update_job_progress(
                id,
                JobProgress {
                    total: 10,
                    processed: 3,
                    failed: 0,
                },
                None,
            )
            .unwrap();

        let job = store.get_job(id).unwrap();
        assert_eq!(job.progress.processed, 7);
        assert_eq!(job.progress.failed, 1);
    }
}
