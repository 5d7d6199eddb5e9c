//! Transaction and transaction-group persistence, including dedup-keyed
//! statement imports.

use crate::error::{AppError, AppResult};
use crate::models::{
    Cents, MatchStatus, ReimbursabilitySource, Transaction, TransactionGroup,
};
use crate::store::{parse_date, parse_date_opt, parse_uuid, parse_uuid_opt, ExpenseStore};
use chrono::NaiveDate;
use rusqlite::{params, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Result of a dedup-guarded batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Dedup key: user, date, amount, and the first 40 chars of the normalized
/// description. Values-only changes across months hash differently; the same
/// row re-imported hashes identically.
pub fn transaction_dedup_key(
    user_id: Uuid,
    date: NaiveDate,
    amount_cents: Cents,
    description: &str,
) -> String {
    let normalized: String = description
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(40)
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(date.to_string().as_bytes());
    hasher.update(amount_cents.to_le_bytes());
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let id: String = row.get("id")?;
    let user_id: String = row.get("user_id")?;
    let statement_id: Option<String> = row.get("statement_id")?;
    let date: String = row.get("date")?;
    let post_date: Option<String> = row.get("post_date")?;
    let group_id: Option<String> = row.get("group_id")?;
    let match_status: String = row.get("match_status")?;
    let matched_receipt_id: Option<String> = row.get("matched_receipt_id")?;
    let reimb: String = row.get("reimbursability_source")?;

    Ok(Transaction {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        statement_id: parse_uuid_opt(statement_id)?,
        description: row.get("description")?,
        merchant_raw: row.get("merchant_raw")?,
        amount_cents: row.get("amount_cents")?,
        date: parse_date(&date)?,
        post_date: parse_date_opt(post_date)?,
        group_id: parse_uuid_opt(group_id)?,
        match_status: MatchStatus::parse(&match_status).unwrap_or(MatchStatus::Unmatched),
        matched_receipt_id: parse_uuid_opt(matched_receipt_id)?,
        category_code: row.get("category_code")?,
        reimbursability_source: ReimbursabilitySource::parse(&reimb)
            .unwrap_or(ReimbursabilitySource::None),
        row_version: row.get("row_version")?,
    })
}

const TX_COLS: &str = "id, user_id, statement_id, description, merchant_raw, amount_cents, \
     date, post_date, group_id, match_status, matched_receipt_id, category_code, \
     reimbursability_source, row_version";

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<TransactionGroup> {
    let id: String = row.get("id")?;
    let user_id: String = row.get("user_id")?;
    let display_date: String = row.get("display_date")?;
    let match_status: String = row.get("match_status")?;
    let matched_receipt_id: Option<String> = row.get("matched_receipt_id")?;

    Ok(TransactionGroup {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        name: row.get("name")?,
        display_date: parse_date(&display_date)?,
        combined_amount_cents: row.get("combined_amount_cents")?,
        members_count: row.get("members_count")?,
        match_status: MatchStatus::parse(&match_status).unwrap_or(MatchStatus::Unmatched),
        matched_receipt_id: parse_uuid_opt(matched_receipt_id)?,
        row_version: row.get("row_version")?,
    })
}

const GROUP_COLS: &str = "id, user_id, name, display_date, combined_amount_cents, \
     members_count, match_status, matched_receipt_id, row_version";

impl ExpenseStore {
    /// Insert parsed statement rows, dropping duplicates (within the batch
    /// and against the table) via the dedup-key unique index.
    pub fn insert_transactions_dedup(
        &self,
        transactions: &[Transaction],
    ) -> AppResult<ImportCounts> {
        let mut counts = ImportCounts::default();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::from)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO transactions
                 (id, user_id, statement_id, description, merchant_raw, amount_cents,
                  date, post_date, match_status, reimbursability_source, dedup_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'unmatched', 'none', ?9)",
            )?;
            for t in transactions {
                let key =
                    transaction_dedup_key(t.user_id, t.date, t.amount_cents, &t.description);
                let n = stmt.execute(params![
                    t.id.to_string(),
                    t.user_id.to_string(),
                    t.statement_id.map(|s| s.to_string()),
                    t.description,
                    t.merchant_raw,
                    t.amount_cents,
                    t.date.to_string(),
                    t.post_date.map(|d| d.to_string()),
                    key,
                ])?;
                if n == 1 {
                    counts.inserted += 1;
                } else {
                    counts.duplicates += 1;
                }
            }
        }
        tx.commit().map_err(AppError::from)?;
        Ok(counts)
    }

    pub fn get_transaction(&self, id: Uuid) -> AppResult<Transaction> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {TX_COLS} FROM transactions WHERE id = ?1"))?;
        stmt.query_row(params![id.to_string()], row_to_transaction)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    AppError::NotFound(format!("transaction {id}"))
                }
                other => other.into(),
            })
    }

    /// Candidate transactions for matching: unmatched, ungrouped, dated
    /// within the window.
    pub fn unmatched_ungrouped_transactions(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<Transaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TX_COLS} FROM transactions
             WHERE user_id = ?1 AND match_status = 'unmatched' AND group_id IS NULL
               AND date >= ?2 AND date <= ?3
             ORDER BY date, id"
        ))?;
        let rows = stmt
            .query_map(
                params![user_id.to_string(), from.to_string(), to.to_string()],
                row_to_transaction,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_transaction_match(
        &self,
        id: Uuid,
        expected_version: i64,
        status: MatchStatus,
        matched_receipt_id: Option<Uuid>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE transactions
             SET match_status = ?3, matched_receipt_id = ?4, row_version = row_version + 1
             WHERE id = ?1 AND row_version = ?2",
            params![
                id.to_string(),
                expected_version,
                status.as_str(),
                matched_receipt_id.map(|r| r.to_string()),
            ],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!("transaction {id} version stale")));
        }
        Ok(())
    }

    pub fn set_transaction_category(
        &self,
        id: Uuid,
        expected_version: i64,
        category_code: &str,
        source: ReimbursabilitySource,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE transactions
             SET category_code = ?3, reimbursability_source = ?4,
                 row_version = row_version + 1
             WHERE id = ?1 AND row_version = ?2",
            params![
                id.to_string(),
                expected_version,
                category_code,
                source.as_str()
            ],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!("transaction {id} version stale")));
        }
        Ok(())
    }

    /// Confirmed + categorized rows for a user, for report generation.
    pub fn categorized_transactions(&self, user_id: Uuid) -> AppResult<Vec<Transaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TX_COLS} FROM transactions
             WHERE user_id = ?1 AND category_code IS NOT NULL
             ORDER BY date, id"
        ))?;
        let rows = stmt
            .query_map(params![user_id.to_string()], row_to_transaction)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a group over existing ungrouped transactions. The combined
    /// amount is the exact sum of member amounts.
    pub fn create_group(
        &self,
        user_id: Uuid,
        name: &str,
        display_date: NaiveDate,
        member_ids: &[Uuid],
    ) -> AppResult<TransactionGroup> {
        if member_ids.is_empty() {
            return Err(AppError::Validation("group needs at least one member".into()));
        }
        let id = Uuid::new_v4();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::from)?;

        let mut combined: Cents = 0;
        for m in member_ids {
            let (amount, group_id): (Cents, Option<String>) = tx
                .query_row(
                    "SELECT amount_cents, group_id FROM transactions WHERE id = ?1 AND user_id = ?2",
                    params![m.to_string(), user_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        AppError::NotFound(format!("transaction {m}"))
                    }
                    other => other.into(),
                })?;
            if group_id.is_some() {
                return Err(AppError::Conflict(format!("transaction {m} already grouped")));
            }
            combined += amount;
        }

        tx.execute(
            "INSERT INTO transaction_groups
             (id, user_id, name, display_date, combined_amount_cents, members_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                user_id.to_string(),
                name,
                display_date.to_string(),
                combined,
                member_ids.len() as i64,
            ],
        )?;
        for m in member_ids {
            tx.execute(
                "UPDATE transactions SET group_id = ?2, row_version = row_version + 1
                 WHERE id = ?1",
                params![m.to_string(), id.to_string()],
            )?;
        }
        tx.commit().map_err(AppError::from)?;
        drop(conn);

        self.get_group(id)
    }

    /// Members survive dissolution with `group_id` cleared.
    pub fn dissolve_group(&self, group_id: Uuid) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::from)?;
        tx.execute(
            "UPDATE transactions SET group_id = NULL, row_version = row_version + 1
             WHERE group_id = ?1",
            params![group_id.to_string()],
        )?;
        let n = tx.execute(
            "DELETE FROM transaction_groups WHERE id = ?1",
            params![group_id.to_string()],
        )?;
        tx.commit().map_err(AppError::from)?;
        if n == 0 {
            return Err(AppError::NotFound(format!("group {group_id}")));
        }
        Ok(())
    }

    pub fn get_group(&self, id: Uuid) -> AppResult<TransactionGroup> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLS} FROM transaction_groups WHERE id = ?1"
        ))?;
        stmt.query_row(params![id.to_string()], row_to_group)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("group {id}")),
                other => other.into(),
            })
    }

    pub fn unmatched_groups(
        &self,
        user_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> AppResult<Vec<TransactionGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLS} FROM transaction_groups
             WHERE user_id = ?1 AND match_status = 'unmatched'
               AND display_date >= ?2 AND display_date <= ?3
             ORDER BY display_date, id"
        ))?;
        let rows = stmt
            .query_map(
                params![user_id.to_string(), from.to_string(), to.to_string()],
                row_to_group,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_group_match(
        &self,
        id: Uuid,
        expected_version: i64,
        status: MatchStatus,
        matched_receipt_id: Option<Uuid>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE transaction_groups
             SET match_status = ?3, matched_receipt_id = ?4, row_version = row_version + 1
             WHERE id = ?1 AND row_version = ?2",
            params![
                id.to_string(),
                expected_version,
                status.as_str(),
                matched_receipt_id.map(|r| r.to_string()),
            ],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!("group {id} version stale")));
        }
        Ok(())
    }

    pub fn statement_row_error(
        &self,
        statement_id: Uuid,
        row_idx: usize,
        raw_text: &str,
        error: &str,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO statement_row_errors (id, statement_id, row_idx, raw_text, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                statement_id.to_string(),
                row_idx as i64,
                raw_text,
                error
            ],
        )?;
        Ok(())
    }
}
