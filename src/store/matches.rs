//! Match proposal persistence and the rejected-pair blocklist.

use crate::error::{AppError, AppResult};
use crate::models::{MatchProposal, ProposalStatus};
use crate::store::{parse_uuid, parse_uuid_opt, ts_to_datetime, ts_to_datetime_opt, ExpenseStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<MatchProposal> {
    let id: String = row.get("id")?;
    let receipt_id: String = row.get("receipt_id")?;
    let transaction_id: Option<String> = row.get("transaction_id")?;
    let group_id: Option<String> = row.get("transaction_group_id")?;
    let status: String = row.get("status")?;
    let confirmed_at: Option<i64> = row.get("confirmed_at")?;

    Ok(MatchProposal {
        id: parse_uuid(&id)?,
        receipt_id: parse_uuid(&receipt_id)?,
        transaction_id: parse_uuid_opt(transaction_id)?,
        transaction_group_id: parse_uuid_opt(group_id)?,
        status: ProposalStatus::parse(&status).unwrap_or(ProposalStatus::Proposed),
        confidence: row.get("confidence")?,
        amount_score: row.get("amount_score")?,
        date_score: row.get("date_score")?,
        vendor_score: row.get("vendor_score")?,
        reason: row.get("reason")?,
        is_manual: row.get::<_, i64>("is_manual")? != 0,
        confirmed_at: ts_to_datetime_opt(confirmed_at),
        row_version: row.get("row_version")?,
        created_at: ts_to_datetime(row.get("created_at")?),
    })
}

const PROPOSAL_COLS: &str = "id, receipt_id, transaction_id, transaction_group_id, status, \
     confidence, amount_score, date_score, vendor_score, reason, is_manual, confirmed_at, \
     row_version, created_at";

impl ExpenseStore {
    pub fn insert_proposal(&self, p: &MatchProposal) -> AppResult<()> {
        if !p.target_is_valid() {
            return Err(AppError::Validation(
                "proposal must target exactly one of transaction or group".to_string(),
            ));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO match_proposals
             (id, receipt_id, transaction_id, transaction_group_id, status, confidence,
              amount_score, date_score, vendor_score, reason, is_manual, confirmed_at,
              row_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                p.id.to_string(),
                p.receipt_id.to_string(),
                p.transaction_id.map(|t| t.to_string()),
                p.transaction_group_id.map(|g| g.to_string()),
                p.status.as_str(),
                p.confidence,
                p.amount_score,
                p.date_score,
                p.vendor_score,
                p.reason,
                p.is_manual as i64,
                p.confirmed_at.map(|t| t.timestamp()),
                p.row_version,
                p.created_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_proposal(&self, id: Uuid) -> AppResult<MatchProposal> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PROPOSAL_COLS} FROM match_proposals WHERE id = ?1"
        ))?;
        stmt.query_row(params![id.to_string()], row_to_proposal)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    AppError::NotFound(format!("proposal {id}"))
                }
                other => other.into(),
            })
    }

    pub fn proposals_for_receipt(
        &self,
        receipt_id: Uuid,
        status: Option<ProposalStatus>,
    ) -> AppResult<Vec<MatchProposal>> {
        let conn = self.conn.lock();
        let rows = match status {
            Some(s) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {PROPOSAL_COLS} FROM match_proposals
                     WHERE receipt_id = ?1 AND status = ?2 ORDER BY created_at DESC"
                ))?;
                let result = stmt.query_map(params![receipt_id.to_string(), s.as_str()], row_to_proposal)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {PROPOSAL_COLS} FROM match_proposals
                     WHERE receipt_id = ?1 ORDER BY created_at DESC"
                ))?;
                let result = stmt.query_map(params![receipt_id.to_string()], row_to_proposal)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    /// Drop open proposals before a re-run; confirmed and rejected rows are
    /// history and stay put.
    pub fn delete_open_proposals(&self, receipt_id: Uuid) -> AppResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM match_proposals WHERE receipt_id = ?1 AND status = 'proposed'",
            params![receipt_id.to_string()],
        )?;
        Ok(n)
    }

    /// Optimistic status transition. A unique-index violation (second
    /// confirmed row for the same receipt/transaction) also lands here as
    /// `Conflict`.
    pub fn set_proposal_status(
        &self,
        id: Uuid,
        expected_version: i64,
        status: ProposalStatus,
        confirmed_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE match_proposals
             SET status = ?3, confirmed_at = ?4, row_version = row_version + 1
             WHERE id = ?1 AND row_version = ?2",
            params![
                id.to_string(),
                expected_version,
                status.as_str(),
                confirmed_at.map(|t| t.timestamp()),
            ],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!("proposal {id} version stale")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Atomic confirm / reject (one transaction per state change)
    // ------------------------------------------------------------------

    /// Confirm a proposal and flip both sides in a single transaction.
    ///
    /// `expected_version` (when supplied by the API caller) guards against a
    /// stale read; the partial unique indexes guard against a second
    /// confirmation racing in. Either violation rolls the whole change back
    /// as `Conflict`.
    pub fn confirm_match_atomic(
        &self,
        proposal_id: Uuid,
        expected_version: Option<i64>,
        now: DateTime<Utc>,
    ) -> AppResult<MatchProposal> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::from)?;

        let proposal = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {PROPOSAL_COLS} FROM match_proposals WHERE id = ?1"
            ))?;
            stmt.query_row(params![proposal_id.to_string()], row_to_proposal)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        AppError::NotFound(format!("proposal {proposal_id}"))
                    }
                    other => other.into(),
                })?
        };

        if proposal.status != ProposalStatus::Proposed {
            return Err(AppError::Conflict(format!(
                "proposal {proposal_id} is {}, not proposed",
                proposal.status.as_str()
            )));
        }
        if let Some(v) = expected_version {
            if v != proposal.row_version {
                return Err(AppError::Conflict(format!(
                    "proposal {proposal_id} version stale"
                )));
            }
        }

        tx.execute(
            "UPDATE match_proposals
             SET status = 'confirmed', confirmed_at = ?2, row_version = row_version + 1
             WHERE id = ?1",
            params![proposal_id.to_string(), now.timestamp()],
        )?;

        let n = tx.execute(
            "UPDATE receipts SET match_status = 'matched', row_version = row_version + 1
             WHERE id = ?1 AND match_status != 'matched'",
            params![proposal.receipt_id.to_string()],
        )?;
        if n == 0 {
            return Err(AppError::Conflict(format!(
                "receipt {} already matched",
                proposal.receipt_id
            )));
        }

        if let Some(tx_id) = proposal.transaction_id {
            let n = tx.execute(
                "UPDATE transactions
                 SET match_status = 'matched', matched_receipt_id = ?2,
                     row_version = row_version + 1
                 WHERE id = ?1 AND match_status != 'matched'",
                params![tx_id.to_string(), proposal.receipt_id.to_string()],
            )?;
            if n == 0 {
                return Err(AppError::Conflict(format!("transaction {tx_id} already matched")));
            }
        }
        if let Some(group_id) = proposal.transaction_group_id {
            let n = tx.execute(
                "UPDATE transaction_groups
                 SET match_status = 'matched', matched_receipt_id = ?2,
                     row_version = row_version + 1
                 WHERE id = ?1 AND match_status != 'matched'",
                params![group_id.to_string(), proposal.receipt_id.to_string()],
            )?;
            if n == 0 {
                return Err(AppError::Conflict(format!("group {group_id} already matched")));
            }
        }

        tx.commit().map_err(AppError::from)?;
        drop(conn);
        self.get_proposal(proposal_id)
    }

    /// Reject a proposal (or unmatch a confirmed one). Returns the updated
    /// row plus whether it had been confirmed, so the caller can record the
    /// mistake for future scoring.
    pub fn reject_match_atomic(
        &self,
        proposal_id: Uuid,
        expected_version: Option<i64>,
    ) -> AppResult<(MatchProposal, bool)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::from)?;

        let proposal = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {PROPOSAL_COLS} FROM match_proposals WHERE id = ?1"
            ))?;
            stmt.query_row(params![proposal_id.to_string()], row_to_proposal)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        AppError::NotFound(format!("proposal {proposal_id}"))
                    }
                    other => other.into(),
                })?
        };

        let was_confirmed = match proposal.status {
            ProposalStatus::Confirmed => true,
            ProposalStatus::Proposed => false,
            ProposalStatus::Rejected => {
                return Err(AppError::Conflict(format!(
                    "proposal {proposal_id} already rejected"
                )))
            }
        };
        if let Some(v) = expected_version {
            if v != proposal.row_version {
                return Err(AppError::Conflict(format!(
                    "proposal {proposal_id} version stale"
                )));
            }
        }

        tx.execute(
            "UPDATE match_proposals
             SET status = 'rejected', row_version = row_version + 1
             WHERE id = ?1",
            params![proposal_id.to_string()],
        )?;
        tx.execute(
            "UPDATE receipts SET match_status = 'unmatched', row_version = row_version + 1
             WHERE id = ?1",
            params![proposal.receipt_id.to_string()],
        )?;
        if let Some(tx_id) = proposal.transaction_id {
            tx.execute(
                "UPDATE transactions
                 SET match_status = 'unmatched', matched_receipt_id = NULL,
                     row_version = row_version + 1
                 WHERE id = ?1",
                params![tx_id.to_string()],
            )?;
        }
        if let Some(group_id) = proposal.transaction_group_id {
            tx.execute(
                "UPDATE transaction_groups
                 SET match_status = 'unmatched', matched_receipt_id = NULL,
                     row_version = row_version + 1
                 WHERE id = ?1",
                params![group_id.to_string()],
            )?;
        }

        tx.commit().map_err(AppError::from)?;
        drop(conn);
        Ok((self.get_proposal(proposal_id)?, was_confirmed))
    }

    // ------------------------------------------------------------------
    // Rejected-pair blocklist
    // ------------------------------------------------------------------

    pub fn record_rejected_pair(
        &self,
        user_id: Uuid,
        vendor_a: &str,
        vendor_b: &str,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        // Stored in canonical order so lookups are symmetric.
        let (a, b) = if vendor_a <= vendor_b {
            (vendor_a, vendor_b)
        } else {
            (vendor_b, vendor_a)
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rejected_pairs (user_id, vendor_a, vendor_b, rejected_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, vendor_a, vendor_b)
             DO UPDATE SET rejected_at = excluded.rejected_at",
            params![user_id.to_string(), a, b, at.timestamp()],
        )?;
        Ok(())
    }

    pub fn is_pair_rejected(
        &self,
        user_id: Uuid,
        vendor_a: &str,
        vendor_b: &str,
        since: DateTime<Utc>,
    ) -> AppResult<bool> {
        let (a, b) = if vendor_a <= vendor_b {
            (vendor_a, vendor_b)
        } else {
            (vendor_b, vendor_a)
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM rejected_pairs
             WHERE user_id = ?1 AND vendor_a = ?2 AND vendor_b = ?3 AND rejected_at >= ?4",
        )?;
        let hit = stmt.exists(params![user_id.to_string(), a, b, since.timestamp()])?;
        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(receipt: Uuid, tx: Uuid) -> MatchProposal {
        MatchProposal {
            id: Uuid::new_v4(),
            receipt_id: receipt,
            transaction_id: Some(tx),
            transaction_group_id: None,
            status: ProposalStatus::Proposed,
            confidence: 92.0,
            amount_score: 1.0,
            date_score: 1.0,
            vendor_score: 0.8,
            reason: "amount within tolerance; same day".to_string(),
            is_manual: false,
            confirmed_at: None,
            row_version: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn second_confirmed_for_same_receipt_conflicts() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let receipt = Uuid::new_v4();

        let p1 = proposal(receipt, Uuid::new_v4());
        let p2 = proposal(receipt, Uuid::new_v4());
        store.insert_proposal(&p1).unwrap();
        store.insert_proposal(&p2).unwrap();

        store
            .set_proposal_status(p1.id, 0, ProposalStatus::Confirmed, Some(Utc::now()))
            .unwrap();
        let err = store
            .set_proposal_status(p2.id, 0, ProposalStatus::Confirmed, Some(Utc::now()))
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn second_confirmed_for_same_transaction_conflicts() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let tx = Uuid::new_v4();

        let p1 = proposal(Uuid::new_v4(), tx);
        let p2 = proposal(Uuid::new_v4(), tx);
        store.insert_proposal(&p1).unwrap();
        store.insert_proposal(&p2).unwrap();

        store
            .set_proposal_status(p1.id, 0, ProposalStatus::Confirmed, Some(Utc::now()))
            .unwrap();
        let err = store
            .set_proposal_status(p2.id, 0, ProposalStatus::Confirmed, Some(Utc::now()))
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn proposal_without_target_rejected_at_insert() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let mut p = proposal(Uuid::new_v4(), Uuid::new_v4());
        p.transaction_id = None;
        assert!(matches!(
            store.insert_proposal(&p),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn rejected_pair_is_symmetric_and_windowed() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let now = Utc::now();
        store
            .record_rejected_pair(user, "joes coffee", "amazon", now)
            .unwrap();

        let since = now - chrono::Duration::days(30);
        assert!(store
            .is_pair_rejected(user, "amazon", "joes coffee", since)
            .unwrap());
        assert!(store
            .is_pair_rejected(user, "joes coffee", "amazon", since)
            .unwrap());

        // Outside the window
        let future = now + chrono::Duration::days(1);
        assert!(!store
            .is_pair_rejected(user, "amazon", "joes coffee", future)
            .unwrap());
    }

    #[test]
    fn delete_open_proposals_spares_history() {
        let store = ExpenseStore::open_in_memory().unwrap();
        let receipt = Uuid::new_v4();
        let p1 = proposal(receipt, Uuid::new_v4());
        let p2 = proposal(receipt, Uuid::new_v4());
        store.insert_proposal(&p1).unwrap();
        store.insert_proposal(&p2).unwrap();
        store
            .set_proposal_status(p2.id, 0, ProposalStatus::Rejected, None)
            .unwrap();

        assert_eq!(store.delete_open_proposals(receipt).unwrap(), 1);
        let remaining = store.proposals_for_receipt(receipt, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, ProposalStatus::Rejected);
    }
}
