//! Receipt ↔ transaction matching engine.
//!
//! Two-sided deterministic scorer: for each unmatched extracted receipt, at
//! most one proposal against a transaction or a transaction group, with
//! ambiguity detection and a manual-override path. All state changes run as
//! single store transactions guarded by row versions.

pub mod score;

use crate::error::{AppError, AppResult};
use crate::models::{MatchProposal, MatchStatus, ProposalStatus, Receipt};
use crate::ports::Clock;
use crate::store::ExpenseStore;
use chrono::Duration;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Days a rejected vendor pair stays capped.
const REJECTED_PAIR_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub score_threshold: f64,
    pub ambiguity_margin: f64,
    pub auto_confirm_threshold: f64,
    pub auto_confirm: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            score_threshold: 70.0,
            ambiguity_margin: 8.0,
            auto_confirm_threshold: 95.0,
            auto_confirm: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum CandidateTarget {
    Transaction(Uuid),
    Group(Uuid),
}

impl CandidateTarget {
    fn id(&self) -> Uuid {
        match self {
            CandidateTarget::Transaction(id) | CandidateTarget::Group(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub target: CandidateTarget,
    pub score: f64,
    pub amount_score: f64,
    pub date_score: f64,
    pub vendor_score: f64,
    pub rationale: String,
}

/// Raw candidate facts gathered under the store lock; scoring itself is pure
/// and runs in parallel.
struct CandidateInput {
    target: CandidateTarget,
    amount_cents: i64,
    date: chrono::NaiveDate,
    vendor_norm: String,
    alias_linked: bool,
    pair_rejected: bool,
}

pub struct MatchingEngine {
    store: Arc<ExpenseStore>,
    clock: Arc<dyn Clock>,
    cfg: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(store: Arc<ExpenseStore>, clock: Arc<dyn Clock>, cfg: MatchingConfig) -> Self {
        Self { store, clock, cfg }
    }

    /// Score the full candidate pool for a receipt, best first. Ties break
    /// by target id so repeated runs are stable.
    pub fn candidates_for_receipt(&self, receipt: &Receipt) -> AppResult<Vec<ScoredCandidate>> {
        let (Some(amount), Some(date)) = (receipt.amount_cents, receipt.date) else {
            return Ok(Vec::new());
        };
        let receipt_vendor = score::normalize_vendor(
            receipt.vendor_extracted.as_deref().unwrap_or_default(),
        );

        let from = date - Duration::days(score::DATE_WINDOW_DAYS);
        let to = date + Duration::days(score::DATE_WINDOW_DAYS);
        let transactions = self
            .store
            .unmatched_ungrouped_transactions(receipt.user_id, from, to)?;
        let groups = self.store.unmatched_groups(receipt.user_id, from, to)?;

        let rejected_since = self.clock.now() - Duration::days(REJECTED_PAIR_WINDOW_DAYS);
        let mut inputs = Vec::with_capacity(transactions.len() + groups.len());
        for t in &transactions {
            let vendor_source = if t.merchant_raw.trim().is_empty() {
                &t.description
            } else {
                &t.merchant_raw
            };
            let vendor_norm = score::normalize_vendor(vendor_source);
            inputs.push(CandidateInput {
                target: CandidateTarget::Transaction(t.id),
                amount_cents: t.amount_cents,
                date: t.date,
                alias_linked: self.store.alias_links(&receipt_vendor, &vendor_norm)?,
                pair_rejected: self.store.is_pair_rejected(
                    receipt.user_id,
                    &receipt_vendor,
                    &vendor_norm,
                    rejected_since,
                )?,
                vendor_norm,
            });
        }
        for g in &groups {
            let vendor_norm = score::normalize_group_name(&g.name);
            inputs.push(CandidateInput {
                target: CandidateTarget::Group(g.id),
                amount_cents: g.combined_amount_cents,
                date: g.display_date,
                alias_linked: self.store.alias_links(&receipt_vendor, &vendor_norm)?,
                pair_rejected: self.store.is_pair_rejected(
                    receipt.user_id,
                    &receipt_vendor,
                    &vendor_norm,
                    rejected_since,
                )?,
                vendor_norm,
            });
        }

        let mut scored: Vec<ScoredCandidate> = inputs
            .par_iter()
            .map(|c| {
                let amount_score = score::amount_score(amount, c.amount_cents);
                let date_score = score::date_score(date, c.date);
                let vendor_score = score::vendor_score(
                    &receipt_vendor,
                    &c.vendor_norm,
                    c.alias_linked,
                    c.pair_rejected,
                );
                let total = score::composite(amount_score, date_score, vendor_score);
                ScoredCandidate {
                    target: c.target,
                    score: total,
                    amount_score,
                    date_score,
                    vendor_score,
                    rationale: rationale(amount_score, date_score, vendor_score, c),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.target.id().cmp(&b.target.id()))
        });
        Ok(scored)
    }

    /// Produce at most one proposal for a receipt. Re-running on unchanged
    /// data is idempotent: open proposals are replaced with identical ones,
    /// confirmed and rejected history is untouched.
    pub fn run_for_receipt(&self, receipt_id: Uuid) -> AppResult<Option<MatchProposal>> {
        let receipt = self.store.get_receipt(receipt_id)?;
        if receipt.match_status == MatchStatus::Matched {
            return Ok(None);
        }
        let candidates = self.candidates_for_receipt(&receipt)?;

        self.store.delete_open_proposals(receipt_id)?;
        if receipt.match_status == MatchStatus::Proposed {
            // The open proposal was just dropped; release the receipt side
            // before re-evaluating.
            self.store.set_receipt_match_status(
                receipt_id,
                receipt.row_version,
                MatchStatus::Unmatched,
            )?;
        }

        let Some(top) = candidates.first() else {
            return Ok(None);
        };
        if top.score < self.cfg.score_threshold {
            debug!(
                receipt = %receipt_id,
                top_score = top.score,
                "No candidate clears the score threshold"
            );
            return Ok(None);
        }

        if let Some(second) = candidates.get(1) {
            if top.score - second.score < self.cfg.ambiguity_margin {
                let top_k: Vec<&ScoredCandidate> = candidates.iter().take(3).collect();
                info!(
                    receipt = %receipt_id,
                    candidates = %serde_json::to_string(&top_k).unwrap_or_default(),
                    "Ambiguous match, holding for manual review"
                );
                metrics::counter!("matching_ambiguous_total", 1);
                return Ok(None);
            }
        }

        let proposal = self.emit_proposal(&receipt, top, false)?;
        metrics::counter!("matching_proposals_total", 1);

        if self.cfg.auto_confirm && proposal.confidence >= self.cfg.auto_confirm_threshold {
            let confirmed =
                self.store
                    .confirm_match_atomic(proposal.id, None, self.clock.now())?;
            info!(receipt = %receipt_id, proposal = %confirmed.id, "Auto-confirmed high-confidence match");
            return Ok(Some(confirmed));
        }
        Ok(Some(proposal))
    }

    /// Run matching for every unmatched extracted receipt of a user.
    pub fn run_for_user(&self, user_id: Uuid) -> AppResult<usize> {
        let receipts = self.store.unmatched_extracted_receipts(user_id)?;
        let mut created = 0usize;
        for receipt in receipts {
            if self.run_for_receipt(receipt.id)?.is_some() {
                created += 1;
            }
        }
        Ok(created)
    }

    fn emit_proposal(
        &self,
        receipt: &Receipt,
        candidate: &ScoredCandidate,
        is_manual: bool,
    ) -> AppResult<MatchProposal> {
        let (transaction_id, transaction_group_id) = match candidate.target {
            CandidateTarget::Transaction(id) => (Some(id), None),
            CandidateTarget::Group(id) => (None, Some(id)),
        };
        let proposal = MatchProposal {
            id: Uuid::new_v4(),
            receipt_id: receipt.id,
            transaction_id,
            transaction_group_id,
            status: ProposalStatus::Proposed,
            confidence: candidate.score,
            amount_score: candidate.amount_score,
            date_score: candidate.date_score,
            vendor_score: candidate.vendor_score,
            reason: candidate.rationale.clone(),
            is_manual,
            confirmed_at: None,
            row_version: 0,
            created_at: self.clock.now(),
        };
        self.store.insert_proposal(&proposal)?;

        // Flip both sides to proposed so other receipts skip this candidate.
        let fresh = self.store.get_receipt(receipt.id)?;
        self.store
            .set_receipt_match_status(receipt.id, fresh.row_version, MatchStatus::Proposed)?;
        match candidate.target {
            CandidateTarget::Transaction(id) => {
                let t = self.store.get_transaction(id)?;
                self.store
                    .set_transaction_match(id, t.row_version, MatchStatus::Proposed, None)?;
            }
            CandidateTarget::Group(id) => {
                let g = self.store.get_group(id)?;
                self.store
                    .set_group_match(id, g.row_version, MatchStatus::Proposed, None)?;
            }
        }
        Ok(proposal)
    }

    /// Explicit user confirmation. Writebacks: vendor alias, prediction
    /// feedback; the caller (learning module) seeds embeddings.
    pub fn confirm(
        &self,
        proposal_id: Uuid,
        expected_version: Option<i64>,
    ) -> AppResult<MatchProposal> {
        let confirmed =
            self.store
                .confirm_match_atomic(proposal_id, expected_version, self.clock.now())?;
        info!(proposal = %proposal_id, receipt = %confirmed.receipt_id, "Match confirmed");
        Ok(confirmed)
    }

    /// Reject a proposal; on a confirmed one this is an unmatch. Records the
    /// vendor pair so the same mistake scores lower for a month.
    pub fn reject(
        &self,
        proposal_id: Uuid,
        expected_version: Option<i64>,
    ) -> AppResult<MatchProposal> {
        let (rejected, was_confirmed) =
            self.store.reject_match_atomic(proposal_id, expected_version)?;

        if was_confirmed {
            if let Ok(receipt) = self.store.get_receipt(rejected.receipt_id) {
                let receipt_vendor = score::normalize_vendor(
                    receipt.vendor_extracted.as_deref().unwrap_or_default(),
                );
                let other_vendor = match (rejected.transaction_id, rejected.transaction_group_id)
                {
                    (Some(tx_id), _) => self
                        .store
                        .get_transaction(tx_id)
                        .map(|t| score::normalize_vendor(&t.merchant_raw))
                        .ok(),
                    (_, Some(group_id)) => self
                        .store
                        .get_group(group_id)
                        .map(|g| score::normalize_group_name(&g.name))
                        .ok(),
                    _ => None,
                };
                if let Some(other) = other_vendor {
                    self.store.record_rejected_pair(
                        receipt.user_id,
                        &receipt_vendor,
                        &other,
                        self.clock.now(),
                    )?;
                    self.store.feedback_insert(
                        rejected.id,
                        "match",
                        &format!("{receipt_vendor} -> {other}"),
                        "unmatched_by_user",
                        receipt.user_id,
                        self.clock.now(),
                    )?;
                }
            }
        }
        info!(proposal = %proposal_id, was_confirmed, "Match rejected");
        Ok(rejected)
    }

    /// Manual override: the user names the target, we score it for the
    /// record and confirm in the same breath.
    pub fn manual_match(
        &self,
        receipt_id: Uuid,
        transaction_id: Option<Uuid>,
        group_id: Option<Uuid>,
    ) -> AppResult<MatchProposal> {
        if transaction_id.is_some() == group_id.is_some() {
            return Err(AppError::Validation(
                "exactly one of transaction_id or group_id is required".to_string(),
            ));
        }
        let receipt = self.store.get_receipt(receipt_id)?;
        let target = match (transaction_id, group_id) {
            (Some(id), None) => CandidateTarget::Transaction(id),
            (None, Some(id)) => CandidateTarget::Group(id),
            _ => unreachable!(),
        };

        let (amount_cents, date, vendor_norm) = match target {
            CandidateTarget::Transaction(id) => {
                let t = self.store.get_transaction(id)?;
                if t.group_id.is_some() {
                    return Err(AppError::Conflict(format!(
                        "transaction {id} belongs to a group; match the group instead"
                    )));
                }
                (
                    t.amount_cents,
                    t.date,
                    score::normalize_vendor(&t.merchant_raw),
                )
            }
            CandidateTarget::Group(id) => {
                let g = self.store.get_group(id)?;
                (
                    g.combined_amount_cents,
                    g.display_date,
                    score::normalize_group_name(&g.name),
                )
            }
        };

        let receipt_vendor = score::normalize_vendor(
            receipt.vendor_extracted.as_deref().unwrap_or_default(),
        );
        let amount_score = receipt
            .amount_cents
            .map(|a| score::amount_score(a, amount_cents))
            .unwrap_or(0.0);
        let date_score = receipt
            .date
            .map(|d| score::date_score(d, date))
            .unwrap_or(0.0);
        let vendor_score = score::vendor_score(&receipt_vendor, &vendor_norm, false, false);

        self.store.delete_open_proposals(receipt_id)?;
        if receipt.match_status == MatchStatus::Proposed {
            self.store.set_receipt_match_status(
                receipt_id,
                receipt.row_version,
                MatchStatus::Unmatched,
            )?;
        }

        let candidate = ScoredCandidate {
            target,
            score: score::composite(amount_score, date_score, vendor_score),
            amount_score,
            date_score,
            vendor_score,
            rationale: "manual override".to_string(),
        };
        let fresh = self.store.get_receipt(receipt_id)?;
        let proposal = self.emit_proposal(&fresh, &candidate, true)?;
        let confirmed = self
            .store
            .confirm_match_atomic(proposal.id, None, self.clock.now())?;
        info!(receipt = %receipt_id, proposal = %confirmed.id, "Manual match confirmed");
        Ok(confirmed)
    }
}

fn rationale(amount: f64, date: f64, vendor: f64, c: &CandidateInput) -> String {
    let mut parts = Vec::new();
    if amount >= 1.0 {
        parts.push("amount within tolerance".to_string());
    } else {
        parts.push(format!("amount score {amount:.2}"));
    }
    if date >= 1.0 {
        parts.push("same day".to_string());
    } else {
        parts.push(format!("date score {date:.2}"));
    }
    if c.alias_linked {
        parts.push("vendor alias match".to_string());
    } else if c.pair_rejected {
        parts.push("vendor pair previously rejected".to_string());
    } else {
        parts.push(format!("vendor similarity {vendor:.2}"));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cents, ReimbursabilitySource, Transaction};
    use crate::ports::SimClock;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn engine() -> (MatchingEngine, Arc<ExpenseStore>) {
        let store = Arc::new(ExpenseStore::open_in_memory().unwrap());
        let clock = Arc::new(SimClock::from_unix_secs(1_770_000_000));
        let engine = MatchingEngine::new(store.clone(), clock, MatchingConfig::default());
        (engine, store)
    }

    fn seed_receipt(
        store: &ExpenseStore,
        user: Uuid,
        vendor: &str,
        cents: Cents,
        date: NaiveDate,
    ) -> Uuid {
        let id = Uuid::new_v4();
        store
            .insert_receipt(id, user, "blobref", chrono::Utc::now())
            .unwrap();
        store.mark_receipt_processing(id).unwrap();
        store
            .apply_receipt_extraction(
                id,
                Some(vendor),
                Some(date),
                Some(cents),
                None,
                "USD",
                &HashMap::new(),
                &[],
            )
            .unwrap();
        id
    }

    fn seed_tx(
        store: &ExpenseStore,
        user: Uuid,
        desc: &str,
        cents: Cents,
        date: NaiveDate,
    ) -> Uuid {
        let t = Transaction {
            id: Uuid::new_v4(),
            user_id: user,
            statement_id: None,
            description: desc.to_string(),
            merchant_raw: desc.to_string(),
            amount_cents: cents,
            date,
            post_date: None,
            group_id: None,
            match_status: MatchStatus::Unmatched,
            matched_receipt_id: None,
            category_code: None,
            reimbursability_source: ReimbursabilitySource::None,
            row_version: 0,
        };
        let id = t.id;
        store.insert_transactions_dedup(&[t]).unwrap();
        id
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn clear_winner_gets_single_proposal() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        let a = seed_tx(&store, user, "SQ *JOES COFFEE", -2347, d(2026, 1, 10));
        let b = seed_tx(&store, user, "AMAZON", -9900, d(2026, 1, 9));

        let proposal = engine.run_for_receipt(receipt).unwrap().unwrap();
        assert_eq!(proposal.transaction_id, Some(a));
        assert!(proposal.confidence >= 90.0, "score = {}", proposal.confidence);
        assert!(proposal.amount_score >= 1.0);
        assert!((0.0..=1.0).contains(&proposal.vendor_score));

        // No proposal points at the unrelated transaction
        let all = store.proposals_for_receipt(receipt, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_ne!(all[0].transaction_id, Some(b));
    }

    #[test]
    fn ambiguous_candidates_produce_no_proposal() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Amazon", 5000, d(2026, 2, 1));
        seed_tx(&store, user, "AMZN Mktp", -4999, d(2026, 2, 1));
        seed_tx(&store, user, "AMZN Mktp", -5001, d(2026, 2, 2));

        let result = engine.run_for_receipt(receipt).unwrap();
        assert!(result.is_none());
        assert!(store.proposals_for_receipt(receipt, None).unwrap().is_empty());

        // Candidates are still visible for manual review
        let r = store.get_receipt(receipt).unwrap();
        let candidates = engine.candidates_for_receipt(&r).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.score >= 70.0));
        assert!(candidates[0].score - candidates[1].score < 8.0);
    }

    #[test]
    fn margin_alone_decides_ambiguity() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let date = d(2026, 4, 2);
        // Orthogonal vendor strings pin the vendor component to exactly zero,
        // leaving amount and date to set the scores: top = 75, runner-up = 69.
        let receipt = seed_receipt(&store, user, "AAAAAA", 10000, date);
        seed_tx(&store, user, "ZZZZZZ", -10000, date);
        seed_tx(&store, user, "ZZZZZZ", -10470, date);

        let r = store.get_receipt(receipt).unwrap();
        let candidates = engine.candidates_for_receipt(&r).unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].score >= 70.0);
        assert!(candidates[1].score < 70.0, "second = {}", candidates[1].score);
        assert!(candidates[0].score - candidates[1].score < 8.0);

        // The runner-up is below the proposal threshold, but the margin is
        // too thin to call: withhold for manual review.
        assert!(engine.run_for_receipt(receipt).unwrap().is_none());
        assert!(store.proposals_for_receipt(receipt, None).unwrap().is_empty());
        assert_eq!(
            store.get_receipt(receipt).unwrap().match_status,
            MatchStatus::Unmatched
        );
    }

    #[test]
    fn group_outranks_unrelated_transaction() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let date = d(2026, 3, 5);

        // Three Twilio charges grouped to $50.00
        let t1 = seed_tx(&store, user, "TWILIO 1", -1000, date);
        let t2 = seed_tx(&store, user, "TWILIO 2", -1500, date);
        let t3 = seed_tx(&store, user, "TWILIO 3", -2500, date);
        let group = store
            .create_group(user, "TWILIO (3 charges)", date, &[t1, t2, t3])
            .unwrap();
        seed_tx(&store, user, "NOT TWILIO", -5000, date);

        let receipt = seed_receipt(&store, user, "Twilio", 5000, date);
        let proposal = engine.run_for_receipt(receipt).unwrap().unwrap();
        assert_eq!(proposal.transaction_group_id, Some(group.id));
        assert_eq!(proposal.transaction_id, None);
    }

    #[test]
    fn below_threshold_stays_unmatched() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        seed_tx(&store, user, "TOTALLY DIFFERENT", -99999, d(2026, 1, 16));

        assert!(engine.run_for_receipt(receipt).unwrap().is_none());
        assert_eq!(
            store.get_receipt(receipt).unwrap().match_status,
            MatchStatus::Unmatched
        );
    }

    #[test]
    fn rerun_is_idempotent() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        let a = seed_tx(&store, user, "SQ *JOES COFFEE", -2347, d(2026, 1, 10));

        let created = engine.run_for_user(user).unwrap();
        assert_eq!(created, 1);

        // Second pass: the receipt already carries its proposal
        let created_again = engine.run_for_user(user).unwrap();
        assert_eq!(created_again, 0);

        let open = store
            .proposals_for_receipt(receipt, Some(ProposalStatus::Proposed))
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].transaction_id, Some(a));
    }

    #[test]
    fn confirm_flips_both_sides() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        let a = seed_tx(&store, user, "SQ *JOES COFFEE", -2347, d(2026, 1, 10));

        let proposal = engine.run_for_receipt(receipt).unwrap().unwrap();
        let confirmed = engine.confirm(proposal.id, Some(proposal.row_version)).unwrap();
        assert_eq!(confirmed.status, ProposalStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        assert_eq!(
            store.get_receipt(receipt).unwrap().match_status,
            MatchStatus::Matched
        );
        let t = store.get_transaction(a).unwrap();
        assert_eq!(t.match_status, MatchStatus::Matched);
        assert_eq!(t.matched_receipt_id, Some(receipt));

        // Confirming again conflicts
        assert!(matches!(
            engine.confirm(proposal.id, None),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn stale_version_confirm_conflicts() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        seed_tx(&store, user, "SQ *JOES COFFEE", -2347, d(2026, 1, 10));

        let proposal = engine.run_for_receipt(receipt).unwrap().unwrap();
        assert!(matches!(
            engine.confirm(proposal.id, Some(proposal.row_version + 1)),
            Err(AppError::Conflict(_))
        ));
        assert_eq!(
            store.get_receipt(receipt).unwrap().match_status,
            MatchStatus::Proposed
        );
    }

    #[test]
    fn unmatch_reverts_and_caps_future_vendor_score() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        let a = seed_tx(&store, user, "SQ *JOES COFFEE", -2347, d(2026, 1, 10));

        let proposal = engine.run_for_receipt(receipt).unwrap().unwrap();
        engine.confirm(proposal.id, None).unwrap();
        let rejected = engine.reject(proposal.id, None).unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);

        assert_eq!(
            store.get_receipt(receipt).unwrap().match_status,
            MatchStatus::Unmatched
        );
        let t = store.get_transaction(a).unwrap();
        assert_eq!(t.match_status, MatchStatus::Unmatched);
        assert_eq!(t.matched_receipt_id, None);

        // The pair is now capped: rescoring drops the vendor component
        let r = store.get_receipt(receipt).unwrap();
        let candidates = engine.candidates_for_receipt(&r).unwrap();
        assert!(candidates[0].vendor_score <= score::REJECTED_PAIR_CAP + 1e-9);
    }

    #[test]
    fn manual_match_confirms_immediately() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let receipt = seed_receipt(&store, user, "Joe's Coffee", 2345, d(2026, 1, 10));
        let far = seed_tx(&store, user, "SOMETHING ELSE", -10000, d(2026, 1, 12));

        let confirmed = engine.manual_match(receipt, Some(far), None).unwrap();
        assert_eq!(confirmed.status, ProposalStatus::Confirmed);
        assert!(confirmed.is_manual);
        assert_eq!(
            store.get_receipt(receipt).unwrap().match_status,
            MatchStatus::Matched
        );

        // Both-or-neither targets rejected
        assert!(matches!(
            engine.manual_match(receipt, None, None),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn grouped_member_never_in_pool() {
        let (engine, store) = engine();
        let user = Uuid::new_v4();
        let date = d(2026, 3, 5);
        let t1 = seed_tx(&store, user, "TWILIO 1", -5000, date);
        store.create_group(user, "TWILIO (1 charge)", date, &[t1]).unwrap();

        let receipt = seed_receipt(&store, user, "Twilio", 5000, date);
        let r = store.get_receipt(receipt).unwrap();
        let candidates = engine.candidates_for_receipt(&r).unwrap();
        assert!(candidates
            .iter()
            .all(|c| !matches!(c.target, CandidateTarget::Transaction(id) if id == t1)));

        // And a manual match cannot target the grouped member either
        assert!(matches!(
            engine.manual_match(receipt, Some(t1), None),
            Err(AppError::Conflict(_))
        ));
    }
}
