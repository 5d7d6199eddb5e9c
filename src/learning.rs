//! Confirmation writebacks.
//!
//! Every user confirmation teaches the cheap tiers: vendor aliases for the
//! exact path, verified embeddings for the similarity path, and append-only
//! feedback rows for the training record. This is what drives the marginal
//! AI cost of repeat questions toward zero.

use crate::error::AppResult;
use crate::matching::score;
use crate::models::{ExpenseEmbedding, MatchProposal, SubjectKind};
use crate::ports::{Clock, EmbeddingProvider};
use crate::store::ExpenseStore;
use chrono::Duration;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const EMBEDDING_TTL_DAYS: i64 = 180;

pub struct LearningWritebacks {
    store: Arc<ExpenseStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    clock: Arc<dyn Clock>,
}

impl LearningWritebacks {
    pub fn new(
        store: Arc<ExpenseStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            embedder,
            clock,
        }
    }

    /// After a match confirmation: alias the statement-side vendor string to
    /// the receipt's vendor (when no alias exists), seed a verified vendor
    /// embedding, and record the confirmation as feedback.
    pub async fn on_match_confirmed(&self, proposal: &MatchProposal) -> AppResult<()> {
        let receipt = self.store.get_receipt(proposal.receipt_id)?;
        let Some(receipt_vendor) = receipt
            .vendor_extracted
            .as_deref()
            .filter(|v| !v.trim().is_empty())
        else {
            return Ok(());
        };

        let statement_vendor_norm = match (proposal.transaction_id, proposal.transaction_group_id)
        {
            (Some(tx_id), _) => {
                let t = self.store.get_transaction(tx_id)?;
                score::normalize_vendor(&t.merchant_raw)
            }
            (_, Some(group_id)) => {
                let g = self.store.get_group(group_id)?;
                score::normalize_group_name(&g.name)
            }
            _ => return Ok(()),
        };
        if statement_vendor_norm.is_empty() {
            return Ok(());
        }

        if self.store.alias_find(&statement_vendor_norm)?.is_none() {
            self.store.alias_upsert(
                &statement_vendor_norm,
                receipt_vendor,
                None,
                Some(receipt.user_id),
                Some(self.clock.now()),
            )?;
        }

        self.seed_vendor_embedding(&statement_vendor_norm, receipt_vendor)
            .await;

        self.store.feedback_insert(
            proposal.id,
            "match",
            &statement_vendor_norm,
            receipt_vendor,
            receipt.user_id,
            self.clock.now(),
        )?;
        Ok(())
    }

    /// A user correction of an extracted field: record it and refresh the
    /// description cache so the corrected value wins next time.
    pub fn on_extraction_corrected(
        &self,
        receipt_id: Uuid,
        user_id: Uuid,
        field: &str,
        original: &str,
        corrected: &str,
    ) -> AppResult<()> {
        let now = self.clock.now();
        self.store
            .correction_insert(receipt_id, field, original, corrected, user_id, now)?;
        if field == "vendor" {
            let canonical = score::normalize_vendor(original);
            self.store
                .description_cache_upsert(user_id, &canonical, corrected, 1.0, now)?;
        }
        Ok(())
    }

    /// Best-effort; the warm_cache job sweeps anything missed here.
    async fn seed_vendor_embedding(&self, subject_norm: &str, answer: &str) {
        match self
            .store
            .embedding_exists(SubjectKind::Vendor, subject_norm, None)
        {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Vendor embedding existence check failed");
                return;
            }
        }
        let vector = match self.embedder.embed(&[subject_norm.to_string()]).await {
            Ok(mut vs) => vs.remove(0),
            Err(e) => {
                warn!(error = %e, "Vendor embedding call failed");
                return;
            }
        };
        let now = self.clock.now();
        let embedding = ExpenseEmbedding {
            id: Uuid::new_v4(),
            subject_kind: SubjectKind::Vendor,
            subject_text: subject_norm.to_string(),
            user_id: None,
            vector,
            category_code: None,
            answer: answer.to_string(),
            verified_by_user: true,
            verified_at: now,
            stale_after: now + Duration::days(EMBEDDING_TTL_DAYS),
        };
        if let Err(e) = self.store.embedding_insert(&embedding) {
            warn!(error = %e, "Vendor embedding insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{MatchingConfig, MatchingEngine};
    use crate::models::{MatchStatus, ReimbursabilitySource, Transaction};
    use crate::ports::{FakeEmbedding, SimClock};
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn setup() -> (
        LearningWritebacks,
        MatchingEngine,
        Arc<ExpenseStore>,
        Uuid,
        Uuid,
    ) {
        let store = Arc::new(ExpenseStore::open_in_memory().unwrap());
        let clock = Arc::new(SimClock::from_unix_secs(1_770_000_000));
        let learning = LearningWritebacks::new(
            store.clone(),
            Arc::new(FakeEmbedding::new(32)),
            clock.clone(),
        );
        let engine = MatchingEngine::new(store.clone(), clock, MatchingConfig::default());

        let user = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let receipt_id = Uuid::new_v4();
        store
            .insert_receipt(receipt_id, user, "blob", chrono::Utc::now())
            .unwrap();
        store.mark_receipt_processing(receipt_id).unwrap();
        store
            .apply_receipt_extraction(
                receipt_id,
                Some("Joe's Coffee"),
                Some(date),
                Some(2345),
                None,
                "USD",
                &HashMap::new(),
                &[],
            )
            .unwrap();
        let t = Transaction {
            id: Uuid::new_v4(),
            user_id: user,
            statement_id: None,
            description: "SQ *JOES COFFEE".to_string(),
            merchant_raw: "SQ *JOES COFFEE".to_string(),
            amount_cents: -2347,
            date,
            post_date: None,
            group_id: None,
            match_status: MatchStatus::Unmatched,
            matched_receipt_id: None,
            category_code: None,
            reimbursability_source: ReimbursabilitySource::None,
            row_version: 0,
        };
        store.insert_transactions_dedup(&[t]).unwrap();

        (learning, engine, store, user, receipt_id)
    }

    #[tokio::test]
    async fn confirm_writes_alias_embedding_and_feedback() {
        let (learning, engine, store, _user, receipt_id) = setup();

        let proposal = engine.run_for_receipt(receipt_id).unwrap().unwrap();
        let confirmed = engine.confirm(proposal.id, None).unwrap();
        learning.on_match_confirmed(&confirmed).await.unwrap();

        let alias = store.alias_find("joes coffee").unwrap().unwrap();
        assert_eq!(alias.canonical_vendor, "Joe's Coffee");

        assert!(store
            .embedding_exists(SubjectKind::Vendor, "joes coffee", None)
            .unwrap());

        let feedback = store.feedback_for_subject(confirmed.id).unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].corrected, "Joe's Coffee");

        // Idempotent: confirming writebacks again does not duplicate aliases
        learning.on_match_confirmed(&confirmed).await.unwrap();
        let alias_again = store.alias_find("joes coffee").unwrap().unwrap();
        assert_eq!(alias_again.canonical_vendor, "Joe's Coffee");
    }

    #[tokio::test]
    async fn extraction_correction_updates_cache() {
        let (learning, _engine, store, user, receipt_id) = setup();

        learning
            .on_extraction_corrected(receipt_id, user, "vendor", "JOES COFEE LLC", "Joe's Coffee")
            .unwrap();

        let hit = store
            .description_cache_get(user, "joes cofee llc", chrono::Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(hit.normalized_vendor, "Joe's Coffee");
    }
}
