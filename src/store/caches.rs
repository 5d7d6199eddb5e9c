//! Cache tables: exact-match description cache, vendor aliases, verified
//! embeddings, statement fingerprints, split patterns, the resolution log,
//! and the GL-code reference table.

use crate::error::{AppError, AppResult};
use crate::models::{
    ColumnMapping, DescriptionCacheEntry, ExpenseEmbedding, SignConvention, SplitAllocation,
    SplitPattern, StatementFingerprint, SubjectKind, VendorAlias,
};
use crate::store::{parse_uuid, parse_uuid_opt, ts_to_datetime, ts_to_datetime_opt, ExpenseStore};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use uuid::Uuid;

impl ExpenseStore {
    // ------------------------------------------------------------------
    // Description cache (tier-1 exact)
    // ------------------------------------------------------------------

    /// Exact lookup by canonical form; a hit bumps `hit_count` and
    /// `last_used_at`.
    pub fn description_cache_get(
        &self,
        user_id: Uuid,
        canonical: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<DescriptionCacheEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT raw_description, normalized_vendor, confidence, last_used_at, hit_count
             FROM description_cache WHERE user_id = ?1 AND raw_description = ?2",
        )?;
        let entry = stmt
            .query_row(params![user_id.to_string(), canonical], |row| {
                Ok(DescriptionCacheEntry {
                    raw_description: row.get(0)?,
                    normalized_vendor: row.get(1)?,
                    confidence: row.get(2)?,
                    last_used_at: ts_to_datetime(row.get(3)?),
                    hit_count: row.get(4)?,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(AppError::from(other)),
            })?;

        if entry.is_some() {
            conn.execute(
                "UPDATE description_cache
                 SET hit_count = hit_count + 1, last_used_at = ?3
                 WHERE user_id = ?1 AND raw_description = ?2",
                params![user_id.to_string(), canonical, now.timestamp()],
            )?;
        }
        Ok(entry)
    }

    pub fn description_cache_upsert(
        &self,
        user_id: Uuid,
        canonical: &str,
        normalized_vendor: &str,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO description_cache
             (user_id, raw_description, normalized_vendor, confidence, last_used_at, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT (user_id, raw_description) DO UPDATE SET
               normalized_vendor = excluded.normalized_vendor,
               confidence = excluded.confidence,
               last_used_at = excluded.last_used_at",
            params![
                user_id.to_string(),
                canonical,
                normalized_vendor,
                confidence,
                now.timestamp()
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vendor aliases
    // ------------------------------------------------------------------

    pub fn alias_upsert(
        &self,
        pattern: &str,
        canonical_vendor: &str,
        default_category_code: Option<&str>,
        confirmed_by: Option<Uuid>,
        confirmed_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vendor_aliases
             (id, vendor_pattern, canonical_vendor, default_category_code,
              confirmed_by_user_id, confirmed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (vendor_pattern) DO UPDATE SET
               canonical_vendor = excluded.canonical_vendor,
               default_category_code = COALESCE(excluded.default_category_code,
                                                vendor_aliases.default_category_code),
               confirmed_by_user_id = COALESCE(excluded.confirmed_by_user_id,
                                               vendor_aliases.confirmed_by_user_id),
               confirmed_at = COALESCE(excluded.confirmed_at, vendor_aliases.confirmed_at)",
            params![
                Uuid::new_v4().to_string(),
                pattern,
                canonical_vendor,
                default_category_code,
                confirmed_by.map(|u| u.to_string()),
                confirmed_at.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    fn row_to_alias(row: &Row<'_>) -> rusqlite::Result<VendorAlias> {
        let id: String = row.get(0)?;
        let confirmed_by: Option<String> = row.get(4)?;
        Ok(VendorAlias {
            id: parse_uuid(&id)?,
            vendor_pattern: row.get(1)?,
            canonical_vendor: row.get(2)?,
            default_category_code: row.get(3)?,
            confirmed_by_user_id: parse_uuid_opt(confirmed_by)?,
            confirmed_at: ts_to_datetime_opt(row.get(5)?),
        })
    }

    /// Resolve a normalized vendor string to its alias: exact pattern match
    /// first, then regex patterns (stored wrapped in slashes).
    pub fn alias_find(&self, vendor_normalized: &str) -> AppResult<Option<VendorAlias>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, vendor_pattern, canonical_vendor, default_category_code,
                    confirmed_by_user_id, confirmed_at
             FROM vendor_aliases WHERE vendor_pattern = ?1",
        )?;
        let exact = stmt
            .query_row(params![vendor_normalized], Self::row_to_alias)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(AppError::from(other)),
            })?;
        if exact.is_some() {
            return Ok(exact);
        }

        let mut stmt = conn.prepare_cached(
            "SELECT id, vendor_pattern, canonical_vendor, default_category_code,
                    confirmed_by_user_id, confirmed_at
             FROM vendor_aliases WHERE vendor_pattern LIKE '/%/'",
        )?;
        let regex_aliases = stmt
            .query_map([], Self::row_to_alias)?
            .collect::<Result<Vec<_>, _>>()?;
        for alias in regex_aliases {
            let pattern = alias.vendor_pattern.trim_matches('/');
            if let Ok(re) = regex::Regex::new(pattern) {
                if re.is_match(vendor_normalized) {
                    return Ok(Some(alias));
                }
            }
        }
        Ok(None)
    }

    /// Whether an alias maps either side onto the other's canonical form.
    pub fn alias_links(&self, vendor_a: &str, vendor_b: &str) -> AppResult<bool> {
        if let Some(alias) = self.alias_find(vendor_a)? {
            if alias.canonical_vendor.eq_ignore_ascii_case(vendor_b) {
                return Ok(true);
            }
        }
        if let Some(alias) = self.alias_find(vendor_b)? {
            if alias.canonical_vendor.eq_ignore_ascii_case(vendor_a) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Embeddings (tier-2 corpus)
    // ------------------------------------------------------------------

    pub fn embedding_insert(&self, e: &ExpenseEmbedding) -> AppResult<()> {
        let conn = self.conn.lock();
        let blob: Vec<u8> = e.vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        conn.execute(
            "INSERT INTO expense_embeddings
             (id, subject_kind, subject_text, user_id, vector, category_code, answer,
              verified_by_user, verified_at, stale_after)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                e.id.to_string(),
                e.subject_kind.as_str(),
                e.subject_text,
                e.user_id.map(|u| u.to_string()),
                blob,
                e.category_code,
                e.answer,
                e.verified_by_user as i64,
                e.verified_at.timestamp(),
                e.stale_after.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn embedding_exists(
        &self,
        kind: SubjectKind,
        subject_text: &str,
        user_id: Option<Uuid>,
    ) -> AppResult<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM expense_embeddings
             WHERE subject_kind = ?1 AND subject_text = ?2
               AND (user_id = ?3 OR (user_id IS NULL AND ?3 IS NULL))",
        )?;
        let hit = stmt.exists(params![
            kind.as_str(),
            subject_text,
            user_id.map(|u| u.to_string())
        ])?;
        Ok(hit)
    }

    /// Verified embeddings eligible for tier-2: global rows plus the user's
    /// own, unexpired.
    pub fn verified_embeddings(
        &self,
        kind: SubjectKind,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ExpenseEmbedding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, subject_kind, subject_text, user_id, vector, category_code, answer,
                    verified_by_user, verified_at, stale_after
             FROM expense_embeddings
             WHERE subject_kind = ?1 AND verified_by_user = 1 AND stale_after > ?3
               AND (user_id IS NULL OR user_id = ?2)",
        )?;
        let rows = stmt
            .query_map(
                params![kind.as_str(), user_id.to_string(), now.timestamp()],
                |row| {
                    let id: String = row.get(0)?;
                    let kind_s: String = row.get(1)?;
                    let user: Option<String> = row.get(3)?;
                    let blob: Vec<u8> = row.get(4)?;
                    let vector = blob
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    Ok(ExpenseEmbedding {
                        id: parse_uuid(&id)?,
                        subject_kind: SubjectKind::parse(&kind_s)
                            .unwrap_or(SubjectKind::Description),
                        subject_text: row.get(2)?,
                        user_id: parse_uuid_opt(user)?,
                        vector,
                        category_code: row.get(5)?,
                        answer: row.get(6)?,
                        verified_by_user: row.get::<_, i64>(7)? != 0,
                        verified_at: ts_to_datetime(row.get(8)?),
                        stale_after: ts_to_datetime(row.get(9)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop expired rows and unverified rows older than 90 days.
    pub fn purge_stale_embeddings(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.conn.lock();
        let cutoff = now - chrono::Duration::days(90);
        let n = conn.execute(
            "DELETE FROM expense_embeddings
             WHERE stale_after <= ?1
                OR (verified_by_user = 0 AND verified_at <= ?2)",
            params![now.timestamp(), cutoff.timestamp()],
        )?;
        Ok(n)
    }

    /// Canonical forms confirmed into the exact cache but not yet embedded,
    /// for the cache-warming job.
    pub fn unseeded_cache_entries(&self, limit: usize) -> AppResult<Vec<(Uuid, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT dc.user_id, dc.raw_description, dc.normalized_vendor
             FROM description_cache dc
             WHERE NOT EXISTS (
                 SELECT 1 FROM expense_embeddings e
                 WHERE e.subject_kind = 'description'
                   AND e.subject_text = dc.raw_description
                   AND e.user_id = dc.user_id)
             ORDER BY dc.hit_count DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let user: String = row.get(0)?;
                Ok((parse_uuid(&user)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Statement fingerprints
    // ------------------------------------------------------------------

    pub fn fingerprint_insert(&self, fp: &StatementFingerprint) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO statement_fingerprints
             (id, shape_hash, mapping_json, header_row_idx, sign_convention,
              created_by_user_id, uses, verified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (shape_hash) DO NOTHING",
            params![
                fp.id.to_string(),
                fp.shape_hash,
                serde_json::to_string(&fp.mapping)?,
                fp.header_row_idx as i64,
                fp.sign_convention.as_str(),
                fp.created_by_user_id.to_string(),
                fp.uses,
                fp.verified as i64,
            ],
        )?;
        Ok(())
    }

    /// Lookup by shape hash; a hit increments the `uses` counter.
    pub fn fingerprint_get_by_hash(
        &self,
        shape_hash: &str,
    ) -> AppResult<Option<StatementFingerprint>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, shape_hash, mapping_json, header_row_idx, sign_convention,
                    created_by_user_id, uses, verified
             FROM statement_fingerprints WHERE shape_hash = ?1",
        )?;
        let fp = stmt
            .query_row(params![shape_hash], |row| {
                let id: String = row.get(0)?;
                let mapping_json: String = row.get(2)?;
                let sign: String = row.get(4)?;
                let created_by: String = row.get(5)?;
                let mapping: ColumnMapping =
                    serde_json::from_str(&mapping_json).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                Ok(StatementFingerprint {
                    id: parse_uuid(&id)?,
                    shape_hash: row.get(1)?,
                    mapping,
                    header_row_idx: row.get::<_, i64>(3)? as usize,
                    sign_convention: SignConvention::parse(&sign)
                        .unwrap_or(SignConvention::DebitsNegative),
                    created_by_user_id: parse_uuid(&created_by)?,
                    uses: row.get(6)?,
                    verified: row.get::<_, i64>(7)? != 0,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(AppError::from(other)),
            })?;

        if fp.is_some() {
            conn.execute(
                "UPDATE statement_fingerprints SET uses = uses + 1 WHERE shape_hash = ?1",
                params![shape_hash],
            )?;
        }
        Ok(fp)
    }

    /// User confirmation promotes the mapping to verified.
    pub fn fingerprint_set_verified(&self, id: Uuid) -> AppResult<()> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE statement_fingerprints SET verified = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if n == 0 {
            return Err(AppError::NotFound(format!("fingerprint {id}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Split patterns
    // ------------------------------------------------------------------

    pub fn split_pattern_upsert(&self, p: &SplitPattern) -> AppResult<()> {
        if !p.is_balanced() {
            return Err(AppError::Validation(format!(
                "split pattern for {} does not sum to 100%",
                p.trigger_vendor
            )));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO split_patterns (id, user_id, trigger_vendor, allocations_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, trigger_vendor)
             DO UPDATE SET allocations_json = excluded.allocations_json",
            params![
                p.id.to_string(),
                p.user_id.to_string(),
                p.trigger_vendor,
                serde_json::to_string(&p.allocations)?,
            ],
        )?;
        Ok(())
    }

    pub fn split_pattern_get(
        &self,
        user_id: Uuid,
        trigger_vendor: &str,
    ) -> AppResult<Option<SplitPattern>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, user_id, trigger_vendor, allocations_json
             FROM split_patterns WHERE user_id = ?1 AND trigger_vendor = ?2",
        )?;
        stmt.query_row(params![user_id.to_string(), trigger_vendor], |row| {
            let id: String = row.get(0)?;
            let user: String = row.get(1)?;
            let allocations_json: String = row.get(3)?;
            let allocations: Vec<SplitAllocation> = serde_json::from_str(&allocations_json)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
            Ok(SplitPattern {
                id: parse_uuid(&id)?,
                user_id: parse_uuid(&user)?,
                trigger_vendor: row.get(2)?,
                allocations,
            })
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(AppError::from(other)),
        })
    }

    // ------------------------------------------------------------------
    // Resolution log
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn resolution_log_insert(
        &self,
        question_kind: &str,
        canonical_hash: &str,
        tier_reached: &str,
        cache_hit: bool,
        confidence: f64,
        latency_ms: u64,
        provider_id: Option<&str>,
        cost_estimate: f64,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO resolution_log
             (id, question_kind, canonical_hash, tier_reached, cache_hit, confidence,
              latency_ms, provider_id, cost_estimate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                Uuid::new_v4().to_string(),
                question_kind,
                canonical_hash,
                tier_reached,
                cache_hit as i64,
                confidence,
                latency_ms as i64,
                provider_id,
                cost_estimate,
                at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Per-tier counts and summed cost units since a cutoff.
    pub fn resolver_stats_since(&self, since: DateTime<Utc>) -> AppResult<Vec<ResolverStatsRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tier_reached, COUNT(*), SUM(cost_estimate)
             FROM resolution_log WHERE created_at >= ?1
             GROUP BY tier_reached ORDER BY tier_reached",
        )?;
        let rows = stmt
            .query_map(params![since.timestamp()], |row| {
                Ok(ResolverStatsRow {
                    tier: row.get(0)?,
                    resolutions: row.get(1)?,
                    cost_units: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // GL reference data
    // ------------------------------------------------------------------

    pub fn gl_codes_replace(
        &self,
        codes: &[(String, String)],
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(AppError::from)?;
        tx.execute("DELETE FROM gl_codes", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO gl_codes (code, description, updated_at) VALUES (?1, ?2, ?3)",
            )?;
            for (code, desc) in codes {
                stmt.execute(params![code, desc, now.timestamp()])?;
            }
        }
        tx.commit().map_err(AppError::from)?;
        Ok(())
    }

    pub fn gl_codes_all(&self) -> AppResult<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT code, description FROM gl_codes ORDER BY code")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStatsRow {
    pub tier: String,
    pub resolutions: i64,
    pub cost_units: f64,
}
