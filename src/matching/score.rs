//! Match score components.
//!
//! Composite = 0.40·amount + 0.35·date + 0.25·vendor, each component in
//! [0, 1], scaled to [0, 100]. Amounts are compared in cents.

use crate::models::Cents;
use crate::resolver::canonical::canonicalize;
use chrono::NaiveDate;
use std::sync::OnceLock;

pub const WEIGHT_AMOUNT: f64 = 0.40;
pub const WEIGHT_DATE: f64 = 0.35;
pub const WEIGHT_VENDOR: f64 = 0.25;

/// Vendor score ceiling for pairs the user has explicitly unmatched.
pub const REJECTED_PAIR_CAP: f64 = 0.3;

/// Days either side of the receipt date considered at all.
pub const DATE_WINDOW_DAYS: i64 = 7;

/// Full score within 2% of the receipt amount or $1.00, whichever is larger;
/// linear decay to zero at ten times that tolerance.
pub fn amount_score(receipt_cents: Cents, candidate_cents: Cents) -> f64 {
    let r = receipt_cents.abs();
    let c = candidate_cents.abs();
    let diff = (r - c).abs() as f64;
    let tolerance = ((r as f64) * 0.02).max(100.0);
    if diff <= tolerance {
        return 1.0;
    }
    (1.0 - (diff - tolerance) / (9.0 * tolerance)).clamp(0.0, 1.0)
}

pub fn date_score(receipt_date: NaiveDate, candidate_date: NaiveDate) -> f64 {
    let delta = (receipt_date - candidate_date).num_days().abs() as f64;
    (1.0 - delta / DATE_WINDOW_DAYS as f64).max(0.0)
}

/// Damerau-Levenshtein distance (optimal string alignment): insert, delete,
/// substitute, and adjacent transposition each cost 1.
pub fn damerau_levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());
    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    let mut dist = vec![vec![0usize; n + 1]; m + 1];
    for (i, row) in dist.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=n {
        dist[0][j] = j;
    }

    for i in 1..=m {
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut d = (dist[i - 1][j] + 1)
                .min(dist[i][j - 1] + 1)
                .min(dist[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                d = d.min(dist[i - 2][j - 2] + 1);
            }
            dist[i][j] = d;
        }
    }
    dist[m][n]
}

/// Similarity in [0, 1] from edit distance over the longer string.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - damerau_levenshtein(a, b) as f64 / max_len as f64
}

fn group_suffix_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\s*\(\d+\s+charges?\)\s*$").expect("valid regex"))
}

/// Normalized vendor string for comparison purposes.
pub fn normalize_vendor(raw: &str) -> String {
    canonicalize(raw)
}

/// Group display names carry a generated "(N charges)" suffix that is not
/// part of the vendor.
pub fn normalize_group_name(raw: &str) -> String {
    let stripped = group_suffix_re().replace(raw, "");
    canonicalize(&stripped)
}

/// Vendor component. An alias link outranks string distance; a user-rejected
/// pair is capped regardless of either.
pub fn vendor_score(
    receipt_vendor_norm: &str,
    candidate_vendor_norm: &str,
    alias_linked: bool,
    pair_rejected: bool,
) -> f64 {
    let mut score = string_similarity(receipt_vendor_norm, candidate_vendor_norm);
    if alias_linked {
        score = 1.0;
    }
    if pair_rejected {
        score = score.min(REJECTED_PAIR_CAP);
    }
    score
}

/// Composite score in [0, 100].
pub fn composite(amount: f64, date: f64, vendor: f64) -> f64 {
    (WEIGHT_AMOUNT * amount + WEIGHT_DATE * date + WEIGHT_VENDOR * vendor) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn amount_full_score_within_tolerance() {
        // $23.45 receipt vs $23.47 charge: 2 cents apart, $1 floor applies
        assert_eq!(amount_score(2345, -2347), 1.0);
        // Exactly at the $1 floor
        assert_eq!(amount_score(2345, 2445), 1.0);
        // 2% band on a large amount: $500.00 +- $10.00
        assert_eq!(amount_score(50000, 51000), 1.0);
    }

    #[test]
    fn amount_decays_linearly_to_ten_x() {
        // Tolerance $1; at $5.50 difference the score is half way down
        let half = amount_score(2345, 2345 + 550);
        assert!((half - 0.5).abs() < 0.01, "half = {half}");
        // At 10x tolerance and beyond, zero
        assert_eq!(amount_score(2345, 2345 + 1000), 0.0);
        assert_eq!(amount_score(2345, 9900), 0.0);
    }

    #[test]
    fn date_linear_over_week() {
        assert_eq!(date_score(d(2026, 1, 10), d(2026, 1, 10)), 1.0);
        let one_day = date_score(d(2026, 1, 10), d(2026, 1, 9));
        assert!((one_day - (1.0 - 1.0 / 7.0)).abs() < 1e-9);
        assert_eq!(date_score(d(2026, 1, 10), d(2026, 1, 20)), 0.0);
    }

    #[test]
    fn damerau_counts_transpositions() {
        assert_eq!(damerau_levenshtein("abc", "abc"), 0);
        assert_eq!(damerau_levenshtein("abc", "acb"), 1);
        assert_eq!(damerau_levenshtein("abc", "axc"), 1);
        assert_eq!(damerau_levenshtein("", "abc"), 3);
        assert_eq!(damerau_levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn vendor_alias_boost_and_rejection_cap() {
        let base = vendor_score("joe's coffee", "joes coffee", false, false);
        assert!(base > 0.9 && base < 1.0);

        assert_eq!(vendor_score("amazon", "amzn mktp", true, false), 1.0);

        let capped = vendor_score("amazon", "amzn mktp", true, true);
        assert_eq!(capped, REJECTED_PAIR_CAP);
    }

    #[test]
    fn group_name_suffix_stripped() {
        assert_eq!(normalize_group_name("TWILIO (3 charges)"), "twilio");
        assert_eq!(normalize_group_name("TWILIO (1 charge)"), "twilio");
        assert_eq!(normalize_group_name("Plain Name"), "plain name");
    }

    #[test]
    fn composite_bounds() {
        assert_eq!(composite(1.0, 1.0, 1.0), 100.0);
        assert_eq!(composite(0.0, 0.0, 0.0), 0.0);
        let mid = composite(1.0, 1.0, 0.5);
        assert!((mid - 87.5).abs() < 1e-9);
    }
}
