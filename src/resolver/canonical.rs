//! Canonical form of free-text resolution keys.
//!
//! The canonical form is the tier-1 cache key, so it must be deterministic
//! and idempotent: canonicalize(canonicalize(x)) == canonicalize(x).

use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn store_number_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\s*#\d+\s*$").expect("valid regex"))
}

fn date_suffix_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    // Trailing date-like tokens: 01/02, 01/02/26, 2026-01-02
    RE.get_or_init(|| {
        regex::Regex::new(r"\s*(\d{1,2}/\d{1,2}(/\d{2,4})?|\d{4}-\d{2}-\d{2})\s*$")
            .expect("valid regex")
    })
}

/// Lowercase, collapse whitespace, strip transactional noise: "POS " style
/// prefixes, trailing "#1234" store numbers, trailing date tokens.
pub fn canonicalize(raw: &str) -> String {
    let mut s = raw.to_lowercase();
    s = s.split_whitespace().collect::<Vec<_>>().join(" ");

    for prefix in ["pos ", "tst* ", "sq *", "sq*"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.trim_start().to_string();
        }
    }

    loop {
        let before = s.len();
        s = store_number_re().replace(&s, "").to_string();
        s = date_suffix_re().replace(&s, "").to_string();
        if s.len() == before {
            break;
        }
    }

    s.trim().to_string()
}

/// Cache keys are logged hashed, not raw, so the observability stream never
/// carries merchant text.
pub fn canonical_hash(question_kind: &str, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(question_kind.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_noise() {
        assert_eq!(canonicalize("STARBUCKS #1234"), "starbucks");
        assert_eq!(canonicalize("POS  STARBUCKS  #1234"), "starbucks");
        assert_eq!(canonicalize("SQ *JOES COFFEE"), "joes coffee");
        assert_eq!(canonicalize("UBER TRIP 01/02"), "uber trip");
        assert_eq!(canonicalize("ACME CO 2026-01-02"), "acme co");
    }

    #[test]
    fn collapses_whitespace_and_lowercases() {
        assert_eq!(canonicalize("  Amazon   Mktplace  "), "amazon mktplace");
    }

    #[test]
    fn idempotent() {
        for raw in [
            "STARBUCKS #1234",
            "POS WALMART #42 01/02/26",
            "SQ *JOES COFFEE",
            "plain vendor",
        ] {
            let once = canonicalize(raw);
            assert_eq!(canonicalize(&once), once, "raw = {raw}");
        }
    }

    #[test]
    fn hash_distinguishes_question_kinds() {
        assert_ne!(
            canonical_hash("normalize_vendor", "starbucks"),
            canonical_hash("suggest_gl_code", "starbucks")
        );
    }
}
