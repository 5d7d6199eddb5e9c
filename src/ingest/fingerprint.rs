//! Statement shape fingerprint.
//!
//! SHA-256 over the normalized header row plus the classified shapes of the
//! next five data rows. Values are deliberately excluded: the fingerprint
//! identifies the *layout* a bank exports, not a particular month's data.

use crate::ingest::header::classify_cell;
use sha2::{Digest, Sha256};

pub const SAMPLE_ROWS: usize = 5;

pub fn shape_hash(header: &[String], data_rows: &[Vec<String>]) -> String {
    let mut hasher = Sha256::new();

    let normalized_header = header
        .iter()
        .map(|c| c.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("|");
    hasher.update(normalized_header.as_bytes());
    hasher.update(b"|");

    for row in data_rows.iter().take(SAMPLE_ROWS) {
        let shapes = row
            .iter()
            .map(|c| classify_cell(c).as_str())
            .collect::<Vec<_>>()
            .join(",");
        hasher.update(shapes.as_bytes());
        hasher.update(b";");
    }

    hex::encode(hasher.finalize())
}
