//! Header-row detection and cell-shape classification.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Date,
    PostDate,
    Amount,
    Description,
    Merchant,
    Balance,
}

/// Case-insensitive synonym match against the known column vocabulary.
pub fn synonym_kind(cell: &str) -> Option<ColumnKind> {
    let c = cell.trim().to_lowercase();
    match c.as_str() {
        "date" | "transaction date" | "trans date" | "trans. date" | "value date" => {
            Some(ColumnKind::Date)
        }
        "post date" | "posted date" | "posting date" | "posted" => Some(ColumnKind::PostDate),
        "amount" | "amt" | "transaction amount" | "debit" | "credit" | "value" => {
            Some(ColumnKind::Amount)
        }
        "description" | "details" | "memo" | "narrative" | "transaction description"
        | "payee" => Some(ColumnKind::Description),
        "merchant" | "merchant name" | "vendor" | "payee name" => Some(ColumnKind::Merchant),
        "balance" | "running balance" | "running bal" => Some(ColumnKind::Balance),
        _ => None,
    }
}

/// The first row within the first ten whose cells hit at least three known
/// column synonyms.
pub fn find_header_row(rows: &[Vec<String>]) -> Option<usize> {
    for (idx, row) in rows.iter().take(10).enumerate() {
        let hits = row.iter().filter(|c| synonym_kind(c).is_some()).count();
        if hits >= 3 {
            return Some(idx);
        }
    }
    None
}

/// Classified cell type. Shapes, not values: two statements from the same
/// bank in different months fingerprint identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellShape {
    Empty,
    Numeric,
    DateIso,
    DateUs,
    Alpha,
    Mixed,
}

impl CellShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellShape::Empty => "empty",
            CellShape::Numeric => "numeric",
            CellShape::DateIso => "date_iso",
            CellShape::DateUs => "date_us",
            CellShape::Alpha => "alpha",
            CellShape::Mixed => "mixed",
        }
    }
}

pub fn classify_cell(cell: &str) -> CellShape {
    let c = cell.trim();
    if c.is_empty() {
        return CellShape::Empty;
    }

    let numeric_chars = |s: &str| {
        s.chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | ',' | '-' | '+' | '(' | ')' | '$'))
    };
    if numeric_chars(c) && c.chars().any(|ch| ch.is_ascii_digit()) && !c.contains('/') {
        // Distinguish 2026-01-02 from plain numbers
        if chrono::NaiveDate::parse_from_str(c, "%Y-%m-%d").is_ok() {
            return CellShape::DateIso;
        }
        return CellShape::Numeric;
    }

    if chrono::NaiveDate::parse_from_str(c, "%Y-%m-%d").is_ok() {
        return CellShape::DateIso;
    }
    for fmt in ["%m/%d/%Y", "%m/%d/%y", "%d/%m/%Y"] {
        if chrono::NaiveDate::parse_from_str(c, fmt).is_ok() {
            return CellShape::DateUs;
        }
    }

    if c.chars().all(|ch| ch.is_alphabetic() || ch.is_whitespace()) {
        return CellShape::Alpha;
    }
    CellShape::Mixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn header_found_by_synonyms() {
        let rows = vec![
            row(&["Acme Bank", "", ""]),
            row(&["Statement period", "Jan 2026", ""]),
            row(&["Post Date", "Description", "Amount"]),
            row(&["2026-01-02", "STARBUCKS #1234", "-4.75"]),
        ];
        assert_eq!(find_header_row(&rows), Some(2));
    }

    #[test]
    fn no_header_in_pure_data() {
        let rows = vec![
            row(&["2026-01-02", "STARBUCKS", "-4.75"]),
            row(&["2026-01-03", "AMAZON", "-19.99"]),
        ];
        assert_eq!(find_header_row(&rows), None);
    }

    #[test]
    fn header_beyond_first_ten_rows_is_missed() {
        let mut rows: Vec<Vec<String>> = (0..10).map(|i| row(&[&format!("x{i}"), "", ""])).collect();
        rows.push(row(&["Date", "Description", "Amount"]));
        assert_eq!(find_header_row(&rows), None);
    }

    #[test]
    fn shapes() {
        assert_eq!(classify_cell(""), CellShape::Empty);
        assert_eq!(classify_cell("-4.75"), CellShape::Numeric);
        assert_eq!(classify_cell("1,234.56"), CellShape::Numeric);
        assert_eq!(classify_cell("2026-01-02"), CellShape::DateIso);
        assert_eq!(classify_cell("01/02/2026"), CellShape::DateUs);
        assert_eq!(classify_cell("STARBUCKS"), CellShape::Alpha);
        assert_eq!(classify_cell("Amazon Mktplace*AB12"), CellShape::Mixed);
    }
}
