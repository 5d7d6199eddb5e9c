//! File-kind and character-encoding sniffing for statement uploads.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Zipped spreadsheet (xlsx) or legacy xls.
    Spreadsheet,
    /// Delimited text (csv/tsv).
    Delimited,
}

/// Content sniff by magic bytes; anything that is not a known spreadsheet
/// container is treated as delimited text.
pub fn detect_kind(bytes: &[u8]) -> FileKind {
    if bytes.starts_with(b"PK\x03\x04") {
        return FileKind::Spreadsheet;
    }
    // Legacy OLE2 container (.xls)
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return FileKind::Spreadsheet;
    }
    FileKind::Delimited
}

/// Decode delimited text: honor a BOM when present, otherwise try strict
/// UTF-8 and fall back to Windows-1252 (the usual bank-export reality).
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some(stripped) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(stripped).into_owned();
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(&bytes[2..]);
        return text.into_owned();
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
        return text.into_owned();
    }

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}
