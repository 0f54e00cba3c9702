use sha2::{Digest, Sha256};

/// Maximum number of lines kept by [`truncate_preview`]
pub const PREVIEW_MAX_LINES: usize = 40;
/// Maximum number of characters per line kept by [`truncate_preview`]
pub const PREVIEW_MAX_COLUMNS: usize = 80;
/// Marker appended wherever a preview was cut
pub const TRUNCATION_MARKER: &str = "[...]";

/// Hex-encoded SHA-256 of `data`
pub fn content_hash(data: impl AsRef<[u8]>) -> String {
    let digest = Sha256::digest(data.as_ref());
    format!("{:x}", digest)
}

/// Whether `key` has the shape of a hex-encoded SHA-256 digest
pub fn is_content_hash(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Cut text down to 40 lines x 80 columns, marking each cut with `[...]`.
pub fn truncate_preview(text: &str) -> String {
    let mut out = String::new();
    let mut lines = text.lines();

    for (idx, line) in lines.by_ref().enumerate() {
        if idx == PREVIEW_MAX_LINES {
            out.push_str(TRUNCATION_MARKER);
            out.push('\n');
            return out;
        }
        if line.chars().count() > PREVIEW_MAX_COLUMNS {
            out.extend(line.chars().take(PREVIEW_MAX_COLUMNS));
            out.push_str(TRUNCATION_MARKER);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !text.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    out
}

/// Lossy UTF-8 decoding bounded to `limit` bytes.
///
/// Returns the decoded text and whether anything was dropped.
pub fn bounded_text(bytes: &[u8], limit: usize) -> (String, bool) {
    if bytes.len() <= limit {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }
    (String::from_utf8_lossy(&bytes[..limit]).into_owned(), true)
}
