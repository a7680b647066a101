// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Input checks and display helpers.
//!
//! Identifier validation runs before any I/O, so a malformed org code never
//! costs a rate-limit token.
//!
//! ```
//! use batch_engine::validate::{format_file_size, sanitize_filename, validate_org_code};
//!
//! assert!(validate_org_code("KALYAN").is_ok());
//! assert!(validate_org_code("no spaces").is_err());
//! assert_eq!(sanitize_filename("week 1: notes?.pdf"), "week 1_ notes_.pdf");
//! assert_eq!(format_file_size(1536), "1.50 KB");
//! ```

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BatchError, Result};

static ORG_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]{3,20}$").expect("valid regex")
});

static BATCH_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.\-]{1,128}$").expect("valid regex")
});

const MAX_FILENAME_CHARS: usize = 255;
const UNNAMED_FILE: &str = "unnamed_file";

pub fn validate_org_code(org_code: &str) -> Result<()> {
    if org_code.is_empty() {
        return Err(BatchError::validation("org_code", org_code, "Organization code cannot be empty"));
    }
    if !ORG_CODE.is_match(org_code) {
        return Err(BatchError::validation(
            "org_code",
            org_code,
            "Organization code must be 3-20 alphanumeric characters",
        ));
    }
    Ok(())
}

pub fn validate_batch_id(batch_id: &str) -> Result<()> {
    if batch_id.is_empty() {
        return Err(BatchError::validation("batch_id", batch_id, "Batch id cannot be empty"));
    }
    // Dots are allowed, but a bare dot path is never a real id
    if !BATCH_ID.is_match(batch_id) || batch_id.chars().all(|c| c == '.') {
        return Err(BatchError::validation(
            "batch_id",
            batch_id,
            "Batch id must be 1-128 characters of letters, digits, '_', '.' or '-'",
        ));
    }
    Ok(())
}

/// Make an upstream filename safe to hand to a filesystem.
///
/// `<>:"/\|?*` become `_`, leading and trailing dots and spaces are
/// stripped, and names longer than 255 characters are cut from the stem so
/// the extension survives.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let replaced: String = filename
        .chars()
        .map(|c| if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') { '_' } else { c })
        .collect();
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');

    if trimmed.is_empty() {
        return UNNAMED_FILE.to_string();
    }
    if trimmed.chars().count() <= MAX_FILENAME_CHARS {
        return trimmed.to_string();
    }

    let ext = Path::new(trimmed)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .filter(|e| e.chars().count() < MAX_FILENAME_CHARS)
        .unwrap_or_default();
    let stem_len = trimmed.chars().count() - ext.chars().count();
    let keep = MAX_FILENAME_CHARS - ext.chars().count();
    let stem: String = trimmed.chars().take(stem_len.min(keep)).collect();
    // The cut may land on a dot or space
    let stem = stem.trim_end_matches(|c| c == '.' || c == ' ');
    format!("{stem}{ext}")
}

/// MIME type guessed from the filename extension.
#[must_use]
pub fn content_type_for(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Human-readable size: bytes below 1 KiB, then KB / MB / GB to two decimals.
#[must_use]
pub fn format_file_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size = size_bytes as f64;
    if size_bytes < 1024 {
        format!("{size_bytes} B")
    } else if size < MB {
        format!("{:.2} KB", size / KB)
    } else if size < GB {
        format!("{:.2} MB", size / MB)
    } else {
        format!("{:.2} GB", size / GB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_code_rules() {
        assert!(validate_org_code("ABC123").is_ok());
        assert!(validate_org_code("abc").is_ok());
        assert!(validate_org_code("A".repeat(20).as_str()).is_ok());

        for bad in ["", "AB", "ABC-123", "A".repeat(21).as_str(), "ÄBC"] {
            let err = validate_org_code(bad).unwrap_err();
            assert_eq!(err.type_tag(), "ValidationError", "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_empty_org_code_message() {
        match validate_org_code("") {
            Err(BatchError::Validation { reason, .. }) => {
                assert_eq!(reason, "Organization code cannot be empty");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_batch_id_rules() {
        assert!(validate_batch_id("b-1_2.v3").is_ok());
        assert!(validate_batch_id("").is_err());
        assert!(validate_batch_id("..").is_err());
        assert!(validate_batch_id("a/b").is_err());
        assert!(validate_batch_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a<b>c:d\"e/f\\g|h?i*j.pdf"), "a_b_c_d_e_f_g_h_i_j.pdf");
        assert_eq!(sanitize_filename("  ..report.pdf.. "), "report.pdf");
        assert_eq!(sanitize_filename("..."), "unnamed_file");
        assert_eq!(sanitize_filename(""), "unnamed_file");
    }

    #[test]
    fn test_sanitize_long_name_keeps_extension() {
        let long = format!("{}.pdf", "n".repeat(400));
        let out = sanitize_filename(&long);
        assert_eq!(out.chars().count(), 255);
        assert!(out.ends_with(".pdf"));
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(content_type_for("notes.pdf"), "application/pdf");
        assert_eq!(content_type_for("slides.PNG"), "image/png");
        assert_eq!(content_type_for("mystery"), "application/octet-stream");
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(1023), "1023 B");
        assert_eq!(format_file_size(1024), "1.00 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
