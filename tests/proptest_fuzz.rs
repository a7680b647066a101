//! Property-based tests (fuzzing) for input handling.
//!
//! Uses proptest to throw random and malformed identifiers, filenames and
//! cache envelopes at the engine and verify it only ever returns clean
//! errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;

use batch_engine::api::BatchSummary;
use batch_engine::cache::{decode_envelope, encode_envelope};
use batch_engine::validate::{format_file_size, sanitize_filename, validate_batch_id, validate_org_code};
use batch_engine::{BatchRecord, RemoteBatch};

// =============================================================================
// Strategies
// =============================================================================

fn valid_org_code() -> impl Strategy<Value = String> {
    "[A-Za-z0-9]{3,20}"
}

fn timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    // 1970 .. 2200, whole milliseconds as stored
    (0i64..7_258_118_400_000).prop_map(|ms| Utc.timestamp_millis_opt(ms).single().unwrap_or_default())
}

fn remote_batch() -> impl Strategy<Value = RemoteBatch> {
    (
        "[A-Za-z0-9_-]{1,40}",
        proptest::option::of(".{0,40}"),
        proptest::option::of(".{0,300}"),
        proptest::option::of(any::<u64>()),
        proptest::option::of("[a-z]{1,10}/[a-z0-9.+-]{1,20}"),
    )
        .prop_map(|(id, name, filename, size, content_type)| RemoteBatch {
            batch_id: id,
            batch_name: name,
            filename,
            size_bytes: size,
            content_type,
            created_at: None,
            metadata: serde_json::Map::new(),
        })
}

// =============================================================================
// Validators
// =============================================================================

proptest! {
    #[test]
    fn org_code_validation_never_panics(input in ".*") {
        let _ = validate_org_code(&input);
    }

    #[test]
    fn batch_id_validation_never_panics(input in ".*") {
        let _ = validate_batch_id(&input);
    }

    #[test]
    fn well_formed_org_codes_are_accepted(code in valid_org_code()) {
        prop_assert!(validate_org_code(&code).is_ok());
    }

    #[test]
    fn org_codes_with_separators_are_rejected(
        left in "[A-Za-z0-9]{2,9}",
        sep in "[ \\-_./:]",
        right in "[A-Za-z0-9]{2,9}",
    ) {
        let err = validate_org_code(&format!("{left}{sep}{right}")).unwrap_err();
        prop_assert_eq!(err.type_tag(), "ValidationError");
    }

    #[test]
    fn path_separators_never_pass_batch_id(prefix in "[a-z]{0,5}", sep in "[/\\\\]", suffix in "[a-z]{0,5}") {
        let id = format!("{prefix}{sep}{suffix}");
        prop_assert!(validate_batch_id(&id).is_err());
    }
}

// =============================================================================
// Filenames
// =============================================================================

proptest! {
    #[test]
    fn sanitized_filenames_are_safe(input in ".{0,600}") {
        let out = sanitize_filename(&input);

        prop_assert!(!out.is_empty());
        prop_assert!(out.chars().count() <= 255);
        prop_assert!(!out.contains(['<', '>', ':', '"', '/', '\\', '|', '?', '*']));
        prop_assert!(!out.starts_with(['.', ' ']));
        prop_assert!(!out.ends_with(['.', ' ']));
    }

    #[test]
    fn sanitizing_is_idempotent(input in ".{0,300}") {
        let once = sanitize_filename(&input);
        prop_assert_eq!(sanitize_filename(&once), once.clone());
    }

    #[test]
    fn remote_batches_always_build_a_record(remote in remote_batch()) {
        let record = BatchRecord::from_remote("ABC123", remote, Utc::now());
        prop_assert!(!record.filename.is_empty());
        prop_assert!(!record.batch_name.is_empty());
        prop_assert!(!record.content_type.is_empty());
        prop_assert!(!record.downloaded);

        // And always renders
        let summary = BatchSummary::from(&record);
        let json = serde_json::to_value(&summary).unwrap();
        prop_assert!(matches!(json["created_at"], Value::String(_)));
    }
}

// =============================================================================
// Cache envelope
// =============================================================================

proptest! {
    #[test]
    fn envelope_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let _ = decode_envelope(&bytes);
    }

    #[test]
    fn envelope_preserves_payload_and_expiry(
        expires_at in timestamp(),
        value in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let encoded = encode_envelope(expires_at, &value);
        let (decoded_at, decoded) = decode_envelope(&encoded).unwrap();
        prop_assert_eq!(decoded_at, expires_at);
        prop_assert_eq!(decoded, value.as_slice());
    }

    #[test]
    fn truncated_envelopes_are_rejected(
        expires_at in timestamp(),
        cut in 0usize..12,
    ) {
        let encoded = encode_envelope(expires_at, b"");
        prop_assert!(decode_envelope(&encoded[..cut.min(encoded.len() - 1)]).is_none());
    }
}

// =============================================================================
// Size formatting
// =============================================================================

proptest! {
    #[test]
    fn small_sizes_are_plain_bytes(size in 0u64..1024) {
        prop_assert_eq!(format_file_size(size), format!("{size} B"));
    }

    #[test]
    fn larger_sizes_have_two_decimals_and_a_unit(size in 1024u64..u64::MAX) {
        let formatted = format_file_size(size);
        let (number, unit) = formatted.split_once(' ').unwrap();
        prop_assert!(["KB", "MB", "GB"].contains(&unit));

        let (_, decimals) = number.split_once('.').unwrap();
        prop_assert_eq!(decimals.len(), 2);
        prop_assert!(number.parse::<f64>().unwrap() >= 1.0);
    }

    #[test]
    fn formatting_is_monotonic_within_a_unit(a in 1024u64..(1024 * 1024), b in 1024u64..(1024 * 1024)) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let parse = |s: String| s.trim_end_matches(" KB").parse::<f64>().unwrap();
        prop_assert!(parse(format_file_size(lo)) <= parse(format_file_size(hi)));
    }
}
