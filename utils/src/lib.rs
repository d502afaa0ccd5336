//! # CocoaTrack Utilities
//!
//! Hashing, name normalization and input-shape validation shared across
//! the sync engine crates.

use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Compute the idempotency fingerprint of an operation:
/// SHA-256 over `user_id:table:type:client_id:created_at`.
///
/// `created_at` must be pre-rendered (RFC 3339) so the fingerprint is
/// stable across enqueue retries.
#[must_use]
pub fn compute_idempotency_key(
    user_id: &str,
    table: &str,
    op_type: &str,
    client_id: &str,
    created_at: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(table.as_bytes());
    hasher.update(b":");
    hasher.update(op_type.as_bytes());
    hasher.update(b":");
    hasher.update(client_id.as_bytes());
    hasher.update(b":");
    hasher.update(created_at.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize an entity name for prefix search: lowercase, diacritics
/// stripped (NFD, combining marks dropped), interior whitespace collapsed,
/// trimmed.
///
/// Idempotent: `normalize_name(normalize_name(s)) == normalize_name(s)`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let stripped: String = name
        .nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();

    let mut out = String::with_capacity(stripped.len());
    let mut pending_space = false;
    for c in stripped.to_lowercase().chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Generate a new client-side record id (UUID v4).
#[must_use]
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Accepts only canonical version-4 UUIDs.
#[must_use]
pub fn is_valid_uuid_v4(value: &str) -> bool {
    match Uuid::parse_str(value) {
        Ok(uuid) => uuid.get_version_num() == 4,
        Err(_) => false,
    }
}

static PHONE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\+?[0-9]{8,15}$").expect("phone regex"));

/// Phone-number shape check. Separators (spaces, dashes, dots) are
/// stripped before matching; 8 to 15 digits, optional leading `+`.
#[must_use]
pub fn is_valid_phone(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.'))
        .collect();
    PHONE_RE.is_match(&compact)
}

static CNI_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Z]{0,2}[0-9]{8,12}$").expect("cni regex"));

/// National identity card (CNI) shape check: optional country prefix
/// followed by 8 to 12 digits.
#[must_use]
pub fn is_valid_cni(value: &str) -> bool {
    CNI_RE.is_match(&value.to_uppercase())
}

/// True for finite, strictly positive numbers.
#[must_use]
pub fn is_positive_number(value: &serde_json::Value) -> bool {
    value.as_f64().is_some_and(|n| n.is_finite() && n > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = compute_idempotency_key("u1", "deliveries", "CREATE", "c1", "2026-01-01T00:00:00Z");
        let b = compute_idempotency_key("u1", "deliveries", "CREATE", "c1", "2026-01-01T00:00:00Z");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_idempotency_key_differs_per_component() {
        let base = compute_idempotency_key("u1", "deliveries", "CREATE", "c1", "t0");
        assert_ne!(
            base,
            compute_idempotency_key("u2", "deliveries", "CREATE", "c1", "t0")
        );
        assert_ne!(
            base,
            compute_idempotency_key("u1", "planteurs", "CREATE", "c1", "t0")
        );
        assert_ne!(
            base,
            compute_idempotency_key("u1", "deliveries", "UPDATE", "c1", "t0")
        );
        assert_ne!(
            base,
            compute_idempotency_key("u1", "deliveries", "CREATE", "c2", "t0")
        );
        assert_ne!(
            base,
            compute_idempotency_key("u1", "deliveries", "CREATE", "c1", "t1")
        );
    }

    #[test]
    fn test_normalize_strips_accents() {
        assert_eq!(normalize_name("Kouamé N'Guessan"), "kouame n'guessan");
        assert_eq!(normalize_name("Adjoumani  Yéboué"), "adjoumani yeboue");
        assert_eq!(normalize_name("  SÉKA   pélagie "), "seka pelagie");
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_name("a\t b\n  c"), "a b c");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn test_generated_client_id_is_uuid_v4() {
        assert!(is_valid_uuid_v4(&generate_client_id()));
    }

    #[test]
    fn test_uuid_validation_rejects_non_v4() {
        // v1-style UUID (version nibble = 1)
        assert!(!is_valid_uuid_v4("9073926b-1000-1000-8000-00805f9b34fb"));
        assert!(!is_valid_uuid_v4("not-a-uuid"));
        assert!(!is_valid_uuid_v4(""));
        assert!(is_valid_uuid_v4("9073926b-929f-4000-8000-c8d5259b3bc3"));
    }

    #[test]
    fn test_phone_validation() {
        assert!(is_valid_phone("+2250701020304"));
        assert!(is_valid_phone("07 01 02 03 04"));
        assert!(is_valid_phone("07-01-02-03-04"));
        assert!(!is_valid_phone("12345"));
        assert!(!is_valid_phone("call me"));
    }

    #[test]
    fn test_cni_validation() {
        assert!(is_valid_cni("CI004123456"));
        assert!(is_valid_cni("123456789"));
        assert!(is_valid_cni("ci004123456"));
        assert!(!is_valid_cni("CI-004"));
        assert!(!is_valid_cni(""));
    }

    #[test]
    fn test_positive_number() {
        assert!(is_positive_number(&serde_json::json!(12.5)));
        assert!(!is_positive_number(&serde_json::json!(0)));
        assert!(!is_positive_number(&serde_json::json!(-3)));
        assert!(!is_positive_number(&serde_json::json!("12")));
    }

    proptest! {
        #[test]
        fn test_normalize_is_idempotent(name in "\\PC{0,80}") {
            let once = normalize_name(&name);
            let twice = normalize_name(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_normalize_output_shape(name in "\\PC{0,80}") {
            let norm = normalize_name(&name);
            prop_assert!(!norm.starts_with(' '));
            prop_assert!(!norm.ends_with(' '));
            prop_assert!(!norm.contains("  "));
            prop_assert_eq!(norm.to_lowercase(), norm.clone());
            prop_assert!(norm.chars().all(|c| !unicode_normalization::char::is_combining_mark(c)));
        }

        #[test]
        fn test_idempotency_key_shape(
            user in "[a-z0-9-]{1,20}",
            client in "[a-z0-9-]{1,36}",
        ) {
            let key = compute_idempotency_key(&user, "deliveries", "CREATE", &client, "t0");
            prop_assert_eq!(key.len(), 64);
            prop_assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
