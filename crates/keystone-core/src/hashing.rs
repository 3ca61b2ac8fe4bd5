//! # Content Hashing
//!
//! Canonical content hashes and field-level diffs for entity payloads.
//!
//! `serde_json::Map` is ordered by key, so serializing a `Value` yields the
//! same bytes for the same content no matter what order fields were inserted
//! in. The hash is the hex SHA-256 of those bytes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the canonical JSON encoding of `data`.
pub fn content_hash(data: &Value) -> String {
    // Serializing a Value cannot fail (map keys are always strings).
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Lists the top-level fields that differ between `reference` and `other`.
///
/// Non-object payloads compare as a single value.
pub fn find_differences(reference: &Value, other: &Value) -> Vec<String> {
    let (Some(left), Some(right)) = (reference.as_object(), other.as_object()) else {
        return if reference == other {
            Vec::new()
        } else {
            vec!["Different values".to_string()]
        };
    };

    let mut differences = Vec::new();

    for (key, value) in left {
        match right.get(key) {
            None => differences.push(format!("Missing key '{}' in second dataset", key)),
            Some(v) if v != value => differences.push(format!("Different values for '{}'", key)),
            Some(_) => {}
        }
    }

    for key in right.keys() {
        if !left.contains_key(key) {
            differences.push(format!("Missing key '{}' in first dataset", key));
        }
    }

    differences
}
