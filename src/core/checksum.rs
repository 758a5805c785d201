//! Integrity digests over protocol messages.
//!
//! The digest is MD5 over the canonical JSON form of the message: the
//! `checksum` key removed and object keys in lexicographic order. The
//! canonical form falls out of `serde_json::Map`, which is BTreeMap-backed
//! and therefore serializes its keys sorted. MD5 guards against corruption,
//! not tampering.

use serde_json::{Map, Value};

/// Digest of the canonical serialization of `value`, lowercase hex.
pub fn compute(value: &Value) -> String {
    format!("{:x}", md5::compute(value.to_string().as_bytes()))
}

/// Digest of a message object with its `checksum` field removed.
pub fn compute_for(map: &Map<String, Value>) -> String {
    let mut copy = map.clone();
    copy.remove("checksum");
    compute(&Value::Object(copy))
}

/// Insert (or replace) the `checksum` field of a message object.
pub fn stamp(map: &mut Map<String, Value>) {
    let digest = compute_for(map);
    map.insert("checksum".to_string(), Value::String(digest));
}

/// Verify the `checksum` field of a received message object. A missing or
/// non-string checksum fails verification.
pub fn verify(map: &Map<String, Value>) -> bool {
    match map.get("checksum").and_then(Value::as_str) {
        Some(received) => compute_for(map) == received,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Map<String, Value> {
        json!({
            "message_type": "HEARTBEAT",
            "sender_id": 2,
            "data": {"is_coordinator": false}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn test_stamp_and_verify() {
        let mut map = sample();
        stamp(&mut map);
        let digest = map["checksum"].as_str().unwrap();
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(verify(&map));
    }

    #[test]
    fn test_tampered_field_fails() {
        let mut map = sample();
        stamp(&mut map);
        map.insert("sender_id".to_string(), json!(3));
        assert!(!verify(&map));
    }

    #[test]
    fn test_zeroed_checksum_fails() {
        let mut map = sample();
        map.insert("checksum".to_string(), json!("0".repeat(32)));
        assert!(!verify(&map));
    }

    #[test]
    fn test_missing_checksum_fails() {
        assert!(!verify(&sample()));
    }

    #[test]
    fn test_checksum_field_excluded_from_digest() {
        // Re-stamping a stamped message must not change the digest.
        let mut map = sample();
        stamp(&mut map);
        let first = map["checksum"].as_str().unwrap().to_string();
        stamp(&mut map);
        assert_eq!(map["checksum"].as_str().unwrap(), first);
    }

    #[test]
    fn test_digest_is_deterministic() {
        let map = sample();
        assert_eq!(compute_for(&map), compute_for(&map));
        // Key order in the source does not matter: the canonical form sorts.
        let reordered = json!({
            "sender_id": 2,
            "data": {"is_coordinator": false},
            "message_type": "HEARTBEAT"
        })
        .as_object()
        .cloned()
        .unwrap();
        assert_eq!(compute_for(&map), compute_for(&reordered));
    }
}
