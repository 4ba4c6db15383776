//! Canonical request fingerprint: a stable SHA-256 digest over the
//! routing-relevant request fields, independent of key order or absent
//! fields. Two byte-identical canonicalizations must hash identically.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::InferRequest;

/// Recursively sort object keys so serialization is order-independent.
/// Numbers and strings are left as-is; `serde_json`'s default number
/// formatting is already stable for the values this service handles.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, child) in entries {
                sorted.insert(key.clone(), canonicalize(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Build the canonical payload `{product, prompt, media_url, metadata}`
/// that the fingerprint is computed over. Absent `media_url` canonicalizes
/// to an empty string and absent `metadata` to an empty object, matching
/// the routing-relevant fields the classifier itself reads.
pub fn canonical_payload(request: &InferRequest) -> Value {
    let mut map = Map::with_capacity(4);
    map.insert("product".into(), Value::String(request.product.clone()));
    map.insert("prompt".into(), Value::String(request.prompt.clone()));
    map.insert(
        "media_url".into(),
        Value::String(request.media_url.clone().unwrap_or_default()),
    );
    map.insert(
        "metadata".into(),
        Value::Object(request.metadata.clone()),
    );
    canonicalize(&Value::Object(map))
}

/// SHA-256 hex digest of the canonical, compact (no insignificant
/// whitespace) JSON encoding of `request`.
pub fn fingerprint(request: &InferRequest) -> String {
    let canonical = canonical_payload(request);
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(product: &str, prompt: &str, metadata: Value) -> InferRequest {
        InferRequest {
            product: product.to_string(),
            prompt: prompt.to_string(),
            media_url: None,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn identical_requests_produce_identical_fingerprints() {
        let a = request("synqra", "hello", json!({"b": 1, "a": 2}));
        let b = request("synqra", "hello", json!({"a": 2, "b": 1}));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn different_prompts_produce_different_fingerprints() {
        let a = request("synqra", "hello", json!({}));
        let b = request("synqra", "goodbye", json!({}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn missing_media_url_and_metadata_canonicalize_consistently() {
        let explicit = InferRequest {
            product: "noid".to_string(),
            prompt: "x".to_string(),
            media_url: Some(String::new()),
            metadata: Map::new(),
        };
        let implicit = InferRequest {
            product: "noid".to_string(),
            prompt: "x".to_string(),
            media_url: None,
            metadata: Map::new(),
        };
        assert_eq!(fingerprint(&explicit), fingerprint(&implicit));
    }

    #[test]
    fn fingerprint_is_lowercase_hex_sha256_length() {
        let a = request("synqra", "hello", json!({}));
        let digest = fingerprint(&a);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
