use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic hash of a canonicalized (chain, method, params) tuple.
/// Two logically-identical calls always produce the same fingerprint
/// regardless of key order or whitespace in the original params value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn new(chain: &str, method: &str, params: &Value) -> Self {
        let canonical = canonicalize(params);
        let mut hasher = Sha256::new();
        hasher.update(chain.as_bytes());
        hasher.update(b"\0");
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical.as_bytes());
        RequestFingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce a stable textual form of a JSON value: object keys sorted
/// recursively, arrays left in order (order is meaningful for RPC params).
fn canonicalize(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_stable_under_key_reorder() {
        let a = RequestFingerprint::new(
            "ethereum",
            "eth_call",
            &json!({"to": "0x1", "data": "0x2"}),
        );
        let b = RequestFingerprint::new(
            "ethereum",
            "eth_call",
            &json!({"data": "0x2", "to": "0x1"}),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_differs_across_chains() {
        let a = RequestFingerprint::new("ethereum", "eth_blockNumber", &json!([]));
        let b = RequestFingerprint::new("bitcoin", "eth_blockNumber", &json!([]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_preserves_array_order() {
        let a = RequestFingerprint::new("ethereum", "m", &json!([1, 2]));
        let b = RequestFingerprint::new("ethereum", "m", &json!([2, 1]));
        assert_ne!(a, b);
    }
}
