//! Idempotency fingerprints.
//!
//! A fingerprint is the SHA-256 of a canonical JSON rendering of an
//! [`EventDescriptor`]. Canonicalization sorts object keys, renders object
//! identifiers as a sorted string array, the revision as an unsigned integer,
//! and integral floats as integers. Two receivers given semantically identical
//! descriptors always agree on the fingerprint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::EventDescriptor;
use crate::model::descriptor::integral;

/// Bumped if the canonical form ever changes, so old and new keys never alias.
const DOMAIN: &[u8] = b"proxymod-dispatcher/receive-task/v1\n";

/// Hex-encoded SHA-256 idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const LEN: usize = 64;

    /// Parse a previously computed fingerprint (64 lowercase hex chars).
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == Self::LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::NotFound(format!("fingerprint {s}")))
        }
    }

    /// Wrap a value read back from the store.
    pub(crate) fn from_stored(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading 16 characters, for listings. Whole value if shorter.
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of a validated descriptor.
pub fn fingerprint(descriptor: &EventDescriptor) -> Fingerprint {
    let canonical = canonical_form(descriptor);
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update(canonical.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// The canonical JSON text a descriptor is hashed over.
pub fn canonical_form(descriptor: &EventDescriptor) -> String {
    let mut out = String::with_capacity(128);
    out.push_str("{\"extra\":");
    write_canonical(&Value::Object(descriptor.extra().clone()), &mut out);
    out.push_str(",\"object\":");
    let objects = Value::Array(
        descriptor
            .objects()
            .iter()
            .cloned()
            .map(Value::String)
            .collect(),
    );
    write_canonical(&objects, &mut out);
    out.push_str(",\"rev\":");
    out.push_str(&descriptor.rev().to_string());
    out.push('}');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => match integral(n) {
            Some(i) => out.push_str(&i.to_string()),
            None => out.push_str(&n.to_string()),
        },
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json's string escaping is deterministic.
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_form_tolerates_short_stored_values() {
        let full = Fingerprint::parse(&"ab".repeat(32)).unwrap();
        assert_eq!(full.short(), "abababababababab");
        assert_eq!(Fingerprint::from_stored("abc".to_string()).short(), "abc");
        assert_eq!(Fingerprint::from_stored(String::new()).short(), "");
    }

    fn fp(value: Value) -> Fingerprint {
        fingerprint(&EventDescriptor::from_json(value).unwrap())
    }

    #[test]
    fn fingerprint_is_fixed_length_hex() {
        let f = fp(json!({"object": "A", "rev": 1}));
        assert_eq!(f.as_str().len(), Fingerprint::LEN);
        assert!(Fingerprint::parse(f.as_str()).is_ok());
    }

    #[test]
    fn field_order_does_not_matter() {
        let a = fp(json!({"object": "A", "rev": 1, "meta": {"x": 1, "y": [1, 2]}}));
        let b = fp(json!({"meta": {"y": [1, 2], "x": 1}, "rev": 1, "object": "A"}));
        assert_eq!(a, b);
    }

    #[test]
    fn equivalent_types_fingerprint_identically() {
        let base = fp(json!({"object": "42", "rev": 3}));
        assert_eq!(base, fp(json!({"object": 42, "rev": "3"})));
        assert_eq!(base, fp(json!({"object": [42.0], "rev": 3.0})));
        assert_eq!(base, fp(json!({"object": ["42", 42], "rev": 3})));
    }

    #[test]
    fn identifier_sets_are_unordered() {
        let a = fp(json!({"object": ["b", "a"], "rev": 1}));
        let b = fp(json!({"object": ["a", "b"], "rev": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_events_do_not_alias() {
        let base = fp(json!({"object": "A", "rev": 1}));
        assert_ne!(base, fp(json!({"object": "A", "rev": 2})));
        assert_ne!(base, fp(json!({"object": "B", "rev": 1})));
        assert_ne!(base, fp(json!({"object": ["A", "B"], "rev": 1})));
        assert_ne!(base, fp(json!({"object": "A", "rev": 1, "source": "x"})));
    }

    #[test]
    fn canonical_form_is_stable() {
        let d = EventDescriptor::from_json(json!({"rev": 1, "object": "A", "z": 1.0, "a": "q"}))
            .unwrap();
        assert_eq!(
            canonical_form(&d),
            r#"{"extra":{"a":"q","z":1},"object":["A"],"rev":1}"#
        );
    }

    #[test]
    fn parse_rejects_non_fingerprints() {
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"G".repeat(64)).is_err());
        assert!(Fingerprint::parse(&"A".repeat(64)).is_err());
    }
}
