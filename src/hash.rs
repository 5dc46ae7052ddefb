//! Content-addressed hashing: canonical JSON serialization plus the two hash
//! functions built on top of it (`content_hash` for payload bytes,
//! `commit_hash` for the commit-identity tuple).
//!
//! `TraceHash` always uses SHA-256. Earlier Git-style tooling this crate was
//! adapted from kept the hash algorithm selectable (SHA-1 for legacy repos,
//! SHA-256 for newer ones); a content-addressed context store has no legacy
//! format to interoperate with, so the selector was dropped in favor of a
//! single fixed algorithm.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A SHA-256 digest, rendered as lowercase hex wherever it crosses a boundary
/// (storage, display, serde).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceHash([u8; 32]);

impl TraceHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute the hash of raw bytes directly, with no canonicalization.
    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TraceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceHash({})", self.to_hex())
    }
}

impl fmt::Display for TraceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for TraceHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(format!("invalid hash length: expected 64, got {}", s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| e.to_string())?;
        Ok(Self(bytes))
    }
}

impl Serialize for TraceHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TraceHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Recursively sort object keys so that serialization order never depends on
/// insertion order (e.g. `HashMap` iteration order).
pub fn canonicalize_json(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items.iter_mut() {
                canonicalize_json(item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = serde_json::Map::with_capacity(entries.len());
            for (key, mut value) in entries {
                canonicalize_json(&mut value);
                sorted.insert(key, value);
            }
            *map = sorted;
        }
        _ => {}
    }
}

/// Serialize `object` to canonical JSON bytes: sorted keys, no insignificant
/// whitespace. This is the byte representation that both `content_hash` and
/// `commit_hash` operate over.
pub fn canonical_bytes<T: Serialize>(object: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(object)?;
    canonicalize_json(&mut value);
    serde_json::to_vec(&value)
}

/// Hash of the canonical-JSON serialization of any serializable value.
pub fn canonical_hash<T: Serialize>(object: &T) -> Result<TraceHash, serde_json::Error> {
    let bytes = canonical_bytes(object)?;
    Ok(TraceHash::of_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Serialize)]
    struct MapWrapper {
        map: HashMap<String, String>,
    }

    #[test]
    fn canonical_hash_is_order_independent() {
        let mut map_a = HashMap::new();
        map_a.insert("b".to_string(), "2".to_string());
        map_a.insert("a".to_string(), "1".to_string());

        let mut map_b = HashMap::new();
        map_b.insert("a".to_string(), "1".to_string());
        map_b.insert("b".to_string(), "2".to_string());

        let hash_a = canonical_hash(&MapWrapper { map: map_a }).expect("hash");
        let hash_b = canonical_hash(&MapWrapper { map: map_b }).expect("hash");

        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.to_hex().len(), 64);
    }

    #[test]
    fn from_str_round_trips_to_hex() {
        let hash = TraceHash::of_bytes(b"hello");
        let parsed: TraceHash = hash.to_hex().parse().expect("parse");
        assert_eq!(hash, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("deadbeef".parse::<TraceHash>().is_err());
    }
}
