//! Checksum utilities for record integrity verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::Result;

/// SHA256 checksum of stored content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum of any serializable value via its JSON encoding.
    ///
    /// Maps are expected to be ordered (`BTreeMap`) so that equal content
    /// always yields the same bytes.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Combine an ordered sequence of checksums into one
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Checksum>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0.as_bytes());
            hasher.update(b"\n");
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that a value still hashes to this checksum
    pub fn verify<T: Serialize + ?Sized>(&self, value: &T) -> Result<bool> {
        Ok(Self::of(value)? == *self)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Checksum {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_consistency() {
        let value = json!({"name": "test", "count": 1});
        assert_eq!(Checksum::of(&value).unwrap(), Checksum::of(&value).unwrap());
    }

    #[test]
    fn test_checksum_different_content() {
        let a = Checksum::of(&json!({"name": "test1"})).unwrap();
        let b = Checksum::of(&json!({"name": "test2"})).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_checksum_verification() {
        let value = json!({"name": "test"});
        let checksum = Checksum::of(&value).unwrap();
        assert!(checksum.verify(&value).unwrap());
        assert!(!checksum.verify(&json!({"name": "other"})).unwrap());
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        let a = Checksum::from_bytes(b"a");
        let b = Checksum::from_bytes(b"b");
        assert_eq!(Checksum::combine([&a, &b]), Checksum::combine([&a, &b]));
        assert_ne!(Checksum::combine([&a, &b]), Checksum::combine([&b, &a]));
    }
}
