//! Content fingerprinting for change suppression.
//!
//! A fingerprint is a SHA-256 digest over the full byte content of a
//! document, hex-encoded. Two byte-identical documents always fingerprint
//! identically, so reconciliation can skip uploads whose remote record
//! already carries the same hash. Not a security primitive.

use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};

/// A hex-encoded SHA-256 digest of a document's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of raw content bytes.
    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute the fingerprint of text content.
    pub fn of_text(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Fingerprint {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = Fingerprint::of_text("hello world");
        let b = Fingerprint::of_text("hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_content_different_hash() {
        let a = Fingerprint::of_text("hello");
        let b = Fingerprint::of_text("world");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_length() {
        // SHA-256 hex is 64 characters
        let hash = Fingerprint::of_text("test");
        assert_eq!(hash.as_str().len(), 64);
    }

    #[test]
    fn test_bytes_and_text_agree() {
        assert_eq!(
            Fingerprint::of_bytes(b"# Note"),
            Fingerprint::of_text("# Note")
        );
    }
}
