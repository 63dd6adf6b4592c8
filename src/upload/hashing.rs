//! Integrity hashing
//!
//! Chunk and whole-file digests are hex strings. The algorithm is chosen by
//! configuration; MD5 matches what the browser client computes, SHA-256 is
//! available for clients that can afford it.

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Digest algorithm used for chunk and artifact verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// Length of a hex-encoded digest
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    /// Check that `digest` looks like a hex digest of this algorithm
    pub fn is_valid_digest(self, digest: &str) -> bool {
        let digest = digest.trim();
        digest.len() == self.hex_len() && digest.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => f.write_str("md5"),
            Self::Sha256 => f.write_str("sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(format!("unsupported hash algorithm: {}", other)),
        }
    }
}

/// Incremental hasher over either algorithm
pub enum Digester {
    Md5(Md5),
    Sha256(Sha256),
}

impl Digester {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Self::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Compute the hex digest of `data`
pub fn compute_hash(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut digester = Digester::new(algorithm);
    digester.update(data);
    digester.finalize_hex()
}

/// Compare a client-supplied digest with a computed one, ignoring case
pub fn hashes_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            compute_hash(HashAlgorithm::Md5, b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            compute_hash(HashAlgorithm::Sha256, b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut digester = Digester::new(HashAlgorithm::Md5);
        digester.update(b"hel");
        digester.update(b"lo");
        assert_eq!(digester.finalize_hex(), compute_hash(HashAlgorithm::Md5, b"hello"));
    }

    #[test]
    fn test_hashes_match_ignores_case() {
        assert!(hashes_match("5D41402ABC4B2A76B9719D911017C592", "5d41402abc4b2a76b9719d911017c592"));
        assert!(!hashes_match("00", "5d41402abc4b2a76b9719d911017c592"));
    }

    #[test]
    fn test_digest_validation() {
        assert!(HashAlgorithm::Md5.is_valid_digest("5d41402abc4b2a76b9719d911017c592"));
        assert!(!HashAlgorithm::Md5.is_valid_digest("not-a-digest"));
        assert!(!HashAlgorithm::Sha256.is_valid_digest("5d41402abc4b2a76b9719d911017c592"));
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("MD5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!("sha-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }
}
