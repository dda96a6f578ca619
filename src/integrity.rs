//! Streaming content hashing
//!
//! Every file stores a content digest computed while its bytes are copied in.
//! The digest is recomputed on verified copy-out and by `verify`; there is no
//! caching, so a stale digest can never mask corrupted blocks. The algorithm
//! is recorded in the container header so future format versions can switch
//! without making old containers ambiguous.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Content hash algorithm recorded in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// SHA-256 (format version 1.x)
    Sha256,
}

impl HashAlgorithm {
    pub fn as_u8(self) -> u8 {
        match self {
            HashAlgorithm::Sha256 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// Incremental hasher fed block-sized chunks
///
/// Memory use is bounded by the chunk size the caller feeds in, never by the
/// total file size.
pub struct ChunkHasher {
    inner: Sha256,
}

impl ChunkHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => ChunkHasher {
                inner: Sha256::new(),
            },
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

/// Render a digest as lowercase hex
pub fn hex_digest(digest: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        let hasher = ChunkHasher::new(HashAlgorithm::Sha256);
        let digest = hasher.finalize();
        assert_eq!(
            hex_digest(&digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_known_vector() {
        let mut hasher = ChunkHasher::new(HashAlgorithm::Sha256);
        hasher.update(b"abc");
        assert_eq!(
            hex_digest(&hasher.finalize()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_chunked_matches_whole() {
        let data = vec![7u8; 10_000];

        let mut whole = ChunkHasher::new(HashAlgorithm::Sha256);
        whole.update(&data);

        let mut chunked = ChunkHasher::new(HashAlgorithm::Sha256);
        for chunk in data.chunks(1024) {
            chunked.update(chunk);
        }

        assert_eq!(whole.finalize(), chunked.finalize());
    }

    #[test]
    fn test_algorithm_round_trip() {
        assert_eq!(
            HashAlgorithm::from_u8(HashAlgorithm::Sha256.as_u8()),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(HashAlgorithm::from_u8(0), None);
        assert_eq!(HashAlgorithm::from_u8(255), None);
    }
}
