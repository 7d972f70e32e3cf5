//! SHA-256 helpers shared by the chunker, replication and reassembly paths.
//!
//! Digests are stored and compared as lowercase hex strings so they round
//! trip cleanly through logs, metadata rows and object-key nonces.

use openssl::sha::Sha256;

/// One-shot digest of a buffer already in memory.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = openssl::sha::sha256(data);
    hex::encode(hash)
}

/// Incremental hasher for streaming sources (whole-file digest while chunking).
pub struct StreamingDigest {
    hasher: Sha256,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finish())
    }
}
