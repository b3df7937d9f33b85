//! Snapshot Hashing
//!
//! Every snapshot carries the SHA-256 of the model it was taken from, and
//! client views recompute it before accepting the snapshot.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 digest of a game model.
pub type StateHash = [u8; 32];

/// Field-by-field hasher for the game model.
///
/// Order of updates is significant. Strings are length prefixed so adjacent
/// fields can never alias.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Start a hash under `domain`.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for session snapshots.
    pub fn for_snapshot() -> Self {
        Self::new(b"CODEX_TABLE_SNAPSHOT_V1")
    }

    /// Mix in one byte.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Mix in a `u32`, little-endian.
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Mix in a `u64`, little-endian.
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Mix in an `i32`, little-endian.
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Mix in an `i64`, little-endian.
    #[inline]
    pub fn update_i64(&mut self, value: i64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Mix in a flag as one byte.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Length-prefixed UTF-8.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Finish and return the digest.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

/// First eight bytes of a hash, hex encoded, for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..8])
}
