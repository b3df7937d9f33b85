//! Seeded Shuffling
//!
//! Xorshift128+ seeded through SplitMix64. Every session owns a seed; the
//! desk is shuffled from it, so the same seed always deals the same game.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Xorshift128+ generator behind every desk shuffle.
///
/// # Example
///
/// ```
/// use codex_table::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// let (mut left, mut right) = ([1, 2, 3, 4, 5], [1, 2, 3, 4, 5]);
/// a.shuffle(&mut left);
/// b.shuffle(&mut right);
/// assert_eq!(left, right);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl DeterministicRng {
    /// Expand a 64-bit seed into generator state.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state = [splitmix64(&mut s), splitmix64(&mut s)];

        // xorshift is stuck at zero forever
        if state == [0, 0] {
            return Self { state: [1, 1] };
        }
        Self { state }
    }

    /// Next raw output.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let [s0, mut s1] = self.state;
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state = [s0.rotate_left(24) ^ s1 ^ (s1 << 16), s1.rotate_left(37)];
        result
    }

    /// Uniform-ish index in `[0, bound)`; `0` when `bound` is zero.
    #[inline]
    pub fn below(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        (self.next_u64() % bound as u64) as usize
    }

    /// Fisher-Yates, back to front.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }
}

#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Seed for session `session_id`.
///
/// The registry passes the bytes of its configured seed when one is set,
/// otherwise a fresh UUID, so fixed-seed servers deal reproducible games.
pub fn derive_session_seed(session_id: u32, entropy: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"CODEX_TABLE_SEED_V1");
    hasher.update(session_id.to_le_bytes());
    hasher.update(entropy);
    let digest = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}
