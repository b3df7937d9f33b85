//! Core deterministic primitives.
//!
//! Seeded shuffling and state hashing. Nothing in here knows about cards or
//! connections.

#![warn(missing_docs)]

pub mod rng;
pub mod hash;

pub use rng::DeterministicRng;
pub use hash::{StateHash, StateHasher};
