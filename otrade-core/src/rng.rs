//! Deterministic RNG hierarchy.
//!
//! A master seed generates deterministic sub-seeds for each
//! `(stream, symbol, index)` tuple. Sub-seeds are derived via BLAKE3 hashing,
//! independently of the order symbols are processed in, so paper sessions
//! replay identically however the per-symbol work is scheduled.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Deterministic RNG hierarchy.
///
/// The master seed is expanded into per-(stream, symbol, index) sub-seeds
/// using BLAKE3. A stream names the consumer (e.g. `"bars"`, `"ticks"`,
/// `"fills"`) so unrelated consumers never share a sequence.
#[derive(Debug, Clone)]
pub struct RngHierarchy {
    master_seed: u64,
}

impl RngHierarchy {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Derive a deterministic sub-seed for a specific (stream, symbol, index).
    pub fn sub_seed(&self, stream: &str, symbol: &str, index: u64) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.master_seed.to_le_bytes());
        hasher.update(stream.as_bytes());
        hasher.update(&[0]);
        hasher.update(symbol.as_bytes());
        hasher.update(&index.to_le_bytes());
        let hash = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(first)
    }

    /// Create a seeded StdRng from a sub-seed.
    pub fn rng_for(&self, stream: &str, symbol: &str, index: u64) -> StdRng {
        StdRng::seed_from_u64(self.sub_seed(stream, symbol, index))
    }
}
