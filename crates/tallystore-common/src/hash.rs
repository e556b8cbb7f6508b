//! Content hashing for de-duplicated values
//!
//! Hashes are only used to narrow the search for an identical value; equality
//! of the stored bytes is always the final word.

use crate::types::HashAlgorithm;
use xxhash_rust::xxh64::xxh64;

/// Seed for all xxHash computations. Changing it invalidates existing stores.
const HASH_SEED: u64 = 0;

/// Hashes value bytes with the configured algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    #[must_use]
    pub const fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash `data`. Narrow algorithms are zero-extended to 64 bits.
    #[must_use]
    pub fn hash(&self, data: &[u8]) -> u64 {
        match self.algorithm {
            HashAlgorithm::Xx64 => xxh64(data, HASH_SEED),
            HashAlgorithm::Xx32 => {
                let h = xxh64(data, HASH_SEED);
                u64::from((h ^ (h >> 32)) as u32)
            }
            HashAlgorithm::Poly31 => u64::from(poly31(data) as u32),
        }
    }
}

/// `h = 31 * h + b` over the bytes, wrapping at 32 bits
fn poly31(data: &[u8]) -> i32 {
    data.iter()
        .fold(0i32, |h, &b| h.wrapping_mul(31).wrapping_add(i32::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_poly31_collisions() {
        let hasher = ContentHasher::new(HashAlgorithm::Poly31);
        assert_eq!(hasher.hash(b"Aa"), hasher.hash(b"BB"));
        assert_eq!(hasher.hash(b"AaAa"), hasher.hash(b"BBBB"));
        assert_eq!(hasher.hash(b"AaBB"), hasher.hash(b"BBAa"));
        assert_ne!(hasher.hash(b"Aa"), hasher.hash(b"Ab"));
    }

    #[test]
    fn test_xx_variants() {
        let wide = ContentHasher::new(HashAlgorithm::Xx64);
        let narrow = ContentHasher::new(HashAlgorithm::Xx32);
        assert_ne!(wide.hash(b"Aa"), wide.hash(b"BB"));
        assert!(narrow.hash(b"hello") <= u64::from(u32::MAX));
        assert_eq!(wide.hash(b""), xxh64(b"", HASH_SEED));
    }

    #[test]
    fn test_hash_deterministic() {
        let mut rng = rand::thread_rng();
        for algorithm in [HashAlgorithm::Xx64, HashAlgorithm::Xx32, HashAlgorithm::Poly31] {
            let hasher = ContentHasher::new(algorithm);
            let data: Vec<u8> = (0..64).map(|_| rng.r#gen()).collect();
            assert_eq!(hasher.hash(&data), hasher.hash(&data.clone()));
        }
    }
}
