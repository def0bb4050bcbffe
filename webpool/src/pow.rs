//! Proof-of-work verification: algorithm selection and target comparison.
//!
//! The pool never computes CryptoNight or Lyra2 itself; production
//! deployments bind the chain's hashing library behind [`PowHasher`]. What
//! lives here is the part consensus cares about: which algorithm a height
//! calls for, and whether a 256-bit hash meets a difficulty.

use num_bigint::BigUint;

use crate::util;

/// PoW algorithm in force for a block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Cryptonight,
    Lyra2,
}

impl Algorithm {
    /// CryptoNight below the fork height, Lyra2 at and after it.
    pub fn for_height(height: u64, lyra2_block: u64) -> Self {
        if height < lyra2_block {
            Algorithm::Cryptonight
        } else {
            Algorithm::Lyra2
        }
    }

    /// Tag advertised to miners in job notifications.
    pub fn tag(self) -> &'static str {
        match self {
            Algorithm::Cryptonight => "cryptonight-webchain",
            Algorithm::Lyra2 => "lyra2-webchain",
        }
    }
}

/// Interpret a 32-byte digest as a 256-bit integer, little-endian per the
/// CryptoNote family convention.
pub fn hash_value(digest: &[u8; 32]) -> BigUint {
    BigUint::from_bytes_le(digest)
}

/// True iff `hash <= floor(2^256 / difficulty)`.
///
/// A zero difficulty can reach us when the template is momentarily empty and
/// PoW is checked before the header difficulty; it never validates.
pub fn check_hash(hash: &BigUint, difficulty: i64) -> bool {
    if difficulty <= 0 {
        return false;
    }
    let target = util::pow256() / BigUint::from(difficulty as u64);
    *hash <= target
}

/// Computes the PoW digest for a job.
///
/// Implementations must be pure CPU work: no locks, no suspension. The
/// digest is compared little-endian against the difficulty target.
pub trait PowHasher: Send + Sync {
    fn hash(&self, algo: Algorithm, seed: &[u8], nonce: u64) -> [u8; 32];
}

/// Development stand-in hasher: Keccak-256 over `algo tag ‖ seed ‖ nonce`.
///
/// Useful for integration work and local mining against a patched node. Real
/// deployments replace this with bindings to the chain's CryptoNight/Lyra2
/// implementation.
pub struct DevHasher;

impl PowHasher for DevHasher {
    fn hash(&self, algo: Algorithm, seed: &[u8], nonce: u64) -> [u8; 32] {
        use sha3::{Digest, Keccak256};

        let mut hasher = Keccak256::new();
        hasher.update(algo.tag().as_bytes());
        hasher.update(seed);
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_of(bytes: [u8; 32]) -> BigUint {
        hash_value(&bytes)
    }

    #[test]
    fn algorithm_switches_at_fork() {
        assert_eq!(Algorithm::for_height(0, 100), Algorithm::Cryptonight);
        assert_eq!(Algorithm::for_height(99, 100), Algorithm::Cryptonight);
        assert_eq!(Algorithm::for_height(100, 100), Algorithm::Lyra2);
        assert_eq!(Algorithm::for_height(0, 0), Algorithm::Lyra2);
    }

    #[test]
    fn zero_difficulty_never_validates() {
        assert!(!check_hash(&BigUint::from(0u8), 0));
        assert!(!check_hash(&BigUint::from(0u8), -5));
    }

    #[test]
    fn boundary_is_inclusive() {
        // For difficulty 2^32 the target is exactly 2^224.
        let diff = 1i64 << 32;
        let target = util::pow256() / BigUint::from(diff as u64);
        assert!(check_hash(&target, diff));
        assert!(!check_hash(&(target + BigUint::from(1u8)), diff));
        assert!(check_hash(&BigUint::from(0u8), diff));
    }

    #[test]
    fn little_endian_interpretation() {
        let mut low = [0u8; 32];
        low[0] = 1;
        assert_eq!(value_of(low), BigUint::from(1u8));

        let mut high = [0u8; 32];
        high[31] = 1;
        assert_eq!(value_of(high), BigUint::from(1u8) << 248);
    }

    #[test]
    fn dev_hasher_is_deterministic_and_algo_sensitive() {
        let seed = [0x11u8; 32];
        let a = DevHasher.hash(Algorithm::Cryptonight, &seed, 42);
        let b = DevHasher.hash(Algorithm::Cryptonight, &seed, 42);
        let c = DevHasher.hash(Algorithm::Lyra2, &seed, 42);
        let d = DevHasher.hash(Algorithm::Cryptonight, &seed, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
