//! Seeded 64-bit FNV-1a used for logspace-to-phylog token routing.
//!
//! Every node in a view must map a `user_logspace` to the same phylog, so
//! the hash is fully deterministic: no `RandomState`, no per-process keys.
//! The view's hash seed is folded into the initial basis, which keeps
//! distinct views from producing correlated token assignments.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Seeded FNV-1a over the little-endian bytes of `value`.
#[must_use]
pub fn hash64(value: u64, seed: u64) -> u64 {
    let mut hash = FNV_OFFSET_BASIS ^ seed;
    for byte in value.to_le_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_input() {
        assert_eq!(hash64(42, 7), hash64(42, 7));
    }

    #[test]
    fn seed_changes_output() {
        assert_ne!(hash64(42, 1), hash64(42, 2));
    }

    #[test]
    fn value_changes_output() {
        assert_ne!(hash64(1, 7), hash64(2, 7));
    }

    #[test]
    fn spreads_sequential_inputs() {
        // Sequential logspace ids should not collapse onto a few buckets.
        let mut buckets = std::collections::HashSet::new();
        for ls in 0u64..1000 {
            buckets.insert(hash64(ls, 0xfeed) % 128);
        }
        assert!(buckets.len() > 100, "only {} buckets hit", buckets.len());
    }
}
