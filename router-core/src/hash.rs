use crate::types::PartitionId;

/// Deterministic mapping of a correlation-key byte string to a partition
/// index (§4.1). Byte-level, stable across processes — `seahash` has no
/// per-process random seed, unlike `ahash`'s default `RandomState`, which
/// would break the determinism invariant (§8, scenario 1).
pub struct PartitionHasher;

impl PartitionHasher {
    /// `partitionIds[ abs(hash(correlationKey)) mod |partitionIds| ]`.
    ///
    /// Panics if `partition_ids` is empty — callers must check
    /// `SubscriptionCommandRouter::has_partition_ids()` first.
    pub fn partition_for(key: &[u8], partition_ids: &[PartitionId]) -> PartitionId {
        assert!(!partition_ids.is_empty(), "partition_ids must be non-empty");
        let index = Self::index_for(key, partition_ids.len());
        partition_ids[index]
    }

    /// The raw index computation, split out so the INT_MIN edge case (§8) is
    /// independently testable without needing a live partition list.
    pub fn index_for(key: &[u8], partition_count: usize) -> usize {
        assert!(partition_count > 0, "partition_count must be positive");
        let hash32 = Self::hash32(key);
        Self::abs_mod(hash32, partition_count)
    }

    /// Truncates the 64-bit `seahash` digest to the low 32 bits, interpreted
    /// as a signed `i32` — matching the 32-bit hash space the routing
    /// invariant (§3, §8) is phrased in terms of.
    fn hash32(key: &[u8]) -> i32 {
        (seahash::hash(key) & 0xFFFF_FFFF) as u32 as i32
    }

    /// Absolute value before modulo, widened to `i64` first so `i32::MIN`
    /// does not overflow on negation (R2: "take absolute value before
    /// modulo; treat INT_MIN specially").
    fn abs_mod(hash: i32, modulus: usize) -> usize {
        let widened: i64 = hash as i64;
        let magnitude: i64 = widened.abs();
        (magnitude % modulus as i64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_routes_to_same_partition_across_calls() {
        let ids = vec![PartitionId(1), PartitionId(3), PartitionId(5)];
        let a = PartitionHasher::partition_for(b"order-42", &ids);
        let b = PartitionHasher::partition_for(b"order-42", &ids);
        assert_eq!(a, b);
    }

    #[test]
    fn index_always_in_range() {
        let samples: &[&[u8]] = &[b"", b"a", b"order-42", b"\x00\x01\x02\x03", &[0xFFu8; 64]];
        for count in 1..=17usize {
            for key in samples {
                let idx = PartitionHasher::index_for(key, count);
                assert!(idx < count, "index {idx} out of range for modulus {count}");
            }
        }
    }

    #[test]
    fn int_min_hash_does_not_panic_and_is_in_range() {
        // Exercise the abs_mod edge case directly since finding a seahash
        // preimage of i32::MIN is not guaranteed.
        let idx = PartitionHasher::abs_mod(i32::MIN, 7);
        assert!(idx < 7);
    }

    #[test]
    fn empty_key_is_safe() {
        let ids = vec![PartitionId(0)];
        let idx = PartitionHasher::partition_for(b"", &ids);
        assert_eq!(idx, PartitionId(0));
    }
}
