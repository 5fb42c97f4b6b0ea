//! Deterministic percentage bucketing.
//!
//! The bucket is FNV-1a (64 bit) over `feature_name ++ "::" ++ seed`,
//! reduced mod 100. Every SDK implementation computes the exact same hash;
//! this is the stickiness contract that keeps one subject's answer stable
//! across hosts, languages and restarts.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_append(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

pub(crate) fn bucket(feature_name: &str, seed: &str) -> u64 {
    let mut hash = fnv1a_append(FNV_OFFSET, feature_name.as_bytes());
    hash = fnv1a_append(hash, b"::");
    hash = fnv1a_append(hash, seed.as_bytes());
    hash % 100
}

/// Applies the clamp, then the bucket: `percent <= 0` is always off,
/// `percent >= 100` always on, anything between rolls the subject's bucket.
pub(crate) fn percentage_hit(feature_name: &str, seed: &str, percent: i32) -> bool {
    if percent <= 0 {
        return false;
    }
    if percent >= 100 {
        return true;
    }
    (bucket(feature_name, seed) as i32) < percent
}
