//! 32-bit FNV-1a content hashing.
//!
//! Used in two places: collapsing a whole encoded frame to a fingerprint
//! so identical consecutive frames can be rejected before decode, and
//! per-tile change hashes inside the frame processor. Downstream display
//! clients run the same function for their own change detection, so the
//! algorithm is part of the contract.

/// FNV-1a 32-bit offset basis.
pub const FNV_OFFSET: u32 = 0x811c_9dc5;

/// FNV-1a 32-bit prime.
pub const FNV_PRIME: u32 = 0x0100_0193;

/// Hash a byte slice with 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    fnv1a32_continue(FNV_OFFSET, bytes)
}

/// Fold more bytes into an existing FNV-1a state.
///
/// Lets callers hash a region row by row without copying it into a
/// contiguous buffer first.
pub fn fnv1a32_continue(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Standard FNV-1a 32-bit test vectors.
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn continuation_matches_one_shot() {
        let whole = fnv1a32(b"hello world");
        let split = fnv1a32_continue(fnv1a32(b"hello "), b"world");
        assert_eq!(whole, split);
    }

    #[test]
    fn distinct_inputs_distinct_hashes() {
        assert_ne!(fnv1a32(b"frame-1"), fnv1a32(b"frame-2"));
    }
}
