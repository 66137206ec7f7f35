// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Key hashing.
//!
//! The cache takes the hash and equality functions from the caller, since
//! only the caller knows the shape of its keys. Whatever the user hash
//! returns is passed through an avalanche [`mix`] before indexing, so a weak
//! hash combined with the prime table length still spreads across slots.

/// User-supplied hash over raw key bytes.
///
/// Must be deterministic across processes: the hash is stored in the shared
/// segment and compared by every attached process. Rust's default `HashMap`
/// hasher is randomized per process and must not be used here.
pub type HashFn = fn(&[u8]) -> u32;

/// User-supplied key equality. Called with the stored key bytes and the
/// probe key bytes, in that order.
pub type EqFn = fn(&[u8], &[u8]) -> bool;

/// FNV-1a over the key bytes. Deterministic, dependency-free, and good
/// enough for short binary keys; use as the default [`HashFn`].
pub fn fnv1a_hash(key: &[u8]) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for &b in key {
        h ^= b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

/// Plain byte equality; the default [`EqFn`].
pub fn bytes_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

/// Avalanche step applied on top of the user hash, independent of its
/// quality (logic taken from the java 1.4 Hashtable source). The unsigned
/// shift-or pairs are 32-bit rotates.
#[inline]
pub(crate) fn mix(mut h: u32) -> u32 {
    h = h.wrapping_add(!(h << 9));
    h ^= h.rotate_right(14);
    h = h.wrapping_add(h << 4);
    h ^= h.rotate_right(10);
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        // Standard FNV-1a test values.
        assert_eq!(fnv1a_hash(b""), 0x811c9dc5);
        assert_eq!(fnv1a_hash(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_hash(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn mix_is_deterministic() {
        for h in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(mix(h), mix(h));
        }
    }

    #[test]
    fn mix_spreads_sequential_inputs() {
        // Sequential user hashes (a worst case for identity hashes) should
        // land in distinct mixed values.
        let mixed: std::collections::HashSet<u32> = (0..1000u32).map(mix).collect();
        assert_eq!(mixed.len(), 1000);
    }
}
