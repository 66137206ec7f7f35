// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment layout.
//!
//! A cache segment is statically partitioned into four zones:
//!
//! ```text
//! +--------+---------------+----------------+--------------+
//! | Header | Primary slots | Collision pool | Bucket store |
//! +--------+---------------+----------------+--------------+
//! ```
//!
//! - **Header**: capacity, record size, live-entry count, resource ids.
//! - **Primary slots**: `capacity` [`Entry`] records, one per hash bucket.
//! - **Collision pool**: `capacity` more [`Entry`] records, used only as
//!   overflow storage; sized equal to capacity so the table can in the
//!   worst case degenerate to a single full chain.
//! - **Bucket store**: `capacity` value records, each a [`BucketHeader`]
//!   followed by `max_value_size` payload bytes.
//!
//! All cross-references between records are integer indexes, so the layout
//! is position-independent: each process may map the segment at a different
//! address. [`SegmentLayout`] turns indexes into pointers at the point of
//! use and is the only place that does pointer arithmetic on the region.

use core::mem;

use crate::error::CacheError;

/*
Credit for primes table: Aaron Krowne
 http://br.endernet.org/~akrowne/
 http://planetmath.org/encyclopedia/GoodHashTablePrimes.html
*/
const PRIMES: [u32; 26] = [
    53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613, 393241, 786433,
    1572869, 3145739, 6291469, 12582917, 25165843, 50331653, 100663319, 201326611, 402653189,
    805306457, 1610612741,
];

/// Absolute ceiling on the requested capacity.
pub(crate) const MAX_CAPACITY: u32 = 1 << 30;

/// Maximum key length in bytes. Keys are stored inline in each [`Entry`],
/// so this is fixed at compile time.
pub const MAX_KEY_SIZE: usize = 512;

/// End-of-chain sentinel for [`Entry::next`].
pub(crate) const NIL: u32 = u32::MAX;

/// Size of the header zone. Larger than [`TableHeader`] needs, which leaves
/// slack for additions and keeps the later zones 8-aligned.
const HEADER_ZONE_SIZE: usize = 64;

/// One per segment, shared by all attached processes.
///
/// `capacity` and `max_value_size` are written once by whichever process
/// first initializes the segment and are immutable afterwards; re-opens
/// validate against them. `entry_count` is the live-entry count and never
/// exceeds `capacity`. All fields are read and written only under the lock.
#[repr(C)]
pub(crate) struct TableHeader {
    pub capacity: u32,
    pub max_value_size: u32,
    pub entry_count: u32,
    /// Index into the prime table that produced `capacity`.
    pub prime_index: u32,
    /// IPC key the segment and semaphore set were derived from.
    pub shm_key: i32,
    /// Id of the semaphore set guarding this segment.
    pub sem_id: i32,
}

/// A slot in the primary array or the collision pool.
///
/// `Copy` so a chain node can be spliced into a primary slot with a plain
/// struct assignment on removal.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct Entry {
    /// 0 = free, 1 = live.
    pub used: u32,
    /// Valid bytes in `key`.
    pub key_len: u32,
    /// Mixed hash of the key, stored to short-circuit byte comparison.
    pub hash: u32,
    /// Index of the next entry in the collision chain, or [`NIL`].
    pub next: u32,
    /// Index of the bucket holding this entry's value.
    pub bucket: u32,
    /// Valid bytes in that bucket.
    pub value_len: u32,
    /// This entry's own index within its array, so a relocated entry still
    /// knows where it lives.
    pub position: u32,
    /// Creation time, whole seconds since the epoch. Coarse on purpose:
    /// eviction is approximate age-based cleaning, not exact LRU.
    pub created_sec: i64,
    /// Inline copy of the key bytes.
    pub key: [u8; MAX_KEY_SIZE],
}

impl Entry {
    #[inline]
    pub fn key_bytes(&self) -> &[u8] {
        &self.key[..self.key_len as usize]
    }
}

/// Used-flag ahead of each bucket's payload bytes.
#[repr(C)]
pub(crate) struct BucketHeader {
    pub used: u32,
}

/// Round `n` up to the next multiple of `align` (a power of two).
const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

// Compile-time checks. A zeroed region must be a valid empty table, and the
// zone arithmetic below assumes 8-aligned strides.
const _: () = assert!(mem::size_of::<TableHeader>() <= HEADER_ZONE_SIZE);
const _: () = assert!(HEADER_ZONE_SIZE % mem::align_of::<Entry>() == 0);
const _: () = assert!(mem::size_of::<Entry>() % mem::align_of::<Entry>() == 0);
const _: () = assert!(mem::align_of::<Entry>() == 8);

/// Computed zone offsets for one segment. All offsets are relative to the
/// region base; nothing here touches memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SegmentLayout {
    pub capacity: u32,
    pub prime_index: u32,
    pub max_value_size: u32,
    bucket_stride: usize,
    primary_offset: usize,
    collision_offset: usize,
    bucket_offset: usize,
    total_size: usize,
}

impl SegmentLayout {
    /// Computes the layout for the smallest prime capacity that satisfies
    /// `min_capacity` and values up to `max_value_size` bytes.
    pub fn compute(min_capacity: u32, max_value_size: u32) -> Result<Self, CacheError> {
        if min_capacity > MAX_CAPACITY {
            return Err(CacheError::CapacityTooLarge(min_capacity));
        }
        // The table ends past 2^30, so this always finds a prime.
        let (prime_index, capacity) = PRIMES
            .iter()
            .enumerate()
            .find(|&(_, &p)| p >= min_capacity)
            .map(|(i, &p)| (i as u32, p))
            .ok_or(CacheError::CapacityTooLarge(min_capacity))?;

        let entries = capacity as usize * mem::size_of::<Entry>();
        let bucket_stride = align_up(
            mem::size_of::<BucketHeader>() + max_value_size as usize,
            mem::align_of::<Entry>(),
        );
        let primary_offset = HEADER_ZONE_SIZE;
        let collision_offset = primary_offset + entries;
        let bucket_offset = collision_offset + entries;
        let total_size = bucket_offset + capacity as usize * bucket_stride;

        Ok(SegmentLayout {
            capacity,
            prime_index,
            max_value_size,
            bucket_stride,
            primary_offset,
            collision_offset,
            bucket_offset,
            total_size,
        })
    }

    /// Total region size in bytes (before page alignment).
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// # Safety
    /// `base` must point to a mapped region of at least `total_size` bytes.
    #[inline]
    pub unsafe fn header(&self, base: *mut u8) -> *mut TableHeader {
        base as *mut TableHeader
    }

    /// # Safety
    /// `base` as in [`Self::header`]; `index` must be below `capacity`.
    #[inline]
    pub unsafe fn primary_entry(&self, base: *mut u8, index: u32) -> *mut Entry {
        base.add(self.primary_offset + index as usize * mem::size_of::<Entry>()) as *mut Entry
    }

    /// # Safety
    /// `base` as in [`Self::header`]; `index` must be below `capacity`.
    #[inline]
    pub unsafe fn collision_entry(&self, base: *mut u8, index: u32) -> *mut Entry {
        base.add(self.collision_offset + index as usize * mem::size_of::<Entry>()) as *mut Entry
    }

    /// # Safety
    /// `base` as in [`Self::header`]; `index` must be below `capacity`.
    #[inline]
    pub unsafe fn bucket(&self, base: *mut u8, index: u32) -> *mut BucketHeader {
        base.add(self.bucket_offset + index as usize * self.bucket_stride) as *mut BucketHeader
    }

    /// Pointer to a bucket's payload bytes, directly after its header.
    ///
    /// # Safety
    /// `base` as in [`Self::header`]; `index` must be below `capacity`.
    #[inline]
    pub unsafe fn bucket_value(&self, base: *mut u8, index: u32) -> *mut u8 {
        base.add(
            self.bucket_offset + index as usize * self.bucket_stride + mem::size_of::<BucketHeader>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_prime() {
        assert_eq!(SegmentLayout::compute(0, 64).unwrap().capacity, 53);
        assert_eq!(SegmentLayout::compute(16, 64).unwrap().capacity, 53);
        assert_eq!(SegmentLayout::compute(53, 64).unwrap().capacity, 53);
        assert_eq!(SegmentLayout::compute(54, 64).unwrap().capacity, 97);
        assert_eq!(SegmentLayout::compute(100_000, 64).unwrap().capacity, 196613);
    }

    #[test]
    fn capacity_ceiling_is_enforced() {
        assert!(matches!(
            SegmentLayout::compute(MAX_CAPACITY + 1, 64),
            Err(CacheError::CapacityTooLarge(_))
        ));
        // The largest prime still covers the ceiling itself.
        assert_eq!(
            SegmentLayout::compute(MAX_CAPACITY, 64).unwrap().capacity,
            1610612741
        );
    }

    #[test]
    fn zones_are_ordered_and_aligned() {
        let l = SegmentLayout::compute(16, 100).unwrap();
        assert!(l.primary_offset >= mem::size_of::<TableHeader>());
        assert!(l.collision_offset > l.primary_offset);
        assert!(l.bucket_offset > l.collision_offset);
        assert!(l.total_size > l.bucket_offset);
        assert_eq!(l.primary_offset % 8, 0);
        assert_eq!(l.collision_offset % 8, 0);
        assert_eq!(l.bucket_offset % 8, 0);
        assert_eq!(l.bucket_stride % 8, 0);
        assert!(l.bucket_stride >= mem::size_of::<BucketHeader>() + 100);
    }

    #[test]
    fn total_size_formula() {
        let l = SegmentLayout::compute(16, 100).unwrap();
        let expected = HEADER_ZONE_SIZE
            + 2 * 53 * mem::size_of::<Entry>()
            + 53 * align_up(mem::size_of::<BucketHeader>() + 100, 8);
        assert_eq!(l.total_size(), expected);
    }

    #[test]
    fn index_arithmetic_stays_in_zone() {
        let l = SegmentLayout::compute(16, 100).unwrap();
        let mut buf = vec![0u64; l.total_size().div_ceil(8)];
        let base = buf.as_mut_ptr() as *mut u8;
        // Offsets only; nothing is dereferenced.
        unsafe {
            let end = l.primary_entry(base, l.capacity - 1) as usize + mem::size_of::<Entry>();
            assert!(end <= base as usize + l.bucket_offset);
            assert_eq!(
                l.collision_entry(base, 0) as usize - base as usize,
                l.collision_offset
            );
            let end = l.bucket(base, l.capacity - 1) as usize + l.bucket_stride;
            assert!(end <= base as usize + l.total_size());
            assert_eq!(
                l.bucket_value(base, 0) as usize - l.bucket(base, 0) as usize,
                mem::size_of::<BucketHeader>()
            );
        }
    }
}
