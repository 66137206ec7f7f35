// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The shared-memory cache handle and its operations.

use std::mem;
use std::path::Path;
use std::ptr;
use std::slice;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::CacheError;
use crate::hash::{mix, EqFn, HashFn};
use crate::layout::{Entry, SegmentLayout, MAX_KEY_SIZE, NIL};
use crate::lock::RwSemLock;
use crate::shm::{MappedSegment, SegmentHandle};

/// Creation time, whole seconds since the epoch. Coarse on purpose:
/// eviction is approximate cleaning, not exact LRU.
fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Where an eviction candidate lives.
#[derive(Clone, Copy)]
enum EntrySlot {
    Primary(u32),
    Collision(u32),
}

#[derive(Clone, Copy)]
struct Candidate {
    created_sec: i64,
    slot: EntrySlot,
}

/// Offers an entry to the candidate list: it takes the first slot that is
/// either unfilled or holds a younger candidate. Unfilled slots are claimed
/// first-fit, so the filled slots always form a prefix of the list.
fn offer(candidates: &mut [Option<Candidate>], created_sec: i64, slot: EntrySlot) {
    for c in candidates.iter_mut() {
        let replace = match c {
            None => true,
            Some(existing) => created_sec < existing.created_sec,
        };
        if replace {
            *c = Some(Candidate { created_sec, slot });
            return;
        }
    }
}

/// A process-local handle to a fixed-capacity hash table living in a shared
/// memory segment.
///
/// Any number of processes may hold handles to the same segment; every
/// operation takes the segment's readers/writer lock, so handles can also be
/// shared freely between threads. Dropping a handle unmaps the segment for
/// this process only; [`ShmCache::destroy`] withdraws it for everyone.
pub struct ShmCache {
    segment: MappedSegment,
    layout: SegmentLayout,
    lock: RwSemLock,
    hash_fn: HashFn,
    eq_fn: EqFn,
}

impl ShmCache {
    /// Opens the cache identified by `marker`, creating the backing segment
    /// and semaphore set if this is the first process to do so.
    ///
    /// `marker` must name an existing filesystem entry; it is only used to
    /// derive the IPC key (via `ftok(3)`), never read or written. The
    /// capacity is rounded up to a fixed prime ≥ `min_capacity`, which
    /// together with the avalanche mixing step keeps weak user hashes from
    /// clustering. `max_value_size` caps each stored value.
    ///
    /// `hash_fn` must be deterministic across processes, and every process
    /// attaching to one segment must supply the same `hash_fn`/`eq_fn` pair
    /// ([`fnv1a_hash`](crate::fnv1a_hash) and [`bytes_eq`](crate::bytes_eq)
    /// are suitable defaults). Re-opening with a different capacity or
    /// maximum value size than the segment was created with is rejected.
    pub fn create_or_attach(
        marker: &Path,
        min_capacity: u32,
        max_value_size: u32,
        hash_fn: HashFn,
        eq_fn: EqFn,
    ) -> Result<ShmCache, CacheError> {
        let layout = SegmentLayout::compute(min_capacity, max_value_size)?;
        let key = SegmentHandle::resolve_key(marker)?;
        let segment = SegmentHandle::create_or_attach(key, layout.total_size())?.map()?;
        let lock = RwSemLock::create_or_attach(key)?;
        let cache = ShmCache {
            segment,
            layout,
            lock,
            hash_fn,
            eq_fn,
        };

        {
            let _guard = cache.lock.write()?;
            // SAFETY: the mapping covers `total_size()` bytes and the write
            // guard serializes header access across processes.
            let header = unsafe { &mut *cache.layout.header(cache.segment.base()) };
            if header.capacity == 0 {
                // First touch. `ftruncate` zero-filled the segment, and a
                // zeroed table is a valid empty one, so only the immutable
                // parameters need recording. Keying off the zeroed header
                // rather than "did we create the file" makes initialization
                // idempotent if another process attaches mid-creation.
                header.capacity = layout.capacity;
                header.max_value_size = layout.max_value_size;
                header.prime_index = layout.prime_index;
                header.entry_count = 0;
                header.shm_key = key;
                header.sem_id = cache.lock.raw_id();
                debug!(
                    "initialized segment: capacity {}, max value size {}",
                    layout.capacity, layout.max_value_size
                );
            } else {
                if header.capacity != layout.capacity {
                    return Err(CacheError::CapacityMismatch {
                        existing: header.capacity,
                        requested: layout.capacity,
                    });
                }
                if header.max_value_size != layout.max_value_size {
                    return Err(CacheError::ValueSizeMismatch {
                        existing: header.max_value_size,
                        requested: layout.max_value_size,
                    });
                }
            }
        }

        Ok(cache)
    }

    /// The table's fixed (prime) capacity.
    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    /// The per-value byte limit the segment was created with.
    pub fn max_value_size(&self) -> u32 {
        self.layout.max_value_size
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<u32, CacheError> {
        let _guard = self.lock.read()?;
        // SAFETY: mapping valid for the life of `self`; read guard held.
        Ok(unsafe { (*self.layout.header(self.segment.base())).entry_count })
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Stores `value` under `key`.
    ///
    /// Duplicate keys are not detected: inserting an existing key adds a
    /// second entry, and which one a lookup finds is unspecified. When the
    /// table is full this fails with [`CacheError::TableFull`]; insert
    /// never evicts. Call [`ShmCache::evict_oldest`] and retry.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        let _guard = self.lock.write()?;
        let max = self.layout.max_value_size as usize;
        if value.len() > max {
            return Err(CacheError::ValueTooLarge {
                len: value.len(),
                max,
            });
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(CacheError::KeyTooLarge { len: key.len() });
        }
        // SAFETY: write guard held.
        unsafe { self.insert_locked(key, value) }
    }

    /// Looks up `key` and returns its value bytes.
    ///
    /// The returned slice aliases the shared region directly; no copy is
    /// made. It stays readable for this process while the handle lives, but
    /// its contents may be rewritten by the next structural write from any
    /// process; do not retain it across inserts, removals, flushes or
    /// evictions.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, CacheError> {
        let _guard = self.lock.read()?;
        let base = self.segment.base();
        let hash = mix((self.hash_fn)(key));
        // SAFETY: read guard held; all chain indexes were written below
        // capacity by insert.
        unsafe {
            let mut entry = &*self.layout.primary_entry(base, hash % self.layout.capacity);
            while entry.used != 0 {
                // Check the stored hash to short-circuit the byte comparison.
                if entry.hash == hash && (self.eq_fn)(entry.key_bytes(), key) {
                    let value = slice::from_raw_parts(
                        self.layout.bucket_value(base, entry.bucket),
                        entry.value_len as usize,
                    );
                    return Ok(Some(value));
                }
                if entry.next == NIL {
                    break;
                }
                entry = &*self.layout.collision_entry(base, entry.next);
            }
        }
        Ok(None)
    }

    /// Removes the first reachable entry for `key`. Returns how many
    /// entries were removed (0 or 1).
    pub fn remove(&self, key: &[u8]) -> Result<usize, CacheError> {
        let _guard = self.lock.write()?;
        // SAFETY: write guard held.
        Ok(unsafe { self.remove_locked(key) })
    }

    /// Clears every entry and bucket used-flag and resets the live count.
    /// Payload bytes are not wiped; cleared slots are simply absent.
    pub fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.lock.write()?;
        let base = self.segment.base();
        // SAFETY: write guard held.
        unsafe {
            for i in 0..self.layout.capacity {
                (*self.layout.bucket(base, i)).used = 0;
                (*self.layout.primary_entry(base, i)).used = 0;
                (*self.layout.collision_entry(base, i)).used = 0;
            }
            (*self.layout.header(base)).entry_count = 0;
        }
        Ok(())
    }

    /// Removes roughly the oldest `percent`% of the table's capacity,
    /// returning how many entries were actually removed (fewer if the table
    /// holds fewer live entries). This is the only way a full table
    /// recovers space.
    ///
    /// Selection is age-based and approximate: one pass over the entry
    /// arrays keeps a `capacity * percent / 100`-slot candidate list, which
    /// favors the globally oldest entries without a full sort.
    pub fn evict_oldest(&self, percent: u32) -> Result<u32, CacheError> {
        if percent > 100 {
            return Err(CacheError::InvalidPercent(percent));
        }
        let _guard = self.lock.write()?;
        // SAFETY: write guard held.
        Ok(unsafe { self.evict_locked(percent) })
    }

    /// Withdraws the segment and its semaphore set for every attached
    /// process. Blocks until current readers and writers drain; afterwards
    /// any operation through any other handle fails with
    /// [`CacheError::LockFailed`]: the resource is gone, which is distinct
    /// from a logical miss.
    pub fn destroy(self) -> Result<(), CacheError> {
        // Take the strongest exclusive state first: drain admitted readers
        // and preclude new writers and readers.
        let guard = self.lock.write()?;
        // Removing the set makes every other process fail its next
        // acquisition instead of observing withdrawn state.
        self.lock.remove()?;
        // The set no longer exists; there is nothing to release.
        mem::forget(guard);
        self.segment.unlink()?;
        debug!("destroy: segment and semaphore set withdrawn");
        Ok(())
    }

    // -- Locked internals ---------------------------------------------------

    /// Linear scan from index 0 for the first free bucket. O(capacity);
    /// there is no free list.
    ///
    /// # Safety
    /// Caller must hold a guard.
    unsafe fn find_free_bucket(&self, base: *mut u8) -> Option<u32> {
        for i in 0..self.layout.capacity {
            if (*self.layout.bucket(base, i)).used == 0 {
                return Some(i);
            }
        }
        None
    }

    /// # Safety
    /// Caller must hold a guard.
    unsafe fn find_free_collision_entry(&self, base: *mut u8) -> Option<u32> {
        for i in 0..self.layout.capacity {
            if (*self.layout.collision_entry(base, i)).used == 0 {
                return Some(i);
            }
        }
        None
    }

    fn fill_entry(
        entry: &mut Entry,
        key: &[u8],
        hash: u32,
        bucket: u32,
        value_len: u32,
        position: u32,
        now: i64,
    ) {
        entry.used = 1;
        entry.key[..key.len()].copy_from_slice(key);
        entry.key_len = key.len() as u32;
        entry.hash = hash;
        entry.next = NIL;
        entry.bucket = bucket;
        entry.value_len = value_len;
        entry.position = position;
        entry.created_sec = now;
    }

    /// # Safety
    /// Caller must hold the write guard. `key` and `value` must already be
    /// validated against the size limits.
    unsafe fn insert_locked(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        let base = self.segment.base();
        let header = &mut *self.layout.header(base);
        // The table size is fixed; a full table stays full until eviction.
        if header.entry_count >= header.capacity {
            return Err(CacheError::TableFull);
        }
        let bucket = self.find_free_bucket(base).ok_or(CacheError::TableFull)?;

        (*self.layout.bucket(base, bucket)).used = 1;
        ptr::copy_nonoverlapping(
            value.as_ptr(),
            self.layout.bucket_value(base, bucket),
            value.len(),
        );

        let hash = mix((self.hash_fn)(key));
        let slot = hash % self.layout.capacity;
        let now = unix_now();
        let primary = &mut *self.layout.primary_entry(base, slot);
        if primary.used == 0 {
            Self::fill_entry(primary, key, hash, bucket, value.len() as u32, slot, now);
            debug!("insert: primary slot {slot}, bucket {bucket}");
        } else {
            // entry_count < capacity, and the collision pool holds one slot
            // per possible entry, so a free one exists; back out the bucket
            // anyway if that invariant is ever violated.
            let index = match self.find_free_collision_entry(base) {
                Some(index) => index,
                None => {
                    (*self.layout.bucket(base, bucket)).used = 0;
                    return Err(CacheError::TableFull);
                }
            };
            let node = &mut *self.layout.collision_entry(base, index);
            Self::fill_entry(node, key, hash, bucket, value.len() as u32, index, now);
            // Append at the chain tail.
            let mut tail = primary;
            while tail.next != NIL {
                tail = &mut *self.layout.collision_entry(base, tail.next);
            }
            tail.next = index;
            debug!("insert: collision on slot {slot}, chain node {index}, bucket {bucket}");
        }
        header.entry_count += 1;
        Ok(())
    }

    /// Removal body shared by [`ShmCache::remove`] and the eviction engine.
    /// Returns the number of entries removed (0 or 1).
    ///
    /// # Safety
    /// Caller must hold the write guard.
    unsafe fn remove_locked(&self, key: &[u8]) -> usize {
        let base = self.segment.base();
        let hash = mix((self.hash_fn)(key));
        let slot = hash % self.layout.capacity;

        let mut prev: *mut Entry = ptr::null_mut();
        let mut cur = self.layout.primary_entry(base, slot);
        loop {
            let entry = &*cur;
            if entry.used == 0 {
                return 0;
            }
            if entry.hash == hash && (self.eq_fn)(entry.key_bytes(), key) {
                break;
            }
            if entry.next == NIL {
                return 0;
            }
            prev = cur;
            cur = self.layout.collision_entry(base, entry.next);
        }

        let header = &mut *self.layout.header(base);
        let found = &mut *cur;
        (*self.layout.bucket(base, found.bucket)).used = 0;
        header.entry_count -= 1;

        if prev.is_null() {
            if found.next != NIL {
                // The primary slot dies but its chain must stay rooted
                // here: splice the first chain node's content into the
                // slot, keeping the slot's own position.
                let node = &mut *self.layout.collision_entry(base, found.next);
                let position = found.position;
                *found = *node;
                node.used = 0;
                found.position = position;
            } else {
                found.used = 0;
            }
        } else {
            // A chain node: unlink it from its predecessor.
            (*prev).next = found.next;
            found.used = 0;
        }
        debug!("remove: slot {slot}");
        1
    }

    /// # Safety
    /// Caller must hold the write guard.
    unsafe fn evict_locked(&self, percent: u32) -> u32 {
        let base = self.segment.base();
        let k = (self.layout.capacity as u64 * percent as u64 / 100) as usize;
        if k == 0 {
            return 0;
        }

        // One pass over both entry arrays, keeping the k oldest seen so far.
        let mut candidates: Vec<Option<Candidate>> = vec![None; k];
        for i in 0..self.layout.capacity {
            let entry = &*self.layout.primary_entry(base, i);
            if entry.used != 0 {
                offer(&mut candidates, entry.created_sec, EntrySlot::Primary(i));
            }
        }
        for i in 0..self.layout.capacity {
            let entry = &*self.layout.collision_entry(base, i);
            if entry.used != 0 {
                offer(&mut candidates, entry.created_sec, EntrySlot::Collision(i));
            }
        }

        let mut removed = 0;
        let mut key = [0u8; MAX_KEY_SIZE];
        for candidate in candidates.into_iter().flatten() {
            let entry = &*match candidate.slot {
                EntrySlot::Primary(i) => self.layout.primary_entry(base, i),
                EntrySlot::Collision(i) => self.layout.collision_entry(base, i),
            };
            // Removal relocates chain nodes, so copy the key bytes out
            // before touching the table. An earlier removal may have
            // spliced this candidate's entry elsewhere; removing by key
            // still drops the surviving copy.
            let key_len = entry.key_len as usize;
            key[..key_len].copy_from_slice(&entry.key[..key_len]);
            removed += self.remove_locked(&key[..key_len]) as u32;
        }
        debug!("evict_oldest: removed {removed} entries ({k} candidate slots)");
        removed
    }
}
