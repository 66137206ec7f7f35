// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity hash table in shared memory.
//!
//! [`ShmCache`] places a hash table inside a single named shared-memory
//! segment so that multiple unrelated processes can use it concurrently as a
//! high-performance, crash-tolerant cache. Capacity is fixed at creation;
//! the segment never grows or rehashes. When the table fills up, callers
//! recover space with [`ShmCache::evict_oldest`], which drops an
//! age-ordered percentage of the live entries.
//!
//! # Layout
//!
//! The region is statically partitioned into four zones:
//!
//! ```text
//! +--------+---------------+----------------+--------------+
//! | Header | Primary slots | Collision pool | Bucket store |
//! +--------+---------------+----------------+--------------+
//! ```
//!
//! Records are addressed by integer index, never by raw pointer, so the
//! structures stay valid at whatever address each process maps the segment.
//! Collision chains are `next`-index links into the collision pool.
//!
//! # Concurrency
//!
//! Access is serialized by a readers/writer lock built from two System V
//! semaphore counters. Every counter adjustment carries `SEM_UNDO`, so the
//! kernel rolls back whatever a crashed process still held and the table
//! cannot be wedged by a reader or writer that dies mid-operation.
//!
//! # Limitations
//!
//! - Keys are capped at [`MAX_KEY_SIZE`] bytes; values at the per-segment
//!   maximum chosen at creation.
//! - Insert never checks for an existing key. Duplicate keys are allowed,
//!   and which duplicate a lookup returns depends on table history. If in
//!   doubt, remove before insert.
//! - Eviction is age-based and approximate, not LRU-exact: reads record no
//!   bookkeeping.

mod cache;
mod error;
mod hash;
mod layout;
mod lock;
mod shm;

pub use cache::ShmCache;
pub use error::CacheError;
pub use hash::{bytes_eq, fnv1a_hash, EqFn, HashFn};
pub use layout::MAX_KEY_SIZE;
