// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::errno::Errno;

use crate::layout::{MAX_CAPACITY, MAX_KEY_SIZE};

/// Errors surfaced by the shared-memory cache.
///
/// Capacity exhaustion and oversize inputs are ordinary, expected outcomes
/// for a fixed-size cache; they are distinguishable from each other and from
/// a plain miss (`Ok(None)` on lookup). [`CacheError::LockFailed`] means the
/// operation never ran at all.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to resolve the marker path to a segment key: {0}")]
    KeyResolution(#[source] std::io::Error),
    #[error("requested capacity {0} exceeds the maximum of {MAX_CAPACITY}")]
    CapacityTooLarge(u32),
    #[error("segment was created with capacity {existing}, re-opened with {requested}")]
    CapacityMismatch { existing: u32, requested: u32 },
    #[error("segment was created with max value size {existing}, re-opened with {requested}")]
    ValueSizeMismatch { existing: u32, requested: u32 },
    #[error("existing segment is {existing} bytes, expected {expected}")]
    SegmentSizeMismatch { existing: usize, expected: usize },
    #[error("value length {len} exceeds the segment's max value size {max}")]
    ValueTooLarge { len: usize, max: usize },
    #[error("key length {len} exceeds the maximum of {MAX_KEY_SIZE}")]
    KeyTooLarge { len: usize },
    #[error("table is full")]
    TableFull,
    #[error("eviction percentage {0} is out of range 0..=100")]
    InvalidPercent(u32),
    #[error("failed to acquire the table lock: {0}")]
    LockFailed(#[source] Errno),
    #[error("shared memory operation failed: {0}")]
    Os(#[from] Errno),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
