// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named shared-memory segments.
//!
//! A segment is identified by a System V IPC key derived from a
//! caller-supplied filesystem marker via `ftok(3)`. The marker must already
//! exist; resolution fails cleanly otherwise. The key names both the POSIX
//! shm object holding the table and the semaphore set guarding it, so every
//! process that resolves the same marker lands on the same pair.
//!
//! Mappings are never resized. The segment name is not unlinked when a
//! handle drops (processes come and go while the cache stays); only an
//! explicit destroy withdraws it.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;
use tracing::debug;

use crate::error::CacheError;

fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    // round up to nearest page
    ((size - 1) & !(page_size - 1)) + page_size
}

/// An open, not yet mapped segment.
pub(crate) struct SegmentHandle {
    fd: OwnedFd,
    name: CString,
    size: usize,
    created: bool,
}

impl SegmentHandle {
    /// Resolves `marker` to the IPC key shared by every process that names
    /// the same marker. Fails if the marker does not exist.
    pub fn resolve_key(marker: &Path) -> Result<libc::key_t, CacheError> {
        let path = CString::new(marker.as_os_str().as_bytes())
            .map_err(|e| CacheError::KeyResolution(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let key = unsafe { libc::ftok(path.as_ptr(), 1) };
        if key == -1 {
            return Err(CacheError::KeyResolution(io::Error::last_os_error()));
        }
        Ok(key)
    }

    fn shm_name(key: libc::key_t) -> CString {
        // The format cannot produce an interior NUL.
        CString::new(format!("/libdd-shmcache-{:08x}", key as u32)).expect("static shm name")
    }

    /// Opens the segment for `key`, creating it if absent. A fresh segment
    /// is sized to a page-aligned `size` and zero-filled by `ftruncate`; an
    /// existing one must match that size exactly.
    pub fn create_or_attach(key: libc::key_t, size: usize) -> Result<SegmentHandle, CacheError> {
        let name = Self::shm_name(key);
        let size = page_aligned_size(size);
        let mode = Mode::S_IRUSR
            | Mode::S_IWUSR
            | Mode::S_IRGRP
            | Mode::S_IWGRP
            | Mode::S_IROTH
            | Mode::S_IWOTH;
        loop {
            match shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty()) {
                Ok(fd) => {
                    let file = File::from(fd);
                    let existing = file.metadata()?.len() as usize;
                    if existing != size {
                        return Err(CacheError::SegmentSizeMismatch {
                            existing,
                            expected: size,
                        });
                    }
                    debug!("attached to shm segment {:?} ({size} bytes)", name);
                    return Ok(SegmentHandle {
                        fd: file.into(),
                        name,
                        size,
                        created: false,
                    });
                }
                Err(Errno::ENOENT) => {
                    match shm_open(name.as_c_str(), OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode)
                    {
                        Ok(fd) => {
                            ftruncate(&fd, size as libc::off_t)?;
                            debug!("created shm segment {:?} ({size} bytes)", name);
                            return Ok(SegmentHandle {
                                fd,
                                name,
                                size,
                                created: true,
                            });
                        }
                        // Lost the creation race; attach to the winner's segment.
                        Err(Errno::EEXIST) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Maps the whole segment read-write and shared.
    pub fn map(self) -> Result<MappedSegment, CacheError> {
        let len = NonZeroUsize::new(self.size).ok_or(CacheError::Os(Errno::EINVAL))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                0,
            )?
        };
        // The mapping keeps the segment alive; the fd is no longer needed.
        Ok(MappedSegment {
            ptr,
            size: self.size,
            name: self.name,
            created: self.created,
        })
    }
}

/// A mapped segment. Unmapped on drop; the name persists until
/// [`MappedSegment::unlink`].
pub(crate) struct MappedSegment {
    ptr: NonNull<libc::c_void>,
    size: usize,
    name: CString,
    created: bool,
}

impl MappedSegment {
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this process created (and therefore zero-filled) the segment.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Removes the segment name. Existing mappings stay valid until each
    /// process unmaps; new attachments fail with `ENOENT`.
    pub fn unlink(&self) -> Result<(), CacheError> {
        shm_unlink(self.name.as_c_str())?;
        Ok(())
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.size);
        }
    }
}

// SAFETY: the mapping is plain shared memory; all synchronization between
// users is provided by the semaphore lock, not by this type.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_key_requires_existing_marker() {
        let missing = Path::new("/nonexistent/libdd-shmcache-marker");
        assert!(matches!(
            SegmentHandle::resolve_key(missing),
            Err(CacheError::KeyResolution(_))
        ));

        let marker = tempfile::NamedTempFile::new().unwrap();
        SegmentHandle::resolve_key(marker.path()).unwrap();
    }

    #[test]
    fn create_then_attach_shares_bytes() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let key = SegmentHandle::resolve_key(marker.path()).unwrap();

        let first = SegmentHandle::create_or_attach(key, 1000)
            .unwrap()
            .map()
            .unwrap();
        assert!(first.created());
        assert!(first.size() >= 1000);

        unsafe {
            std::slice::from_raw_parts_mut(first.base(), 5).copy_from_slice(&[1, 2, 3, 4, 5]);
        }

        let second = SegmentHandle::create_or_attach(key, 1000)
            .unwrap()
            .map()
            .unwrap();
        assert!(!second.created());
        assert_eq!(second.size(), first.size());
        unsafe {
            assert_eq!(std::slice::from_raw_parts(second.base(), 5), &[1, 2, 3, 4, 5]);
        }

        first.unlink().unwrap();
    }

    #[test]
    fn attach_rejects_size_mismatch() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let key = SegmentHandle::resolve_key(marker.path()).unwrap();

        let seg = SegmentHandle::create_or_attach(key, 1000)
            .unwrap()
            .map()
            .unwrap();
        // A whole page more can never round to the same aligned size.
        let other = SegmentHandle::create_or_attach(key, 1000 + page_size::get());
        assert!(matches!(
            other,
            Err(CacheError::SegmentSizeMismatch { .. })
        ));
        seg.unlink().unwrap();
    }

    #[test]
    fn unlink_withdraws_the_name() {
        let marker = tempfile::NamedTempFile::new().unwrap();
        let key = SegmentHandle::resolve_key(marker.path()).unwrap();

        let seg = SegmentHandle::create_or_attach(key, 64).unwrap().map().unwrap();
        seg.unlink().unwrap();

        // The next open re-creates rather than attaches.
        let again = SegmentHandle::create_or_attach(key, 64).unwrap();
        assert!(again.created);
        let again = again.map().unwrap();
        again.unlink().unwrap();
    }
}
