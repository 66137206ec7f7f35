// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Readers/writer lock over a System V semaphore pair.
//!
//! Semaphore 0 counts admitted readers, semaphore 1 counts announced
//! writers. `semop(2)` applies a whole operation vector atomically: either
//! every sub-operation can proceed immediately, or the caller blocks until
//! they jointly can. Every adjustment carries `SEM_UNDO`, so the kernel
//! rolls back whatever a terminated process still held; a reader or writer
//! that crashes mid-critical-section cannot permanently wedge the table.
//!
//! Acquisition blocks indefinitely; there is no timeout. A wait interrupted
//! by a signal, or cut short because the set was removed out from under us
//! (`EIDRM` after a destroy), surfaces as [`CacheError::LockFailed`].

use nix::errno::Errno;

use crate::error::CacheError;

const SEM_READER: u16 = 0;
const SEM_WRITER: u16 = 1;
const SEM_COUNT: i32 = 2;
const SEM_PERMS: i32 = 0o666;

fn sem_op(num: u16, op: i16) -> libc::sembuf {
    libc::sembuf {
        sem_num: num,
        sem_op: op,
        sem_flg: libc::SEM_UNDO as i16,
    }
}

/// Handle to the semaphore set guarding one segment. Copyable: the id is
/// process-global and carries no state of its own.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RwSemLock {
    id: i32,
}

impl RwSemLock {
    /// Attaches to the semaphore set for `key`, creating it if absent.
    /// Fresh sets have both counters initialized to 0 (unlocked).
    pub fn create_or_attach(key: libc::key_t) -> Result<Self, CacheError> {
        let id = unsafe { libc::semget(key, SEM_COUNT, SEM_PERMS) };
        if id >= 0 {
            return Ok(RwSemLock { id });
        }
        let id = unsafe { libc::semget(key, SEM_COUNT, libc::IPC_CREAT | SEM_PERMS) };
        if id < 0 {
            return Err(Errno::last().into());
        }
        for num in 0..SEM_COUNT {
            if unsafe { libc::semctl(id, num, libc::SETVAL, 0) } < 0 {
                return Err(Errno::last().into());
            }
        }
        Ok(RwSemLock { id })
    }

    /// Semaphore set for the calling process only; used in tests.
    #[cfg(test)]
    pub fn private() -> Result<Self, CacheError> {
        Self::create_or_attach(libc::IPC_PRIVATE)
    }

    /// The kernel id of the set, as recorded in the table header.
    pub fn raw_id(&self) -> i32 {
        self.id
    }

    fn semop(&self, ops: &mut [libc::sembuf]) -> Result<(), Errno> {
        let rc = unsafe { libc::semop(self.id, ops.as_mut_ptr(), ops.len()) };
        if rc < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    /// Acquires shared read access. Atomically bumps the reader count while
    /// requiring that no writer is announced, so the caller blocks from the
    /// moment a writer signals intent.
    pub fn read(&self) -> Result<ReadGuard<'_>, CacheError> {
        self.semop(&mut [sem_op(SEM_READER, 1), sem_op(SEM_WRITER, 0)])
            .map_err(CacheError::LockFailed)?;
        Ok(ReadGuard { lock: self })
    }

    /// Acquires exclusive write access in two phases.
    ///
    /// Phase 1 announces intent by bumping the writer counter; it always
    /// succeeds immediately and makes new readers block right away, which
    /// keeps a sustained read stream from starving writers. Phase 2 waits
    /// for the admitted readers to drain, then occupies the reader counter.
    /// If phase 2 is interrupted the announcement is rolled back.
    pub fn write(&self) -> Result<WriteGuard<'_>, CacheError> {
        self.semop(&mut [sem_op(SEM_WRITER, 1)])
            .map_err(CacheError::LockFailed)?;
        if let Err(e) = self.semop(&mut [sem_op(SEM_READER, 0), sem_op(SEM_READER, 1)]) {
            let _ = self.semop(&mut [sem_op(SEM_WRITER, -1)]);
            return Err(CacheError::LockFailed(e));
        }
        Ok(WriteGuard { lock: self })
    }

    /// Removes the semaphore set. Every process blocked in or subsequently
    /// attempting an acquisition fails with `EIDRM`/`EINVAL`.
    pub fn remove(&self) -> Result<(), CacheError> {
        if unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) } < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }
}

pub(crate) struct ReadGuard<'l> {
    lock: &'l RwSemLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        // Nothing useful to do on failure; if the set was removed the
        // kernel has already discarded our count.
        let _ = self.lock.semop(&mut [sem_op(SEM_READER, -1)]);
    }
}

pub(crate) struct WriteGuard<'l> {
    lock: &'l RwSemLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .lock
            .semop(&mut [sem_op(SEM_READER, -1), sem_op(SEM_WRITER, -1)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_then_write_sequentially() {
        let lock = RwSemLock::private().unwrap();
        drop(lock.read().unwrap());
        drop(lock.write().unwrap());
        drop(lock.read().unwrap());
        lock.remove().unwrap();
    }

    #[test]
    fn readers_are_concurrent() {
        let lock = RwSemLock::private().unwrap();
        let a = lock.read().unwrap();
        let b = lock.read().unwrap();
        drop(a);
        drop(b);
        // A writer can still get in afterwards.
        drop(lock.write().unwrap());
        lock.remove().unwrap();
    }

    #[test]
    fn writer_blocks_new_readers() {
        let lock = RwSemLock::private().unwrap();
        let admitted = Arc::new(AtomicBool::new(false));

        let w = lock.write().unwrap();
        let reader = {
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let guard = lock.read().unwrap();
                admitted.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!admitted.load(Ordering::SeqCst));
        drop(w);
        reader.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
        lock.remove().unwrap();
    }

    #[test]
    fn writer_waits_for_admitted_readers() {
        let lock = RwSemLock::private().unwrap();
        let wrote = Arc::new(AtomicBool::new(false));

        let r = lock.read().unwrap();
        let writer = {
            let wrote = Arc::clone(&wrote);
            thread::spawn(move || {
                let guard = lock.write().unwrap();
                wrote.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!wrote.load(Ordering::SeqCst));
        drop(r);
        writer.join().unwrap();
        assert!(wrote.load(Ordering::SeqCst));
        lock.remove().unwrap();
    }

    #[test]
    fn removed_set_fails_acquisition() {
        let lock = RwSemLock::private().unwrap();
        lock.remove().unwrap();
        assert!(matches!(lock.read(), Err(CacheError::LockFailed(_))));
        assert!(matches!(lock.write(), Err(CacheError::LockFailed(_))));
    }
}
