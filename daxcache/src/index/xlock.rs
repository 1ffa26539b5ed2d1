//  Copyright 2025 Daxcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Two-tier reader/writer lock for index shards.
//!
//! The fast path costs a reader one `fetch_add`/`fetch_sub` pair and never
//! parks as long as no writer is around. A reader that observes a writer bit
//! undoes its ticket and falls back to the shard mutex, where it serializes
//! with the writer. A writer announces itself in the counter word, spins
//! until the fast readers drain, then takes the mutex.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

const READER: u64 = 1;
const WRITER: u64 = 1 << 32;
const READER_MASK: u64 = WRITER - 1;
const WRITER_MASK: u64 = !READER_MASK;

pub(crate) struct XLock<T> {
    x: AtomicU64,
    mutex: Mutex<()>,
    cell: UnsafeCell<T>,
}

// SAFETY: the guards below grant `&T` to concurrent fast readers and `&mut T`
// only after every fast reader has drained and the mutex is held.
unsafe impl<T: Send> Send for XLock<T> {}
unsafe impl<T: Send + Sync> Sync for XLock<T> {}

impl<T> XLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            x: AtomicU64::new(0),
            mutex: Mutex::new(()),
            cell: UnsafeCell::new(value),
        }
    }

    pub(crate) fn read(&self) -> ReadGuard<'_, T> {
        let prev = self.x.fetch_add(READER, Ordering::Acquire);
        if prev & WRITER_MASK == 0 {
            return ReadGuard { lock: self, slow: None };
        }

        // A writer is active or pending: undo the ticket and queue on the
        // mutex behind it.
        self.x.fetch_sub(READER, Ordering::Release);
        let guard = self.mutex.lock();
        ReadGuard {
            lock: self,
            slow: Some(guard),
        }
    }

    pub(crate) fn write(&self) -> WriteGuard<'_, T> {
        self.x.fetch_add(WRITER, Ordering::Acquire);
        while self.x.load(Ordering::Acquire) & READER_MASK != 0 {
            std::hint::spin_loop();
        }
        let guard = self.mutex.lock();
        WriteGuard { lock: self, _guard: guard }
    }
}

pub(crate) struct ReadGuard<'a, T> {
    lock: &'a XLock<T>,
    slow: Option<MutexGuard<'a, ()>>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: either a fast-reader ticket is held (writers wait for it)
        // or the mutex is held (writers hold it while mutating).
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        if self.slow.is_none() {
            self.lock.x.fetch_sub(READER, Ordering::Release);
        }
    }
}

pub(crate) struct WriteGuard<'a, T> {
    lock: &'a XLock<T>,
    _guard: MutexGuard<'a, ()>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: writer bit set, fast readers drained, mutex held.
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as in `deref`.
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.x.fetch_sub(WRITER, Ordering::Release);
        // The mutex guard is dropped after this body runs.
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_read_write() {
        let lock = XLock::new(0u64);
        {
            let r = lock.read();
            assert_eq!(*r, 0);
            let r2 = lock.read();
            assert_eq!(*r2, 0);
        }
        {
            let mut w = lock.write();
            *w = 42;
        }
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn test_concurrent_increments() {
        const THREADS: usize = 8;
        const OPS: usize = 10_000;

        let lock = XLock::new(0usize);
        let reads = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let lock = &lock;
                let reads = &reads;
                s.spawn(move || {
                    for i in 0..OPS {
                        if (i + t) % 4 == 0 {
                            *lock.write() += 1;
                        } else {
                            let v = *lock.read();
                            assert!(v <= THREADS * OPS);
                            reads.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        let expected: usize = (0..THREADS)
            .map(|t| (0..OPS).filter(|i| (i + t) % 4 == 0).count())
            .sum();
        assert_eq!(*lock.read(), expected);
    }
}
