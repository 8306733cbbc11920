// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use parking_lot::{lock_api::RawMutex as _, RawMutex};
use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

/// A mutex that can be told at construction time to not lock at all.
///
/// This is what backs the per-memory-type locks of the allocator. When the allocator is created
/// as externally synchronized, the caller has promised that it is never used from more than one
/// thread at a time, and taking the lock becomes a plain borrow.
pub(crate) struct AllocatorMutex<T> {
    raw: RawMutex,
    use_mutex: bool,
    data: UnsafeCell<T>,
}

// SAFETY: Access to `data` is serialized either by `raw` or, when `use_mutex` is false, by the
// contract of `AllocatorMutex::new_unsynchronized`.
unsafe impl<T: Send> Send for AllocatorMutex<T> {}
unsafe impl<T: Send> Sync for AllocatorMutex<T> {}

impl<T> AllocatorMutex<T> {
    #[inline]
    pub fn new(data: T) -> Self {
        AllocatorMutex {
            raw: RawMutex::INIT,
            use_mutex: true,
            data: UnsafeCell::new(data),
        }
    }

    /// Creates a mutex that never locks.
    ///
    /// # Safety
    ///
    /// - The returned mutex must never be locked by two threads at the same time.
    #[inline]
    pub unsafe fn new_unsynchronized(data: T) -> Self {
        AllocatorMutex {
            raw: RawMutex::INIT,
            use_mutex: false,
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn lock(&self) -> AllocatorMutexGuard<'_, T> {
        if self.use_mutex {
            self.raw.lock();
        }

        AllocatorMutexGuard { mutex: self }
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> fmt::Debug for AllocatorMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorMutex")
            .field("use_mutex", &self.use_mutex)
            .finish_non_exhaustive()
    }
}

pub(crate) struct AllocatorMutexGuard<'a, T> {
    mutex: &'a AllocatorMutex<T>,
}

impl<T> Deref for AllocatorMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: We either hold the lock or the caller of `new_unsynchronized` guarantees
        // exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for AllocatorMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Same as the `deref` above.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for AllocatorMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        if self.mutex.use_mutex {
            // SAFETY: The lock was taken when this guard was created.
            unsafe { self.mutex.raw.unlock() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn serializes_access() {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 1000;

        let mutex = AllocatorMutex::new(0usize);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..INCREMENTS {
                        *mutex.lock() += 1;
                    }
                });
            }
        });

        assert_eq!(*mutex.lock(), THREADS * INCREMENTS);
    }

    #[test]
    fn unsynchronized_never_blocks() {
        let mutex = unsafe { AllocatorMutex::new_unsynchronized(vec![1, 2]) };
        mutex.lock().push(3);
        // Taking the lock twice in sequence must not deadlock.
        assert_eq!(*mutex.lock(), [1, 2, 3]);
    }
}
