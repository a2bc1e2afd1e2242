//! Spin-based reader-writer lock.
//!
//! Used where many readers (e.g. every CPU's allocation fast path)
//! contend with an occasional writer (swapping the allocator-hooks
//! capability object, §4.3). A plain [`super::SpinLock`] would serialize
//! readers against each other for no reason; this allows concurrent
//! readers and only excludes a writer.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicIsize, Ordering};

const WRITER: isize = -1;

/// A spin-based reader-writer lock.
pub struct RwLock<T> {
    state: AtomicIsize,
    data: UnsafeCell<T>,
}

// SAFETY: access is mediated by the atomic `state`, same reasoning as SpinLock.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicIsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires a shared (read) lock, spinning while a writer holds it.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur != WRITER
                && self
                    .state
                    .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwLockReadGuard { lock: self };
            }
            core::hint::spin_loop();
        }
    }

    /// Acquires the exclusive (write) lock, spinning until no readers or
    /// writer remain.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwLockWriteGuard { lock: self };
            }
            core::hint::spin_loop();
        }
    }

    /// Attempts to acquire a shared lock without blocking.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        let cur = self.state.load(Ordering::Relaxed);
        if cur == WRITER {
            return None;
        }
        self.state
            .compare_exchange(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockReadGuard { lock: self })
    }

    /// Attempts to acquire the exclusive lock without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwLockWriteGuard { lock: self })
    }
}

/// RAII shared-access guard.
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: at least one reader slot is held, and writers can't acquire
        // concurrently with any reader present.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// RAII exclusive-access guard.
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the writer slot guarantees exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer slot guarantees exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_reads_allowed() {
        let lock = RwLock::new(5);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 5);
        assert_eq!(*b, 5);
    }

    #[test]
    fn write_excludes_read() {
        let lock = RwLock::new(5);
        let _w = lock.write();
        assert!(lock.try_read().is_none());
    }

    #[test]
    fn read_excludes_write() {
        let lock = RwLock::new(5);
        let _r = lock.read();
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn write_then_read_after_drop() {
        let lock = RwLock::new(5);
        {
            let mut w = lock.write();
            *w = 9;
        }
        assert_eq!(*lock.read(), 9);
    }
}
