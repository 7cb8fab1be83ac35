//! Reader-writer lock.
//!
//! Allows a number of readers or at most one writer at any point in time.
//! The state word keeps the writer claim in its top bit and the reader count
//! below it.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};
use crossbeam_utils::Backoff;

const WRITER: usize = 1 << (usize::BITS - 1);

/// A reader-writer lock.
///
/// The write portion allows modification of the underlying data (exclusive
/// access); the read portion allows shared read-only access. Guards release
/// on drop, or explicitly through `unlock()`.
pub struct RwLock<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock`.
    #[inline]
    pub const fn new(t: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks for shared read access, blocking until no writer holds the
    /// lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER == 0
                && self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwLockReadGuard { lock: self };
            }
            backoff.snooze();
        }
    }

    /// Locks for exclusive write access, blocking until all readers and
    /// writers are gone.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .state
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        RwLockWriteGuard { lock: self }
    }
}

/// RAII structure releasing the shared read access of a lock when dropped.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> RwLockReadGuard<'_, T> {
    /// Releases the read access.
    #[inline]
    pub fn unlock(self) {}
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// RAII structure releasing the exclusive write access of a lock when
/// dropped.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> RwLockWriteGuard<'_, T> {
    /// Releases the write access.
    #[inline]
    pub fn unlock(self) {}
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Arc::new(RwLock::new(0usize));
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(*r1 + *r2, 0);
        r1.unlock();
        r2.unlock();

        let mut w = lock.write();
        *w = 7;
        w.unlock();
        assert_eq!(*lock.read(), 7);
    }

    #[test]
    fn write_waits_for_readers() {
        let lock = Arc::new(RwLock::new(0usize));
        let reader = lock.read();
        let lock2 = Arc::clone(&lock);
        let h = std::thread::spawn(move || {
            let mut w = lock2.write();
            *w = 1;
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(*reader, 0);
        reader.unlock();
        h.join().unwrap();
        assert_eq!(*lock.read(), 1);
    }
}
