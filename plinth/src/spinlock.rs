//! SMP-supported spinlock.
//!
//! A thread that fails to take the lock spins with exponential backoff until
//! the holder releases it. The data protected by the lock is only reachable
//! through the guard returned from [`SpinLock::lock`] or
//! [`SpinLock::try_lock`], so it can never be accessed while unlocked.
//!
//! Release is explicit: [`SpinLockGuard::unlock`] is the only path that
//! releases the lock, and dropping a guard without it panics. A guard that
//! silently vanished on an early return would be a lock held across a
//! suspension point; this way the mistake surfaces immediately at the
//! drop site.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Each spinlock has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```ignore
/// let data = Arc::new(SpinLock::new(0));
/// let mut guard = data.lock();
/// *guard += 1;
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes the lock, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    #[inline]
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, blocking the current thread until it is able
    /// to do so.
    ///
    /// Upon returning, the thread is the only thread with the lock held.
    /// The guard must be released with [`SpinLockGuard::unlock`]; letting
    /// it go out of scope still locked panics. Locking a spinlock in the
    /// thread which already holds it deadlocks.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
        SpinLockGuard {
            lock: self,
            armed: true,
        }
    }

    /// Attempts to acquire the spinlock without blocking.
    ///
    /// Returns [`WouldBlock`] if the lock is held by somebody else.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                lock: self,
                armed: true,
            })
        } else {
            Err(WouldBlock)
        }
    }
}

/// A guard for a held [`SpinLock`]. The protected data is reachable through
/// the guard's [`Deref`] and [`DerefMut`] implementations.
///
/// The lock is released only by [`SpinLockGuard::unlock`]; a guard dropped
/// while still holding the lock panics.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    armed: bool,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock.
    #[inline]
    pub fn unlock(mut self) {
        self.armed = false;
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            panic!(
                "`.unlock()` must be explicitly called before dropping SpinLockGuard."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_under_contention() {
        let data = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let data = Arc::clone(&data);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = data.lock();
                        *guard += 1;
                        guard.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let guard = data.lock();
        let total = *guard;
        guard.unlock();
        assert_eq!(total, 8000);
    }

    #[test]
    fn try_lock_reports_contention() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let reacquired = lock.try_lock();
        assert!(reacquired.is_ok());
        if let Ok(guard) = reacquired {
            guard.unlock();
        }
    }

    #[test]
    #[should_panic(expected = "`.unlock()` must be explicitly called")]
    fn dropping_a_held_guard_panics() {
        let lock = SpinLock::new(0usize);
        let _guard = lock.lock();
        // dropped without unlock()
    }
}
