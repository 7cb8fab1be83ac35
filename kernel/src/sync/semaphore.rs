//! Counting semaphore.
//!
//! A semaphore maintains a count of permits. [`Semaphore::down`] consumes a
//! permit, blocking while none are available; [`Semaphore::up`] releases
//! one. A semaphore initialized to zero is an event: the waiter blocks
//! until the signaler has published whatever the event covers, and the
//! acquire on `down` pairs with the release on `up`, so everything written
//! before the `up` is visible after the `down`.

use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_utils::Backoff;

/// Counting semaphore.
pub struct Semaphore {
    permits: AtomicUsize,
}

impl Semaphore {
    /// Creates a semaphore with `permits` initial permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
        }
    }

    /// Acquire a permit, blocking until one is available.
    pub fn down(&self) {
        let backoff = Backoff::new();
        loop {
            let permits = self.permits.load(Ordering::Acquire);
            if permits > 0
                && self
                    .permits
                    .compare_exchange_weak(
                        permits,
                        permits - 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return;
            }
            if backoff.is_completed() {
                #[cfg(feature = "std")]
                std::thread::yield_now();
                #[cfg(not(feature = "std"))]
                core::hint::spin_loop();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Acquire a permit without blocking. Returns whether one was taken.
    pub fn try_down(&self) -> bool {
        self.permits
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |p| p.checked_sub(1))
            .is_ok()
    }

    /// Release a permit, waking one blocked `down`.
    pub fn up(&self) {
        self.permits.fetch_add(1, Ordering::Release);
    }

    /// Current permit count. Racy by nature; for diagnostics.
    pub fn permits(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }
}
