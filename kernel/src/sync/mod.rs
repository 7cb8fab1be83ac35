//! Synchronization primitives.
//!
//! The spinlock comes from `plinth`; this module adds the counting
//! semaphore the exit/wait protocol is built on and re-exports the
//! reader/writer lock.

pub mod semaphore;

pub use plinth::rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use plinth::spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use semaphore::Semaphore;
