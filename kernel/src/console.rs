//! Console output.
//!
//! The kernel writes user-visible lines (notably the per-process exit
//! line) through a [`Teletype`] sink owned by the [`Kernel`]. Harnesses
//! install a [`Capture`] to observe the output.
//!
//! [`Kernel`]: crate::Kernel

use alloc::{string::String, sync::Arc, vec::Vec};
use plinth::spinlock::SpinLock;

/// A byte sink for console output.
pub trait Teletype: Send {
    /// Write `data` to the console.
    fn write(&mut self, data: &[u8]);
}

/// A console sink that stores everything written to it.
#[derive(Clone, Default)]
pub struct Capture {
    buf: Arc<SpinLock<Vec<u8>>>,
}

impl Capture {
    /// Creates an empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let guard = self.buf.lock();
        let s = String::from_utf8_lossy(&guard).into_owned();
        guard.unlock();
        s
    }
}

impl Teletype for Capture {
    fn write(&mut self, data: &[u8]) {
        let mut guard = self.buf.lock();
        guard.extend_from_slice(data);
        guard.unlock();
    }
}
