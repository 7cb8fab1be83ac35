//! Kernel threads.
//!
//! The scheduler itself is an external collaborator; this shim gives the
//! process layer the two things it assumes from it: spawning a named
//! kernel thread, and joining one. On a hosted build the substrate is the
//! host's threads.

use alloc::string::String;

/// A builder for a named kernel thread.
pub struct ThreadBuilder {
    name: String,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
        }
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        JoinHandle {
            inner: std::thread::Builder::new()
                .name(self.name)
                .spawn(thread_fn)
                .expect("failed to spawn kernel thread"),
        }
    }
}

/// A handle to join a spawned thread.
pub struct JoinHandle {
    inner: std::thread::JoinHandle<()>,
}

impl JoinHandle {
    /// Wait for the thread to finish.
    pub fn join(self) {
        // A panicking thread has already been accounted an exit code of
        // -1 by the process layer.
        let _ = self.inner.join();
    }
}
