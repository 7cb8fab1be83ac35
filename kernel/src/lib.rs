//! # Nox: an instructional operating-system kernel core
//!
//! Nox is the user-process lifecycle and virtual-memory core of a small
//! teaching kernel: it loads ELF executables into fresh address spaces,
//! demand-pages their contents, reclaims frames under pressure, and
//! coordinates parent/child synchronization across exit.
//!
//! The pieces fit together like this:
//!
//! - [`mm`] owns physical frames ([`mm::frame`]), the per-process page
//!   tables ([`mm::page_table`]), the supplemental page table that knows how
//!   to materialize each page ([`mm::spt`]), and the swap space
//!   ([`mm::swap`]).
//! - [`loader`] validates an ELF32 image and registers its segments as
//!   demand-paged mappings, then lays out the initial user stack with
//!   argc/argv.
//! - [`process`] runs `execute`/`wait`/`exit`, connecting a parent's wait
//!   to its child's termination status.
//! - [`fs`] is the per-process file-handle table over `flat_fs`, whose
//!   sector cache carries all filesystem I/O.
//!
//! Interrupt stubs, the timer, the scheduler, and raw device drivers are
//! external collaborators; Nox assumes kernel threads and counting
//! semaphores and provides everything above them.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod console;
pub mod fs;
pub mod loader;
pub mod mm;
#[cfg(feature = "std")]
pub mod process;
pub mod sync;
#[cfg(feature = "std")]
pub mod thread;

pub use plinth::addressing;

use alloc::{boxed::Box, sync::Arc};
use console::Teletype;
use flat_fs::FlatFs;
use mm::{frame::FrameTable, swap::SwapSpace};
use plinth::dev::Disk;
use sync::SpinLock;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while serving a request. These errors can be returned to a user program
/// as a negative code through [`KernelError::into_isize`].
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// Bad file descriptor. (EBADF)
    BadFileDescriptor,
    /// No child process. (ECHILD)
    NoSuchChild,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the error into its negative return code.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoSuchChild => -10,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

/// The given `isize` does not name a [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    _e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -10 => Ok(Self::NoSuchChild),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -24 => Ok(Self::TooManyOpenFile),
            -28 => Ok(Self::NoSpace),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { _e: e }),
        }
    }
}

impl From<flat_fs::Error> for KernelError {
    fn from(e: flat_fs::Error) -> Self {
        match e {
            flat_fs::Error::Disk => KernelError::IOError,
            flat_fs::Error::Corrupted => KernelError::IOError,
            flat_fs::Error::NoSuchFile => KernelError::NoSuchEntry,
            flat_fs::Error::FileExists => KernelError::FileExist,
            flat_fs::Error::TooManyFiles => KernelError::NoSpace,
            flat_fs::Error::NoSpace => KernelError::NoSpace,
            flat_fs::Error::NameTooLong => KernelError::InvalidArgument,
        }
    }
}

impl From<plinth::dev::DiskError> for KernelError {
    fn from(_: plinth::dev::DiskError) -> Self {
        KernelError::IOError
    }
}

/// Boot-time configuration of the kernel singletons.
pub struct BootConfig {
    /// Number of frames in the user pool.
    pub user_frames: usize,
    /// Number of page-sized swap slots.
    pub swap_slots: usize,
    /// The mounted filesystem holding executables and data files.
    pub fs: FlatFs,
    /// The raw device backing swap. Unlike filesystem data, swap traffic
    /// bypasses the sector cache; it is volatile by design.
    pub swap_disk: Box<dyn Disk>,
}

/// The kernel's process-wide state: frame table, swap space, filesystem,
/// and console, created by [`Kernel::boot`] and torn down by
/// [`Kernel::shutdown`].
///
/// All of these are singletons from a process's point of view; holding them
/// in one explicitly-initialized object (rather than statics) lets a
/// harness run several kernels side by side.
pub struct Kernel {
    /// The frame table and user-pool allocator.
    pub frames: FrameTable,
    /// The swap space.
    pub swap: SwapSpace,
    /// The filesystem, including its sector cache.
    pub fs: FlatFs,
    /// Held across ELF loading so the image cannot change under the
    /// loader; fault-time file reads take it briefly.
    pub filesys_lock: SpinLock<()>,
    console: SpinLock<Option<Box<dyn Teletype>>>,
}

impl Kernel {
    /// Brings up the kernel state described by `config`.
    pub fn boot(config: BootConfig) -> Arc<Kernel> {
        log::info!(
            "nox: boot, {} user frames, {} swap slots",
            config.user_frames,
            config.swap_slots
        );
        Arc::new(Kernel {
            frames: FrameTable::new(config.user_frames),
            swap: SwapSpace::new(config.swap_disk, config.swap_slots),
            fs: config.fs,
            filesys_lock: SpinLock::new(()),
            console: SpinLock::new(None),
        })
    }

    /// Clean shutdown: flush the sector cache. Dirty data written after the
    /// last flush would otherwise be lost.
    pub fn shutdown(&self) -> Result<(), KernelError> {
        log::info!("nox: shutdown");
        self.fs.flush().map_err(KernelError::from)
    }

    /// Install a console sink. Harnesses use this to capture output.
    pub fn set_console(&self, console: impl Teletype + 'static) {
        let mut guard = self.console.lock();
        *guard = Some(Box::new(console));
        guard.unlock();
    }

    /// Write formatted text to the console sink, or to the host's stdout
    /// when none is installed.
    pub fn console_print(&self, args: core::fmt::Arguments<'_>) {
        use alloc::string::ToString;
        let text = args.to_string();
        let mut guard = self.console.lock();
        match guard.as_mut() {
            Some(sink) => sink.write(text.as_bytes()),
            #[cfg(feature = "std")]
            None => print!("{}", text),
            #[cfg(not(feature = "std"))]
            None => {}
        }
        guard.unlock();
    }
}
