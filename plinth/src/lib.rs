//! Low-level support for the Nox kernel.
//!
//! `plinth` carries the pieces every other crate in the workspace leans on:
//! the spinlock, the address types and page constants, and the block-device
//! interface. Nothing in here knows about processes, files, or paging
//! policy; it is the floor the kernel stands on.

#![cfg_attr(not(test), no_std)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod addressing;
pub mod dev;
pub mod rwlock;
pub mod spinlock;
