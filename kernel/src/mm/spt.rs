//! Supplemental page table.
//!
//! The page tables only say whether a page is resident. The supplemental
//! page table says what a page *is*: for every registered user page,
//! keyed by its page-aligned virtual address, a [`Backing`] descriptor
//! tells the fault handler how to materialize the bytes. The descriptor is
//! a tagged record rather than bits smuggled into the PTE, so the
//! hardware-defined tables stay hardware-defined.
//!
//! The SPT is per-process and is guarded by the owning address space's
//! lock.

use super::swap::SwapSlot;
use crate::addressing::Va;
use alloc::collections::BTreeMap;
use flat_fs::FsFile;

/// What backs a user page when it is not resident.
#[derive(Clone)]
pub enum Backing {
    /// Read `read_bytes` from `file` at `offset`, zero the rest of the
    /// page.
    File {
        /// Backing file. Holding the handle keeps the file open for as
        /// long as the entry exists.
        file: FsFile,
        /// Page-aligned byte offset of this page's bytes in the file.
        offset: usize,
        /// How many bytes of the page come from the file.
        read_bytes: usize,
        /// Whether the mapping is writable.
        writable: bool,
        /// A memory-mapped file page writes back to the file on eviction;
        /// a private (executable image) page goes to swap instead.
        mmap: bool,
    },
    /// Read the whole page from the given swap slot.
    Swap {
        /// The slot holding the page; released when the page is read back
        /// in.
        slot: SwapSlot,
    },
    /// Fill with zeros.
    Zero,
}

impl Backing {
    /// Whether a page with this backing may be written.
    pub fn writable(&self) -> bool {
        match self {
            Backing::File { writable, .. } => *writable,
            Backing::Swap { .. } | Backing::Zero => true,
        }
    }

    /// Whether this is a memory-mapped file page.
    pub fn is_mmap(&self) -> bool {
        matches!(self, Backing::File { mmap: true, .. })
    }
}

impl core::fmt::Debug for Backing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Backing::File {
                offset,
                read_bytes,
                writable,
                mmap,
                ..
            } => write!(
                f,
                "File {{ offset: {:#x}, read_bytes: {}, writable: {}, mmap: {} }}",
                offset, read_bytes, writable, mmap
            ),
            Backing::Swap { slot } => write!(f, "Swap({})", slot.0),
            Backing::Zero => write!(f, "Zero"),
        }
    }
}

/// The per-process supplemental page table.
#[derive(Default)]
pub struct Spt {
    entries: BTreeMap<Va, Backing>,
}

impl Spt {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backing` for the page at `va`. Returns `false` when the
    /// page already has an entry; no two entries may cover the same page.
    pub fn insert(&mut self, va: Va, backing: Backing) -> bool {
        debug_assert_eq!(va.offset(), 0);
        if self.entries.contains_key(&va) {
            return false;
        }
        self.entries.insert(va, backing);
        true
    }

    /// Look up the backing for the page at `va`.
    pub fn lookup(&self, va: Va) -> Option<&Backing> {
        self.entries.get(&va.page_down())
    }

    /// Replace the backing for an existing page, e.g. after eviction moved
    /// it to swap.
    pub fn update(&mut self, va: Va, backing: Backing) {
        debug_assert_eq!(va.offset(), 0);
        let slot = self.entries.get_mut(&va).expect("update of unmapped page");
        *slot = backing;
    }

    /// Remove and return the entry for the page at `va`.
    pub fn remove(&mut self, va: Va) -> Option<Backing> {
        self.entries.remove(&va.page_down())
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&Va, &Backing)> {
        self.entries.iter()
    }

    /// Drain every entry, for teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = (Va, Backing)> {
        core::mem::take(&mut self.entries).into_iter()
    }

    /// Number of registered pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn no_duplicate_pages() {
        let mut spt = Spt::new();
        assert!(spt.insert(va(0x8000), Backing::Zero));
        assert!(!spt.insert(va(0x8000), Backing::Zero));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn lookup_rounds_to_page() {
        let mut spt = Spt::new();
        spt.insert(va(0x8000), Backing::Zero);
        assert!(spt.lookup(va(0x8123)).is_some());
        assert!(spt.lookup(va(0x9000)).is_none());
    }

    #[test]
    fn update_swaps_backing() {
        let mut spt = Spt::new();
        spt.insert(va(0x8000), Backing::Zero);
        spt.update(va(0x8000), Backing::Swap { slot: SwapSlot(3) });
        match spt.lookup(va(0x8000)) {
            Some(Backing::Swap { slot }) => assert_eq!(slot.0, 3),
            other => panic!("unexpected backing {:?}", other),
        }
    }
}
