//! Two-level page tables.
//!
//! Nox models the classic 32-bit two-level scheme: a page directory of 1024
//! entries, each covering 4 MiB through a page table of 1024 [`Pte`]s. A
//! virtual address splits 10/10/12 into directory index, table index, and
//! page offset ([`PtIndices::from_va`]).
//!
//! A [`Pte`] is a real 32-bit entry carrying only hardware-defined bits:
//! present, writable, user, accessed, dirty, and the 20-bit frame number.
//! What a non-present page is backed by lives in the supplemental page
//! table as a tagged record, not in spare PTE bits, so PTE manipulation
//! here stays purely mechanical.
//!
//! The TLB contract follows the kernel convention: [`PageDirectory::unmap`]
//! hands back a [`StaleTlbEntry`] which must be explicitly
//! [`StaleTlbEntry::invalidate`]d to recover the frame address. Dropping
//! one without invalidating panics.

use crate::addressing::{PAGE_MASK, Pa, Va};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

bitflags::bitflags! {
    /// Hardware bits of a page-table entry.
    pub struct PteFlags: u32 {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Accessed; set on every access, cleared by the clock hand.
        const A = 1 << 5;
        /// Dirty; set on write accesses.
        const D = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Memory permissions for a page mapping.
    pub struct Permission: u32 {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page can be referenced by user code.
        const USER = 1 << 2;
    }
}

impl Permission {
    pub(crate) fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Permission::WRITE) {
            flags |= PteFlags::W;
        }
        if self.contains(Permission::USER) {
            flags |= PteFlags::U;
        }
        flags
    }
}

/// Page Table Mapping Error.
#[derive(Debug, PartialEq, Eq)]
pub enum MappingError {
    /// Unaligned address.
    Unaligned,
    /// The requested entry does not exist or is not present.
    NotExist,
    /// An attempt to map an address that already has a mapping.
    Duplicated,
}

/// A page-table entry: frame number plus [`PteFlags`].
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(pub u32);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// Get the frame address mapped by this entry, if it is present.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new((self.0 & !(PAGE_MASK as u32)) as usize)
        } else {
            None
        }
    }

    /// Get the flags of this entry.
    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry is present.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    /// Set the frame address, preserving flags. The address must be
    /// page-aligned.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, MappingError> {
        if pa.offset() != 0 {
            return Err(MappingError::Unaligned);
        }
        self.0 = pa.into_usize() as u32 | self.flags().bits();
        Ok(self)
    }

    /// Set the flags, preserving the frame address.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & !(PAGE_MASK as u32)) | flags.bits();
        self
    }

    /// Clears the entry, returning the previously-mapped frame address.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }
}

/// Page-table indices decomposed from a virtual address.
pub struct PtIndices {
    /// The virtual address this breakdown came from.
    pub va: Va,
    /// Page-directory index.
    pub pdei: usize,
    /// Page-table index.
    pub ptei: usize,
}

impl PtIndices {
    /// Decompose a page-aligned virtual address.
    pub fn from_va(va: Va) -> Result<Self, MappingError> {
        if va.offset() != 0 {
            return Err(MappingError::Unaligned);
        }
        let raw = va.into_usize();
        Ok(Self {
            va,
            pdei: raw >> 22,
            ptei: (raw >> 12) & 0x3ff,
        })
    }
}

const TABLE_ENTRIES: usize = 1024;

/// One leaf page table: 1024 entries covering 4 MiB.
pub struct PageTable {
    entries: [Pte; TABLE_ENTRIES],
}

impl PageTable {
    fn new_boxed() -> Box<Self> {
        Box::new(PageTable {
            entries: [Pte(0); TABLE_ENTRIES],
        })
    }
}

/// A per-process page directory.
///
/// The directory level is modeled by ownership: a directory slot holds the
/// leaf [`PageTable`] it points to, allocated on first use and freed by
/// [`PageDirectory::clear`] (also run on drop).
pub struct PageDirectory {
    tables: Box<[Option<Box<PageTable>>; TABLE_ENTRIES]>,
    generation: Arc<AtomicU64>,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    /// Create an empty page directory.
    pub fn new() -> Self {
        Self {
            tables: Box::new([const { None }; TABLE_ENTRIES]),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Map `va` to the frame at `pa` with permissions `perm`.
    ///
    /// Allocates the intermediate table on demand. Fails with
    /// [`MappingError::Duplicated`] when `va` is already mapped.
    pub fn map(&mut self, va: Va, pa: Pa, perm: Permission) -> Result<(), MappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        if pa.offset() != 0 {
            return Err(MappingError::Unaligned);
        }
        let table = self.tables[pdei].get_or_insert_with(PageTable::new_boxed);
        let pte = &mut table.entries[ptei];
        if pte.is_present() {
            return Err(MappingError::Duplicated);
        }
        pte.set_pa(pa)?.set_flags(perm.into_pte_flags());
        Ok(())
    }

    /// Unmap `va`, returning the stale TLB entry for the mapping.
    ///
    /// The caller must [`StaleTlbEntry::invalidate`] it to recover the
    /// frame address.
    pub fn unmap(&mut self, va: Va) -> Result<StaleTlbEntry, MappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        let table = self.tables[pdei].as_mut().ok_or(MappingError::NotExist)?;
        let pa = table.entries[ptei].clear().ok_or(MappingError::NotExist)?;
        Ok(StaleTlbEntry {
            va,
            pa,
            generation: Arc::clone(&self.generation),
            armed: true,
        })
    }

    /// Find the present entry for `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, MappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        let pte = self.tables[pdei]
            .as_ref()
            .map(|t| &t.entries[ptei])
            .ok_or(MappingError::NotExist)?;
        if pte.is_present() {
            Ok(pte)
        } else {
            Err(MappingError::NotExist)
        }
    }

    /// Find the present entry for `va`, mutably.
    pub fn walk_mut(&mut self, va: Va) -> Result<&mut Pte, MappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        let pte = self.tables[pdei]
            .as_mut()
            .map(|t| &mut t.entries[ptei])
            .ok_or(MappingError::NotExist)?;
        if pte.is_present() {
            Ok(pte)
        } else {
            Err(MappingError::NotExist)
        }
    }

    /// All present mappings, as `(va, pa, flags)` triples.
    pub fn present_mappings(&self) -> Vec<(Va, Pa, PteFlags)> {
        let mut out = Vec::new();
        for (pdei, table) in self.tables.iter().enumerate() {
            let Some(table) = table else { continue };
            for (ptei, pte) in table.entries.iter().enumerate() {
                if let Some(pa) = pte.pa() {
                    let va = Va::new((pdei << 22) | (ptei << 12)).unwrap();
                    out.push((va, pa, pte.flags()));
                }
            }
        }
        out
    }

    /// Clears every mapping and frees the leaf tables. `f` is called with
    /// each previously-present `(va, pa)` so the caller can release the
    /// frame.
    pub fn clear(&mut self, mut f: impl FnMut(Va, Pa)) {
        for (pdei, slot) in self.tables.iter_mut().enumerate() {
            let Some(table) = slot.take() else { continue };
            for (ptei, pte) in table.entries.iter().enumerate() {
                if let Some(pa) = pte.pa() {
                    let va = Va::new((pdei << 22) | (ptei << 12)).unwrap();
                    f(va, pa);
                }
            }
        }
        self.flush_tlb();
    }

    /// Invalidate every cached translation for this directory. Also done
    /// when the directory is activated on a context switch.
    pub fn flush_tlb(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of TLB invalidations issued against this directory.
    pub fn tlb_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// A virtual-address translation that is stale in the TLB.
///
/// Produced by [`PageDirectory::unmap`]; consuming it with
/// [`Self::invalidate`] performs the shootdown and yields the frame
/// address. Dropping it un-invalidated is a bug and panics.
pub struct StaleTlbEntry {
    va: Va,
    pa: Pa,
    generation: Arc<AtomicU64>,
    armed: bool,
}

impl StaleTlbEntry {
    /// The unmapped virtual address.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Invalidate the stale translation and return the frame address that
    /// was mapped.
    pub fn invalidate(mut self) -> Pa {
        self.armed = false;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.pa
    }
}

impl Drop for StaleTlbEntry {
    fn drop(&mut self) {
        if self.armed {
            panic!(
                "TLB entry for {:?} is not invalidated. You must call `.invalidate()`.",
                self.va
            );
        }
    }
}
