//! Frame table and user-pool allocator.
//!
//! The frame table owns every physical frame handed to user pages. Each
//! frame has a dense [`Fte`] recording the owning address space and the
//! virtual page mapped into it; a frame is either free, or its owner's PTE
//! points back at it.
//!
//! [`FrameTable::get_page`] first tries the pool. Under pressure it runs
//! the clock over the table: a frame whose accessed bit is set gets a
//! second chance (the bit is cleared and the hand moves on), otherwise it
//! is evicted — unmapped from its owner, written out if dirty (swap for
//! anonymous pages, the backing file for mmap pages), and its SPT entry
//! rewritten to the new backing. The table lock is dropped around the
//! write-out; by then the victim is unmapped and unreachable from its
//! owner.
//!
//! Owners are locked with `try_lock` only, and frames between allocation
//! and page-table installation stay pinned, so the clock can never wedge
//! against a faulting process — including the one asking for the frame.

use crate::{
    KernelError,
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa, Va},
    mm::{
        AddressSpace,
        page_table::PteFlags,
        spt::Backing,
        swap::SwapSpace,
    },
};
use alloc::{
    alloc::Layout,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use crossbeam_utils::Backoff;
use log::debug;
use plinth::spinlock::SpinLock;

bitflags::bitflags! {
    /// Frame allocation flags.
    pub struct AllocFlags: u32 {
        /// Panic instead of returning failure.
        const ASSERT = 1 << 0;
        /// Zero the frame contents.
        const ZERO = 1 << 1;
        /// User frame.
        const USER = 1 << 2;
        /// Frame backs a memory-mapped file page.
        const MMAP = 1 << 3;
    }
}

/// Physical address of the first user-pool frame.
pub const USER_POOL_BASE: usize = 0x10_0000;

/// Who a frame currently belongs to.
pub struct FrameOwner {
    /// The owning address space. Weak: the space's teardown releases its
    /// frames explicitly, and eviction must not keep a dying space alive.
    pub space: Weak<SpinLock<AddressSpace>>,
    /// The user page mapped onto the frame.
    pub va: Va,
}

/// Frame table entry.
struct Fte {
    owner: Option<FrameOwner>,
    /// Pinned frames are never eviction victims (allocation in flight).
    pinned: bool,
}

struct PoolState {
    bitmap: Vec<u64>,
    ftes: Vec<Fte>,
    hand: usize,
    free: usize,
}

struct FrameTableInner {
    base: *mut u8,
    layout: Layout,
    nframes: usize,
    state: SpinLock<PoolState>,
}

unsafe impl Send for FrameTableInner {}
unsafe impl Sync for FrameTableInner {}

impl Drop for FrameTableInner {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.base, self.layout) }
    }
}

/// The kernel-wide frame table. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct FrameTable {
    inner: Arc<FrameTableInner>,
}

impl FrameTable {
    /// Builds a table owning a user pool of `nframes` frames.
    pub fn new(nframes: usize) -> Self {
        assert!(nframes > 0);
        let layout = Layout::from_size_align(nframes * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "user pool allocation failed");
        let mut ftes = Vec::with_capacity(nframes);
        ftes.resize_with(nframes, || Fte {
            owner: None,
            pinned: false,
        });
        Self {
            inner: Arc::new(FrameTableInner {
                base,
                layout,
                nframes,
                state: SpinLock::new(PoolState {
                    bitmap: vec![0; nframes.div_ceil(64)],
                    ftes,
                    hand: 0,
                    free: nframes,
                }),
            }),
        }
    }

    fn index_of(&self, pa: Pa) -> usize {
        let idx = (pa.into_usize() - USER_POOL_BASE) >> PAGE_SHIFT;
        debug_assert!(idx < self.inner.nframes);
        idx
    }

    fn pa_of(&self, idx: usize) -> Pa {
        Pa::new(USER_POOL_BASE + (idx << PAGE_SHIFT)).unwrap()
    }

    /// Run `f` over the frame's bytes. The caller must either hold the
    /// owning address space's lock or exclusively own the frame.
    pub(crate) fn with_frame<R>(&self, pa: Pa, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let idx = self.index_of(pa);
        let bytes = unsafe {
            &mut *(self.inner.base.add(idx * PAGE_SIZE) as *mut [u8; PAGE_SIZE])
        };
        f(bytes)
    }

    /// Number of free frames in the pool.
    pub fn free_frames(&self) -> usize {
        let state = self.inner.state.lock();
        let free = state.free;
        state.unlock();
        free
    }

    /// Number of frames owned by `space`.
    pub fn frames_owned_by(&self, space: &Arc<SpinLock<AddressSpace>>) -> usize {
        let state = self.inner.state.lock();
        let n = state
            .ftes
            .iter()
            .filter(|fte| {
                fte.owner
                    .as_ref()
                    .and_then(|o| o.space.upgrade())
                    .is_some_and(|s| Arc::ptr_eq(&s, space))
            })
            .count();
        state.unlock();
        n
    }

    /// The mapped virtual page recorded for the frame at `pa`, if any.
    pub fn recorded_va(&self, pa: Pa) -> Option<Va> {
        let state = self.inner.state.lock();
        let va = state.ftes[self.index_of(pa)].owner.as_ref().map(|o| o.va);
        state.unlock();
        va
    }

    /// Acquire a frame for `owner`, evicting under pressure.
    ///
    /// The returned frame is pinned: it will not be considered for
    /// eviction until [`FrameTable::unpin`] after the caller has installed
    /// it into the owner's page table.
    pub fn get_page(
        &self,
        flags: AllocFlags,
        owner: FrameOwner,
        swap: &SwapSpace,
    ) -> Result<Frame, KernelError> {
        debug_assert!(flags.contains(AllocFlags::USER));
        let backoff = Backoff::new();
        let mut attempts = 0;
        loop {
            match self.try_get_page(&flags, &owner, swap) {
                Ok(Some(frame)) => {
                    let mut frame = frame;
                    if flags.contains(AllocFlags::ZERO) {
                        frame.inner_mut().fill(0);
                    }
                    return Ok(frame);
                }
                Ok(None) => {
                    // All candidates pinned or busy right now.
                    attempts += 1;
                    if attempts > 200 {
                        if flags.contains(AllocFlags::ASSERT) {
                            panic!("frame_get_page: out of user frames");
                        }
                        debug!("frame table: no evictable frame");
                        return Err(KernelError::NoMemory);
                    }
                    backoff.snooze();
                }
                Err(e) => {
                    if flags.contains(AllocFlags::ASSERT) {
                        panic!("frame_get_page: {:?}", e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One allocation attempt: pool first, then a full clock sweep.
    fn try_get_page(
        &self,
        flags: &AllocFlags,
        owner: &FrameOwner,
        swap: &SwapSpace,
    ) -> Result<Option<Frame>, KernelError> {
        let mut state = self.inner.state.lock();

        if state.free > 0 {
            if let Some(idx) = Self::scan_free(&state.bitmap, self.inner.nframes) {
                let (word, bit) = (idx / 64, idx % 64);
                state.bitmap[word] |= 1 << bit;
                state.free -= 1;
                state.ftes[idx] = Fte {
                    owner: Some(FrameOwner {
                        space: owner.space.clone(),
                        va: owner.va,
                    }),
                    pinned: true,
                };
                state.unlock();
                return Ok(Some(Frame {
                    pa: self.pa_of(idx),
                    table: self.clone(),
                }));
            }
        }

        // Clock sweep. Two passes: the first clears accessed bits, so the
        // second must find a victim unless everything is pinned or its
        // owner is busy.
        for _ in 0..2 * self.inner.nframes {
            let idx = state.hand;
            state.hand = (state.hand + 1) % self.inner.nframes;

            let fte = &state.ftes[idx];
            if fte.pinned {
                continue;
            }
            let Some(fo) = fte.owner.as_ref() else {
                continue;
            };
            let (va, Some(space)) = (fo.va, fo.space.upgrade()) else {
                continue;
            };
            let Ok(mut space_guard) = space.try_lock() else {
                continue;
            };

            let pa = self.pa_of(idx);
            let pagedir = match space_guard.pagedir.as_mut() {
                Some(pd) => pd,
                None => {
                    // Mid-teardown; its frames are about to be freed.
                    space_guard.unlock();
                    continue;
                }
            };
            let pte_flags = match pagedir.walk_mut(va) {
                Ok(pte) => {
                    let flags = pte.flags();
                    if flags.contains(PteFlags::A) {
                        // Second chance.
                        pte.set_flags(flags & !PteFlags::A);
                        space_guard.unlock();
                        continue;
                    }
                    flags
                }
                Err(_) => {
                    space_guard.unlock();
                    continue;
                }
            };

            // Victim. Reserve it, then do the write-out with the table
            // lock released; the page is removed from the page directory
            // first, so the owner can no longer reach it.
            state.ftes[idx].pinned = true;
            state.unlock();

            match self.evict(idx, va, pte_flags, &mut space_guard, swap) {
                Ok(()) => {
                    space_guard.unlock();
                    let mut state = self.inner.state.lock();
                    state.ftes[idx] = Fte {
                        owner: Some(FrameOwner {
                            space: owner.space.clone(),
                            va: owner.va,
                        }),
                        pinned: true,
                    };
                    state.unlock();
                    return Ok(Some(Frame {
                        pa,
                        table: self.clone(),
                    }));
                }
                Err(e) => {
                    space_guard.unlock();
                    let mut state = self.inner.state.lock();
                    state.ftes[idx].pinned = false;
                    state.unlock();
                    return Err(e);
                }
            }
        }
        state.unlock();
        Ok(None)
    }

    /// Unmap the victim and push its contents to the right backing store.
    /// On failure the mapping is restored untouched.
    fn evict(
        &self,
        idx: usize,
        va: Va,
        pte_flags: PteFlags,
        space: &mut AddressSpace,
        swap: &SwapSpace,
    ) -> Result<(), KernelError> {
        let pa = self.pa_of(idx);
        let pagedir = space.pagedir.as_mut().unwrap();
        let got = pagedir.unmap(va).unwrap().invalidate();
        debug_assert_eq!(got, pa);

        let backing = space
            .spt
            .lookup(va)
            .cloned()
            .expect("resident page without an SPT entry");

        let restore = |space: &mut AddressSpace| {
            let pagedir = space.pagedir.as_mut().unwrap();
            pagedir.map(va, pa, super::perm_for(&backing)).unwrap();
            pagedir.walk_mut(va).unwrap().set_flags(pte_flags);
        };

        if !pte_flags.contains(PteFlags::D) {
            // Clean: a file page refaults from the file, an anonymous page
            // is still all zeros. Nothing to write.
            return Ok(());
        }

        match &backing {
            Backing::File {
                file,
                offset,
                read_bytes,
                mmap: true,
                ..
            } => {
                // Dirty mmap page: back to the file.
                let r = self.with_frame(pa, |bytes| file.write_at(*offset, &bytes[..*read_bytes]));
                if let Err(e) = r {
                    restore(space);
                    return Err(KernelError::from(e));
                }
            }
            _ => {
                // Dirty anonymous (or private image) page: to swap.
                let slot = match swap.alloc() {
                    Ok(slot) => slot,
                    Err(e) => {
                        restore(space);
                        return Err(e);
                    }
                };
                if let Err(e) = self.with_frame(pa, |bytes| swap.write_slot(slot, bytes)) {
                    swap.free(slot);
                    restore(space);
                    return Err(e);
                }
                space.spt.update(va, Backing::Swap { slot });
            }
        }
        Ok(())
    }

    fn scan_free(bitmap: &[u64], nframes: usize) -> Option<usize> {
        for (word_idx, word) in bitmap.iter().enumerate() {
            if *word != u64::MAX {
                let idx = word_idx * 64 + word.trailing_ones() as usize;
                if idx < nframes {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Free a batch of frames back to the pool.
    pub fn free_multiple(&self, frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            drop(frame);
        }
    }

    /// Clear the pin taken by [`FrameTable::get_page`] once the frame is
    /// installed in the owner's page table.
    pub fn unpin(&self, pa: Pa) {
        let mut state = self.inner.state.lock();
        let idx = self.index_of(pa);
        debug_assert!(state.ftes[idx].pinned);
        state.ftes[idx].pinned = false;
        state.unlock();
    }

    /// Free the frame at `pa` back to the pool.
    ///
    /// The caller must have unmapped the page already; a frame with a live
    /// mapping is never freed.
    fn free_page(&self, pa: Pa) {
        let mut state = self.inner.state.lock();
        let idx = self.index_of(pa);
        let (word, bit) = (idx / 64, idx % 64);
        debug_assert_ne!(state.bitmap[word] & (1 << bit), 0, "double free of frame");
        state.bitmap[word] &= !(1 << bit);
        state.free += 1;
        state.ftes[idx] = Fte {
            owner: None,
            pinned: false,
        };
        state.unlock();
    }
}

/// An owned user frame.
///
/// Dropping the handle returns the frame to the pool. Installing it into a
/// page table consumes it with [`Frame::into_raw`]; teardown reconstructs
/// it with [`Frame::from_raw`] and lets it drop.
pub struct Frame {
    pa: Pa,
    table: FrameTable,
}

impl Frame {
    /// The frame's physical address.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Read access to the frame's bytes.
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        let idx = self.table.index_of(self.pa);
        unsafe { &*(self.table.inner.base.add(idx * PAGE_SIZE) as *const [u8; PAGE_SIZE]) }
    }

    /// Write access to the frame's bytes.
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        let idx = self.table.index_of(self.pa);
        unsafe { &mut *(self.table.inner.base.add(idx * PAGE_SIZE) as *mut [u8; PAGE_SIZE]) }
    }

    /// Consume the frame, leaving it allocated, and return its address.
    #[inline]
    pub fn into_raw(self) -> Pa {
        let pa = self.pa;
        core::mem::forget(self);
        pa
    }

    /// Reconstruct a frame consumed by [`Frame::into_raw`].
    ///
    /// # Safety
    /// `pa` must have come from `into_raw` on the same table and must not
    /// be reconstructed twice.
    #[inline]
    pub unsafe fn from_raw(table: &FrameTable, pa: Pa) -> Self {
        Frame {
            pa,
            table: table.clone(),
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.table.free_page(self.pa);
    }
}
