//! Memory management.
//!
//! The pieces: [`frame`] owns physical frames and evicts under pressure,
//! [`page_table`] holds the two-level hardware tables, [`spt`] knows what
//! backs every registered user page, and [`swap`] stores evicted anonymous
//! pages. This module ties them together in [`AddressSpace`] and
//! implements the demand-paging fault path plus byte-granularity user
//! memory access.
//!
//! An address space is shared as `Arc<SpinLock<AddressSpace>>`: the owning
//! process locks it to serve faults, and the frame-table clock try-locks it
//! to evict. The fault path allocates frames with the space lock released,
//! so the clock may claim the faulting process's own resident pages.

pub mod frame;
pub mod page_table;
pub mod spt;
pub mod swap;

use crate::{
    Kernel, KernelError,
    addressing::{PAGE_SIZE, PHYS_BASE, Va},
};
use alloc::sync::Arc;
use flat_fs::FsFile;
use frame::{AllocFlags, Frame, FrameOwner};
use page_table::{PageDirectory, Permission, PteFlags};
use plinth::spinlock::SpinLock;
use spt::{Backing, Spt};

/// A process's address space, shared between its owner and the frame
/// table's eviction clock.
pub type SharedSpace = Arc<SpinLock<AddressSpace>>;

/// Per-process virtual memory state: the page directory and the
/// supplemental page table, guarded together by one lock.
pub struct AddressSpace {
    /// The root of the hardware mapping structure. `None` for kernel-only
    /// processes, and taken out during teardown.
    pub pagedir: Option<PageDirectory>,
    /// The supplemental page table.
    pub spt: Spt,
}

impl AddressSpace {
    /// A fresh user address space.
    pub fn new() -> SharedSpace {
        Arc::new(SpinLock::new(AddressSpace {
            pagedir: Some(PageDirectory::new()),
            spt: Spt::new(),
        }))
    }

    /// An address space for a process that never enters user mode.
    pub fn new_bare() -> SharedSpace {
        Arc::new(SpinLock::new(AddressSpace {
            pagedir: None,
            spt: Spt::new(),
        }))
    }
}

/// Mapping permission for a page with the given backing.
pub(crate) fn perm_for(backing: &Backing) -> Permission {
    let mut perm = Permission::READ | Permission::USER;
    if backing.writable() {
        perm |= Permission::WRITE;
    }
    perm
}

/// Resolve a fault at `va`, materializing the page per its SPT entry.
///
/// Returns `Ok` when the page is resident on return (including when a
/// racing fault resolved it first). `BadAddress` when the page is not
/// registered, `InvalidAccess` for a write to a read-only page, `IOError`
/// when the backing store failed; the caller kills the process for those.
pub fn fault_in(
    kernel: &Kernel,
    space: &SharedSpace,
    va: Va,
    write: bool,
) -> Result<(), KernelError> {
    if !va.is_user() {
        return Err(KernelError::BadAddress);
    }
    let page = va.page_down();

    // Consult the page tables and the SPT, then release the lock: frame
    // allocation may need to evict our own pages.
    let guard = space.lock();
    let Some(pagedir) = guard.pagedir.as_ref() else {
        guard.unlock();
        return Err(KernelError::BadAddress);
    };
    if let Ok(pte) = pagedir.walk(page) {
        let resident_writable = pte.flags().contains(PteFlags::W);
        guard.unlock();
        return if write && !resident_writable {
            Err(KernelError::InvalidAccess)
        } else {
            Ok(())
        };
    }
    let Some(backing) = guard.spt.lookup(page).cloned() else {
        guard.unlock();
        return Err(KernelError::BadAddress);
    };
    guard.unlock();
    if write && !backing.writable() {
        return Err(KernelError::InvalidAccess);
    }

    let mut flags = AllocFlags::USER;
    match &backing {
        Backing::Zero => flags |= AllocFlags::ZERO,
        Backing::File { mmap: true, .. } => flags |= AllocFlags::MMAP,
        _ => {}
    }
    let owner = FrameOwner {
        space: Arc::downgrade(space),
        va: page,
    };
    let mut frame = kernel.frames.get_page(flags, owner, &kernel.swap)?;

    // Populate. A page faulted back from swap is installed dirty: its slot
    // is released below, so the next eviction must write it out again.
    let mut install_dirty = write;
    match &backing {
        Backing::File {
            file,
            offset,
            read_bytes,
            ..
        } => {
            let fs_guard = kernel.filesys_lock.lock();
            let r = file.read_at(*offset, &mut frame.inner_mut()[..*read_bytes]);
            fs_guard.unlock();
            if r.map_err(KernelError::from)? < *read_bytes {
                return Err(KernelError::IOError);
            }
            frame.inner_mut()[*read_bytes..].fill(0);
        }
        Backing::Swap { slot } => {
            kernel.swap.read_slot(*slot, frame.inner_mut())?;
            install_dirty = true;
        }
        Backing::Zero => {}
    }

    // Install.
    let mut guard = space.lock();
    let space_ref = &mut *guard;
    let Some(pagedir) = space_ref.pagedir.as_mut() else {
        guard.unlock();
        return Err(KernelError::BadAddress);
    };
    if pagedir.walk(page).is_ok() {
        // A racing fault on the same page resolved first.
        guard.unlock();
        return Ok(());
    }
    if space_ref.spt.lookup(page).is_none() {
        guard.unlock();
        return Err(KernelError::BadAddress);
    }
    if pagedir.map(page, frame.pa(), perm_for(&backing)).is_err() {
        guard.unlock();
        return Err(KernelError::NoMemory);
    }
    let pte = pagedir.walk_mut(page).unwrap();
    let mut pte_flags = pte.flags() | PteFlags::A;
    if install_dirty {
        pte_flags |= PteFlags::D;
    }
    pte.set_flags(pte_flags);

    if let Backing::Swap { slot } = backing {
        kernel.swap.free(slot);
        space_ref.spt.update(page, Backing::Zero);
    }

    let pa = frame.into_raw();
    kernel.frames.unpin(pa);
    guard.unlock();
    Ok(())
}

/// Copy user memory at `va..va+buf.len()` into `buf`, faulting pages in
/// as needed and setting accessed bits the way the MMU would.
pub fn read_user(
    kernel: &Kernel,
    space: &SharedSpace,
    va: Va,
    buf: &mut [u8],
) -> Result<(), KernelError> {
    let mut done = 0;
    while done < buf.len() {
        let addr = va + done;
        if !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        let page = addr.page_down();
        let within = addr.offset();
        let chunk = (PAGE_SIZE - within).min(buf.len() - done);
        loop {
            let mut guard = space.lock();
            let Some(pagedir) = guard.pagedir.as_mut() else {
                guard.unlock();
                return Err(KernelError::BadAddress);
            };
            if let Ok(pte) = pagedir.walk_mut(page) {
                let flags = pte.flags();
                pte.set_flags(flags | PteFlags::A);
                let pa = pte.pa().unwrap();
                kernel.frames.with_frame(pa, |bytes| {
                    buf[done..done + chunk].copy_from_slice(&bytes[within..within + chunk])
                });
                guard.unlock();
                break;
            }
            guard.unlock();
            fault_in(kernel, space, addr, false)?;
        }
        done += chunk;
    }
    Ok(())
}

/// Copy `buf` into user memory at `va`, faulting pages in as needed and
/// setting accessed/dirty bits the way the MMU would. Fails with
/// `InvalidAccess` on a read-only page.
pub fn write_user(
    kernel: &Kernel,
    space: &SharedSpace,
    va: Va,
    buf: &[u8],
) -> Result<(), KernelError> {
    let mut done = 0;
    while done < buf.len() {
        let addr = va + done;
        if !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        let page = addr.page_down();
        let within = addr.offset();
        let chunk = (PAGE_SIZE - within).min(buf.len() - done);
        loop {
            let mut guard = space.lock();
            let Some(pagedir) = guard.pagedir.as_mut() else {
                guard.unlock();
                return Err(KernelError::BadAddress);
            };
            if let Ok(pte) = pagedir.walk_mut(page) {
                let flags = pte.flags();
                if !flags.contains(PteFlags::W) {
                    guard.unlock();
                    return Err(KernelError::InvalidAccess);
                }
                pte.set_flags(flags | PteFlags::A | PteFlags::D);
                let pa = pte.pa().unwrap();
                kernel.frames.with_frame(pa, |bytes| {
                    bytes[within..within + chunk].copy_from_slice(&buf[done..done + chunk])
                });
                guard.unlock();
                break;
            }
            guard.unlock();
            fault_in(kernel, space, addr, true)?;
        }
        done += chunk;
    }
    Ok(())
}

/// Register a demand-paged executable segment: `read_bytes + zero_bytes`
/// bytes (both multiples of the page size together) starting at the
/// page-aligned `upage`, backed by `file` from the page-aligned offset
/// `ofs`. No frame is allocated here.
pub fn register_segment(
    space: &SharedSpace,
    file: &FsFile,
    mut ofs: usize,
    mut upage: Va,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<(), KernelError> {
    debug_assert!((read_bytes + zero_bytes) % PAGE_SIZE == 0);
    debug_assert_eq!(upage.offset(), 0);
    debug_assert!(ofs % PAGE_SIZE == 0);

    let mut guard = space.lock();
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_SIZE);
        let page_zero_bytes = PAGE_SIZE - page_read_bytes;
        let backing = Backing::File {
            file: file.clone(),
            offset: ofs,
            read_bytes: page_read_bytes,
            writable,
            mmap: false,
        };
        if !guard.spt.insert(upage, backing) {
            guard.unlock();
            return Err(KernelError::NoExec);
        }
        ofs += page_read_bytes;
        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_SIZE;
    }
    guard.unlock();
    Ok(())
}

/// Install the initial user stack: a single zero-filled, writable frame
/// just below [`PHYS_BASE`]. Returns the initial stack pointer.
pub fn setup_stack(kernel: &Kernel, space: &SharedSpace) -> Result<Va, KernelError> {
    let stack_page = Va::new(PHYS_BASE - PAGE_SIZE).unwrap();
    let mut guard = space.lock();
    if !guard.spt.insert(stack_page, Backing::Zero) {
        guard.unlock();
        return Err(KernelError::NoExec);
    }
    guard.unlock();
    fault_in(kernel, space, stack_page, true)?;
    Ok(Va::new(PHYS_BASE).unwrap())
}

/// Map `len` bytes of `file` from byte offset `file_ofs` at `addr`,
/// demand-paged. Pages past end of file are zero-filled; dirty pages write
/// back to the file on eviction and unmap.
pub fn mmap(
    space: &SharedSpace,
    file: &FsFile,
    addr: Va,
    len: usize,
    file_ofs: usize,
    writable: bool,
) -> Result<usize, KernelError> {
    if addr.into_usize() == 0 || addr.offset() != 0 || len == 0 || file_ofs % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let pages = len.div_ceil(PAGE_SIZE);
    let end = addr + pages * PAGE_SIZE;
    if !addr.is_user() || !(end - 1usize).is_user() {
        return Err(KernelError::InvalidArgument);
    }

    let mut guard = space.lock();
    let Some(pagedir) = guard.pagedir.as_ref() else {
        guard.unlock();
        return Err(KernelError::BadAddress);
    };
    for i in 0..pages {
        let page = addr + i * PAGE_SIZE;
        if guard.spt.lookup(page).is_some() || pagedir.walk(page).is_ok() {
            guard.unlock();
            return Err(KernelError::FileExist);
        }
    }
    let file_len = file.len();
    for i in 0..pages {
        let page = addr + i * PAGE_SIZE;
        let offset = file_ofs + i * PAGE_SIZE;
        let read_bytes = file_len.saturating_sub(offset).min(PAGE_SIZE);
        let inserted = guard.spt.insert(
            page,
            Backing::File {
                file: file.clone(),
                offset,
                read_bytes,
                writable,
                mmap: true,
            },
        );
        debug_assert!(inserted);
    }
    guard.unlock();
    Ok(len)
}

/// Unmap the `len`-byte mapping at `addr`, writing dirty mmap pages back
/// to their file.
pub fn munmap(
    kernel: &Kernel,
    space: &SharedSpace,
    addr: Va,
    len: usize,
) -> Result<(), KernelError> {
    if addr.offset() != 0 || len == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mut guard = space.lock();
    for i in 0..len.div_ceil(PAGE_SIZE) {
        let page = addr + i * PAGE_SIZE;
        let Some(backing) = guard.spt.remove(page) else {
            guard.unlock();
            return Err(KernelError::BadAddress);
        };
        release_page(kernel, &mut guard, page, &backing);
    }
    guard.unlock();
    Ok(())
}

/// Tear down `space`: unmap and free every resident frame (writing dirty
/// mmap pages back), release swap slots, and destroy the page directory.
///
/// The directory is taken out of the space before anything is freed, so a
/// re-activation of a half-destroyed directory is unrepresentable.
pub fn destroy(kernel: &Kernel, space: &mut AddressSpace) {
    let mut pagedir = space.pagedir.take();
    if let Some(pd) = pagedir.as_ref() {
        // From here the process's translations are dead.
        pd.flush_tlb();
    }
    let entries: alloc::vec::Vec<_> = space.spt.drain().collect();
    for (va, backing) in entries {
        if let Some(pd) = pagedir.as_mut() {
            free_resident(kernel, pd, va, &backing);
        }
        if let Backing::Swap { slot } = backing {
            kernel.swap.free(slot);
        }
    }
    if let Some(mut pd) = pagedir {
        // Every frame was reachable from an SPT entry; nothing should be
        // left. Free stragglers defensively and release the leaf tables.
        let mut stragglers = alloc::vec::Vec::new();
        pd.clear(|_, pa| {
            stragglers.push(unsafe { Frame::from_raw(&kernel.frames, pa) });
        });
        kernel.frames.free_multiple(stragglers);
    }
}

/// Shared by munmap and teardown: drop the resident frame for `page` (if
/// any) and release the backing's swap slot.
fn release_page(kernel: &Kernel, space: &mut AddressSpace, page: Va, backing: &Backing) {
    if let Some(pd) = space.pagedir.as_mut() {
        free_resident(kernel, pd, page, backing);
    }
    if let Backing::Swap { slot } = backing {
        kernel.swap.free(*slot);
    }
}

fn free_resident(kernel: &Kernel, pagedir: &mut PageDirectory, va: Va, backing: &Backing) {
    let Ok(pte) = pagedir.walk(va) else { return };
    let flags = pte.flags();
    let pa = pagedir.unmap(va).unwrap().invalidate();
    if flags.contains(PteFlags::D) {
        if let Backing::File {
            file,
            offset,
            read_bytes,
            mmap: true,
            ..
        } = backing
        {
            // Last chance for a dirty mmap page to reach its file. An I/O
            // error here is unrecoverable; the data is lost.
            let _ = kernel
                .frames
                .with_frame(pa, |bytes| file.write_at(*offset, &bytes[..*read_bytes]));
        }
    }
    drop(unsafe { Frame::from_raw(&kernel.frames, pa) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BootConfig;
    use alloc::{boxed::Box, sync::Arc, vec};
    use flat_fs::FlatFs;
    use plinth::dev::MemDisk;

    fn boot(user_frames: usize, swap_slots: usize) -> Arc<Kernel> {
        let fs = FlatFs::format(MemDisk::new(512)).unwrap();
        Kernel::boot(BootConfig {
            user_frames,
            swap_slots,
            fs,
            swap_disk: Box::new(MemDisk::new(swap_slots.max(1) * swap::SECTORS_PER_PAGE)),
        })
    }

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn zero_page_faults_in_zeroed() {
        let kernel = boot(4, 0);
        let space = AddressSpace::new();
        {
            let mut guard = space.lock();
            assert!(guard.spt.insert(va(0x8000), Backing::Zero));
            guard.unlock();
        }
        let mut buf = [0xffu8; 16];
        read_user(&kernel, &space, va(0x8004), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        // Resident now; one frame charged to this space.
        assert_eq!(kernel.frames.frames_owned_by(&space), 1);
        let mut guard = space.lock();
        destroy(&kernel, &mut guard);
        guard.unlock();
        assert_eq!(kernel.frames.frames_owned_by(&space), 0);
        assert_eq!(kernel.frames.free_frames(), 4);
    }

    #[test]
    fn unregistered_page_is_a_bad_address() {
        let kernel = boot(2, 0);
        let space = AddressSpace::new();
        let mut buf = [0u8; 4];
        assert_eq!(
            read_user(&kernel, &space, va(0x4000), &mut buf),
            Err(KernelError::BadAddress)
        );
    }

    #[test]
    fn write_to_read_only_page_is_refused() {
        let kernel = boot(4, 0);
        let space = AddressSpace::new();
        let file = kernel.fs.create("ro", PAGE_SIZE).unwrap();
        file.write_at(0, &[7u8; 64]).unwrap();
        register_segment(&space, &file, 0, va(0x8000), 64, PAGE_SIZE - 64, false).unwrap();

        let mut buf = [0u8; 64];
        read_user(&kernel, &space, va(0x8000), &mut buf).unwrap();
        assert_eq!(buf, [7u8; 64]);
        assert_eq!(
            write_user(&kernel, &space, va(0x8000), &[1]),
            Err(KernelError::InvalidAccess)
        );
    }

    #[test]
    fn segment_tail_is_zero_filled() {
        let kernel = boot(4, 0);
        let space = AddressSpace::new();
        let file = kernel.fs.create("seg", PAGE_SIZE).unwrap();
        file.write_at(0, &[0xaau8; 100]).unwrap();
        register_segment(&space, &file, 0, va(0x8000), 100, PAGE_SIZE - 100, true).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        read_user(&kernel, &space, va(0x8000), &mut buf).unwrap();
        assert!(buf[..100].iter().all(|&b| b == 0xaa));
        assert!(buf[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn eviction_swaps_dirty_pages_and_restores_them() {
        // 2 frames, 8 anonymous pages: every page cycles through swap.
        let kernel = boot(2, 16);
        let space = AddressSpace::new();
        {
            let mut guard = space.lock();
            for i in 0..8 {
                assert!(guard.spt.insert(va(0x10_0000 + i * PAGE_SIZE), Backing::Zero));
            }
            guard.unlock();
        }
        for i in 0..8u8 {
            let page = va(0x10_0000 + i as usize * PAGE_SIZE);
            write_user(&kernel, &space, page, &[i + 1; 32]).unwrap();
        }
        assert!(kernel.swap.used_slots() >= 6, "evicted pages must sit in swap");
        for i in 0..8u8 {
            let page = va(0x10_0000 + i as usize * PAGE_SIZE);
            let mut buf = [0u8; 32];
            read_user(&kernel, &space, page, &mut buf).unwrap();
            assert_eq!(buf, [i + 1; 32], "page {i} round-trips through swap");
        }

        let mut guard = space.lock();
        destroy(&kernel, &mut guard);
        guard.unlock();
        assert_eq!(kernel.swap.used_slots(), 0, "teardown releases swap slots");
        assert_eq!(kernel.frames.free_frames(), 2);
    }

    #[test]
    fn clean_file_pages_evict_without_swap() {
        // Read-only file pages are refaulted from the file, never swapped.
        let kernel = boot(2, 4);
        let space = AddressSpace::new();
        let file = kernel.fs.create("img", 8 * PAGE_SIZE).unwrap();
        let mut image = vec![0u8; 8 * PAGE_SIZE];
        for (i, chunk) in image.chunks_mut(PAGE_SIZE).enumerate() {
            chunk.fill(i as u8 + 1);
        }
        file.write_at(0, &image).unwrap();
        register_segment(&space, &file, 0, va(0x40_0000), 8 * PAGE_SIZE, 0, false).unwrap();

        for round in 0..2 {
            for i in 0..8usize {
                let mut buf = [0u8; 4];
                read_user(&kernel, &space, va(0x40_0000 + i * PAGE_SIZE), &mut buf).unwrap();
                assert_eq!(buf, [i as u8 + 1; 4], "round {round}");
            }
        }
        assert_eq!(kernel.swap.used_slots(), 0);
    }

    #[test]
    fn dirty_mmap_pages_write_back_on_unmap() {
        let kernel = boot(4, 0);
        let space = AddressSpace::new();
        let file = kernel.fs.create("data", 2 * PAGE_SIZE).unwrap();
        file.write_at(0, &vec![0x11u8; 2 * PAGE_SIZE]).unwrap();

        mmap(&space, &file, va(0x20_0000), 2 * PAGE_SIZE, 0, true).unwrap();
        write_user(&kernel, &space, va(0x20_0000 + 8), &[0xeeu8; 16]).unwrap();
        munmap(&kernel, &space, va(0x20_0000), 2 * PAGE_SIZE).unwrap();

        let mut buf = [0u8; 32];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0x11; 8]);
        assert_eq!(&buf[8..24], &[0xee; 16]);
        assert_eq!(kernel.frames.free_frames(), 4);
    }

    #[test]
    fn mmap_rejects_overlap() {
        let kernel = boot(4, 0);
        let space = AddressSpace::new();
        let file = kernel.fs.create("m", PAGE_SIZE).unwrap();
        mmap(&space, &file, va(0x20_0000), PAGE_SIZE, 0, true).unwrap();
        assert_eq!(
            mmap(&space, &file, va(0x20_0000), PAGE_SIZE, 0, true),
            Err(KernelError::FileExist)
        );
        assert_eq!(
            mmap(&space, &file, Va::new(0).unwrap(), PAGE_SIZE, 0, true),
            Err(KernelError::InvalidArgument)
        );
    }
}
