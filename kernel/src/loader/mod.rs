//! ELF loading.
//!
//! [`load`] turns an executable file into a runnable address space: it
//! validates the ELF32 image, registers every `PT_LOAD` segment as
//! demand-paged mappings in the supplemental page table (no frame is
//! touched at load time), installs the initial stack page, and lays out
//! argc/argv. The filesystem lock is held for the whole of loading so the
//! image cannot change under the loader, and released before control
//! heads back toward user mode.

pub mod elf;
pub mod stack_builder;

use crate::{
    Kernel, KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, PHYS_BASE, Va},
    mm::{self, SharedSpace},
};
use elf::{Elf, Phdr, SegmentType};
use flat_fs::FsFile;
use log::warn;

/// Where a freshly-loaded program starts: its entry point and initial
/// user stack pointer.
#[derive(Debug, Clone, Copy)]
pub struct LoadInfo {
    /// Entry point from the ELF header.
    pub entry: Va,
    /// Initial stack pointer, below the argument image.
    pub sp: Va,
}

/// Load the executable `file_name` into `space` and build its argument
/// stack from `tokens` (whose first element is the program name).
pub fn load(
    kernel: &Kernel,
    space: &SharedSpace,
    file_name: &str,
    tokens: &[&str],
) -> Result<LoadInfo, KernelError> {
    let fs_guard = kernel.filesys_lock.lock();
    let r = do_load(kernel, space, file_name, tokens);
    fs_guard.unlock();
    r
}

fn do_load(
    kernel: &Kernel,
    space: &SharedSpace,
    file_name: &str,
    tokens: &[&str],
) -> Result<LoadInfo, KernelError> {
    let file = kernel.fs.open(file_name).map_err(|e| {
        warn!("load: {}: open failed", file_name);
        KernelError::from(e)
    })?;

    let image = Elf::from_file(&file).inspect_err(|_| {
        warn!("load: {}: error loading executable", file_name);
    })?;

    for phdr in image.phdrs()? {
        match SegmentType::try_from(phdr.p_type) {
            Ok(SegmentType::Load) => {
                if !validate_segment(&phdr, &file) {
                    return Err(KernelError::NoExec);
                }
                load_segment(space, &file, &phdr)?;
            }
            // Harmless metadata segments.
            Ok(SegmentType::Null)
            | Ok(SegmentType::Note)
            | Ok(SegmentType::Phdr)
            | Ok(SegmentType::Stack) => {}
            // Dynamic executables and anything unrecognized are refused.
            _ => return Err(KernelError::NoExec),
        }
    }

    let top = mm::setup_stack(kernel, space)?;
    let sp = stack_builder::build_arguments(kernel, space, tokens, top)?;

    let entry = Va::new(image.header.e_entry as usize)
        .filter(|entry| entry.is_user())
        .ok_or(KernelError::NoExec)?;
    Ok(LoadInfo { entry, sp })
}

/// Checks whether `phdr` describes a valid, loadable segment in `file`.
fn validate_segment(phdr: &Phdr, file: &FsFile) -> bool {
    let (vaddr, memsz, filesz, offset) = (
        phdr.p_vaddr as usize,
        phdr.p_memsz as usize,
        phdr.p_filesz as usize,
        phdr.p_offset as usize,
    );

    // The file block and the virtual page must be congruent.
    if offset & PAGE_MASK != vaddr & PAGE_MASK {
        return false;
    }
    // The offset must point within the file.
    if offset > file.len() {
        return false;
    }
    // The in-memory span covers at least the file bytes and is non-empty.
    if memsz < filesz || memsz == 0 {
        return false;
    }
    // The region must start and end in user space, without wrapping.
    let end = vaddr + memsz;
    if end < vaddr || vaddr >= PHYS_BASE || end >= PHYS_BASE {
        return false;
    }
    // Mapping page 0 would let null pointers reach mapped memory.
    if vaddr < PAGE_SIZE {
        return false;
    }
    true
}

/// Register one `PT_LOAD` segment as demand-paged SPT entries.
fn load_segment(space: &SharedSpace, file: &FsFile, phdr: &Phdr) -> Result<(), KernelError> {
    let file_page = phdr.p_offset as usize & !PAGE_MASK;
    let mem_page = phdr.p_vaddr as usize & !PAGE_MASK;
    let page_offset = phdr.p_vaddr as usize & PAGE_MASK;

    let (read_bytes, zero_bytes) = if phdr.p_filesz > 0 {
        // Normal segment: initial part from disk, the rest zeroed.
        let read_bytes = page_offset + phdr.p_filesz as usize;
        let span = (page_offset + phdr.p_memsz as usize).next_multiple_of(PAGE_SIZE);
        (read_bytes, span - read_bytes)
    } else {
        // Entirely zero; nothing comes from disk.
        let span = (page_offset + phdr.p_memsz as usize).next_multiple_of(PAGE_SIZE);
        (0, span)
    };

    mm::register_segment(
        space,
        file,
        file_page,
        Va::new(mem_page).unwrap(),
        read_bytes,
        zero_bytes,
        phdr.writable(),
    )
}
