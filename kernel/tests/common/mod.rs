//! Shared harness for the end-to-end tests: boots isolated kernels and
//! synthesizes minimal ELF32 executables.

#![allow(dead_code)]

use flat_fs::FlatFs;
use nox::{BootConfig, Kernel};
use plinth::dev::MemDisk;
use std::sync::Arc;

pub const PAGE_SIZE: usize = 0x1000;
const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

/// One loadable segment of a synthesized executable.
pub struct Segment {
    pub vaddr: u32,
    pub data: Vec<u8>,
    /// In-memory size; at least `data.len()`, the tail is bss.
    pub memsz: u32,
    pub writable: bool,
}

/// Builds minimal, valid ELF32 i386 executables.
pub struct ElfBuilder {
    entry: u32,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    /// A code segment holding `data` at `vaddr`.
    pub fn code(self, vaddr: u32, data: &[u8]) -> Self {
        self.segment(Segment {
            vaddr,
            data: data.to_vec(),
            memsz: data.len() as u32,
            writable: false,
        })
    }

    /// A writable, zero-initialized segment of `pages` pages at `vaddr`.
    pub fn bss(self, vaddr: u32, pages: u32) -> Self {
        self.segment(Segment {
            vaddr,
            data: Vec::new(),
            memsz: pages * PAGE_SIZE as u32,
            writable: true,
        })
    }

    pub fn build(self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut image = vec![0u8; EHDR_SIZE + phnum * PHDR_SIZE];

        // Place each segment's file bytes page-congruent with its vaddr,
        // as the loader demands.
        let mut cursor = image.len();
        let mut phdrs = Vec::new();
        for seg in &self.segments {
            let offset = if seg.data.is_empty() {
                // Pure bss: any in-file, congruent offset will do.
                (seg.vaddr as usize) % PAGE_SIZE
            } else {
                let want = (seg.vaddr as usize) % PAGE_SIZE;
                let base = cursor - cursor % PAGE_SIZE;
                let ofs = if cursor % PAGE_SIZE <= want {
                    base + want
                } else {
                    base + PAGE_SIZE + want
                };
                image.resize(ofs + seg.data.len(), 0);
                image[ofs..ofs + seg.data.len()].copy_from_slice(&seg.data);
                cursor = ofs + seg.data.len();
                ofs
            };
            phdrs.push((offset as u32, seg));
        }

        let put = |image: &mut Vec<u8>, at: usize, bytes: &[u8]| {
            image[at..at + bytes.len()].copy_from_slice(bytes);
        };

        put(&mut image, 0, b"\x7fELF\x01\x01\x01");
        put(&mut image, 16, &2u16.to_le_bytes()); // e_type: executable
        put(&mut image, 18, &3u16.to_le_bytes()); // e_machine: i386
        put(&mut image, 20, &1u32.to_le_bytes()); // e_version
        put(&mut image, 24, &self.entry.to_le_bytes());
        put(&mut image, 28, &(EHDR_SIZE as u32).to_le_bytes()); // e_phoff
        put(&mut image, 40, &(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        put(&mut image, 42, &(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        put(&mut image, 44, &(phnum as u16).to_le_bytes());

        for (i, (offset, seg)) in phdrs.iter().enumerate() {
            let at = EHDR_SIZE + i * PHDR_SIZE;
            let flags = if seg.writable { 4 | 2 } else { 4 | 1 };
            put(&mut image, at, &1u32.to_le_bytes()); // PT_LOAD
            put(&mut image, at + 4, &offset.to_le_bytes());
            put(&mut image, at + 8, &seg.vaddr.to_le_bytes());
            put(&mut image, at + 16, &(seg.data.len() as u32).to_le_bytes());
            put(&mut image, at + 20, &seg.memsz.to_le_bytes());
            put(&mut image, at + 24, &(flags as u32).to_le_bytes());
            put(&mut image, at + 28, &(PAGE_SIZE as u32).to_le_bytes());
        }
        image
    }
}

/// A small program image: one read-only page of code at 0x08048000.
pub fn trivial_program() -> Vec<u8> {
    ElfBuilder::new(0x0804_8000)
        .code(0x0804_8000, &[0x90; 64]) // nops
        .build()
}

/// Boot a kernel whose filesystem holds the given `(name, image)` files.
pub fn boot(user_frames: usize, swap_slots: usize, files: &[(&str, &[u8])]) -> Arc<Kernel> {
    let fs = FlatFs::format(MemDisk::new(8192)).unwrap();
    for (name, image) in files {
        let f = fs.create(name, image.len().max(1)).unwrap();
        assert_eq!(f.write_at(0, image).unwrap(), image.len());
    }
    Kernel::boot(BootConfig {
        user_frames,
        swap_slots,
        fs,
        swap_disk: Box::new(MemDisk::new((swap_slots.max(1)) * 8)),
    })
}
