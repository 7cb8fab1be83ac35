//! ELF32 parsing.
//!
//! The Executable and Linkable Format is the standard format for
//! executables. Nox loads statically-linked ELF32 executables for i386;
//! only the ELF header and the program headers matter here, section
//! headers are ignored.

use crate::KernelError;
use alloc::vec;
use alloc::vec::Vec;
use flat_fs::FsFile;
use num_enum::TryFromPrimitive;

/// Size of the ELF32 executable header.
pub const EHDR_SIZE: usize = 52;
/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

/// The ELF32 executable header.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Ehdr {
    /// Identification bytes: magic, class, data encoding, version, padding.
    pub e_ident: [u8; 16],
    /// Object file type (2 = executable).
    pub e_type: u16,
    /// Target instruction set (3 = i386).
    pub e_machine: u16,
    /// ELF version (must be 1).
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u32,
    /// File offset of the program header table.
    pub e_phoff: u32,
    /// File offset of the section header table (ignored).
    pub e_shoff: u32,
    /// Processor-specific flags.
    pub e_flags: u32,
    /// Size of this header.
    pub e_ehsize: u16,
    /// Size of one program header table entry.
    pub e_phentsize: u16,
    /// Number of program headers.
    pub e_phnum: u16,
    /// Size of one section header table entry (ignored).
    pub e_shentsize: u16,
    /// Number of section headers (ignored).
    pub e_shnum: u16,
    /// Section name string table index (ignored).
    pub e_shstrndx: u16,
}

/// ELF program header (segment) types.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
pub enum SegmentType {
    /// Unused segment; ignored.
    Null = 0,
    /// Loadable segment.
    Load = 1,
    /// Dynamic linking information; refused.
    Dynamic = 2,
    /// Interpreter path; refused.
    Interp = 3,
    /// Auxiliary information; ignored.
    Note = 4,
    /// Reserved; refused.
    Shlib = 5,
    /// The program header table itself; ignored.
    Phdr = 6,
    /// Thread-local storage template; refused.
    Tls = 7,
    /// Stack attributes; ignored.
    Stack = 0x6474_e551,
}

bitflags::bitflags! {
    /// Segment permission flags.
    pub struct PFlags: u32 {
        /// Segment is executable.
        const X = 1 << 0;
        /// Segment is writable.
        const W = 1 << 1;
        /// Segment is readable.
        const R = 1 << 2;
    }
}

/// An ELF32 program header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Phdr {
    /// Segment type; see [`SegmentType`].
    pub p_type: u32,
    /// File offset of the segment's bytes.
    pub p_offset: u32,
    /// Virtual address the segment loads at.
    pub p_vaddr: u32,
    /// Physical address; unused.
    pub p_paddr: u32,
    /// Bytes of the segment present in the file.
    pub p_filesz: u32,
    /// Bytes of the segment in memory; the tail past `p_filesz` is
    /// zero-filled.
    pub p_memsz: u32,
    /// Permission flags.
    pub p_flags: u32,
    /// Alignment.
    pub p_align: u32,
}

impl Phdr {
    /// Whether the segment is mapped writable.
    pub fn writable(&self) -> bool {
        PFlags::from_bits_truncate(self.p_flags).contains(PFlags::W)
    }
}

/// A validated ELF image backed by an open file.
pub struct Elf<'a> {
    /// The parsed header.
    pub header: Ehdr,
    file: &'a FsFile,
}

impl<'a> Elf<'a> {
    /// Reads and verifies the executable header.
    ///
    /// The image is accepted only when the magic, class, encoding, and
    /// version identification match a little-endian ELF32, it is an
    /// executable (`e_type == 2`) for i386 (`e_machine == 3`) with
    /// `e_version == 1`, a program-header entry size of [`PHDR_SIZE`],
    /// and at most 1024 program headers.
    pub fn from_file(file: &'a FsFile) -> Result<Self, KernelError> {
        union HeaderUnion {
            raw: [u8; EHDR_SIZE],
            header: Ehdr,
        }
        let header = unsafe {
            let mut u = HeaderUnion {
                raw: [0; EHDR_SIZE],
            };
            if file.read_at(0, &mut u.raw)? != EHDR_SIZE {
                return Err(KernelError::NoExec);
            }
            u.header
        };

        if &header.e_ident[..7] == b"\x7fELF\x01\x01\x01"
            && header.e_type == 2
            && header.e_machine == 3
            && header.e_version == 1
            && header.e_phentsize as usize == PHDR_SIZE
            && header.e_phnum <= 1024
        {
            Ok(Self { header, file })
        } else {
            Err(KernelError::NoExec)
        }
    }

    /// Reads the program header table.
    pub fn phdrs(&self) -> Result<Vec<Phdr>, KernelError> {
        union PhdrUnion {
            raw: [u8; PHDR_SIZE],
            phdr: Phdr,
        }
        let base = self.header.e_phoff as usize;
        let count = self.header.e_phnum as usize;
        if base > self.file.len() {
            return Err(KernelError::NoExec);
        }
        let mut buffer = vec![0u8; count * PHDR_SIZE];
        if self.file.read_at(base, &mut buffer)? != buffer.len() {
            return Err(KernelError::NoExec);
        }
        Ok(buffer
            .chunks_exact(PHDR_SIZE)
            .map(|chunk| unsafe {
                let mut u = PhdrUnion {
                    raw: [0; PHDR_SIZE],
                };
                u.raw.copy_from_slice(chunk);
                u.phdr
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flat_fs::FlatFs;
    use plinth::dev::MemDisk;

    fn put(buf: &mut Vec<u8>, at: usize, bytes: &[u8]) {
        if buf.len() < at + bytes.len() {
            buf.resize(at + bytes.len(), 0);
        }
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// A minimal valid header with no program headers.
    fn valid_header() -> Vec<u8> {
        let mut h = vec![0u8; EHDR_SIZE];
        put(&mut h, 0, b"\x7fELF\x01\x01\x01");
        put(&mut h, 16, &2u16.to_le_bytes()); // e_type
        put(&mut h, 18, &3u16.to_le_bytes()); // e_machine
        put(&mut h, 20, &1u32.to_le_bytes()); // e_version
        put(&mut h, 24, &0x0804_8000u32.to_le_bytes()); // e_entry
        put(&mut h, 28, &(EHDR_SIZE as u32).to_le_bytes()); // e_phoff
        put(&mut h, 42, &(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        put(&mut h, 44, &0u16.to_le_bytes()); // e_phnum
        h
    }

    fn as_file(bytes: &[u8]) -> FsFile {
        let fs = FlatFs::format(MemDisk::new(256)).unwrap();
        let f = fs.create("img", bytes.len().max(1)).unwrap();
        assert_eq!(f.write_at(0, bytes).unwrap(), bytes.len());
        f
    }

    #[test]
    fn accepts_a_valid_header() {
        let f = as_file(&valid_header());
        let elf = Elf::from_file(&f).unwrap();
        assert_eq!(elf.header.e_entry, 0x0804_8000);
        assert!(elf.phdrs().unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_headers() {
        let mut cases: Vec<(&str, Vec<u8>)> = Vec::new();

        let mut h = valid_header();
        put(&mut h, 0, b"\x7fELG");
        cases.push(("magic", h));

        let mut h = valid_header();
        h[4] = 2; // 64-bit class
        cases.push(("class", h));

        let mut h = valid_header();
        put(&mut h, 16, &3u16.to_le_bytes()); // shared object
        cases.push(("type", h));

        let mut h = valid_header();
        put(&mut h, 18, &0x3eu16.to_le_bytes()); // x86-64
        cases.push(("machine", h));

        let mut h = valid_header();
        put(&mut h, 20, &2u32.to_le_bytes());
        cases.push(("version", h));

        let mut h = valid_header();
        put(&mut h, 42, &64u16.to_le_bytes());
        cases.push(("phentsize", h));

        let mut h = valid_header();
        put(&mut h, 44, &2000u16.to_le_bytes());
        cases.push(("phnum", h));

        cases.push(("truncated", valid_header()[..20].to_vec()));

        for (what, bytes) in cases {
            let f = as_file(&bytes);
            assert_eq!(
                Elf::from_file(&f).err(),
                Some(KernelError::NoExec),
                "header with bad {what} must be refused"
            );
        }
    }

    #[test]
    fn segment_type_conversion() {
        assert_eq!(SegmentType::try_from(1u32), Ok(SegmentType::Load));
        assert_eq!(
            SegmentType::try_from(0x6474_e551u32),
            Ok(SegmentType::Stack)
        );
        assert!(SegmentType::try_from(0x6474_e550u32).is_err());
    }
}
