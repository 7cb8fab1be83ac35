//! A flat filesystem over a buffered sector cache.
//!
//! `flat_fs` keeps a fixed directory of contiguously-allocated files: one
//! superblock sector, five directory sectors, then data. There are no
//! subdirectories, no growth past a file's creation-time capacity, and no
//! free-extent reuse; it exists to hold executables and data files for the
//! kernel above it and to exercise the [`cache`] underneath, which carries
//! every byte of filesystem I/O to the device.
//!
//! Durability follows the cache's write-back policy: nothing is guaranteed
//! on disk until [`FlatFs::flush`].

#![cfg_attr(not(test), no_std)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod cache;

pub use plinth::dev::{Disk, DiskError, SECTOR_SIZE, Sector};

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use cache::BlockCache;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::debug;
use plinth::spinlock::SpinLock;

/// Maximum file-name length, excluding the terminator.
pub const NAME_LEN: usize = 27;
/// Number of directory entries the filesystem can hold.
pub const DIR_ENTRIES: usize = 64;

const MAGIC: [u8; 8] = *b"FLATFS\x00\x01";
const ENTRY_SIZE: usize = 40;
/// Superblock, then the directory, then data.
const DIR_BYTE_OFFSET: usize = SECTOR_SIZE;
const DIR_BYTES: usize = DIR_ENTRIES * ENTRY_SIZE;
const DATA_START: usize = 1 + DIR_BYTES.div_ceil(SECTOR_SIZE);

/// Filesystem-level errors. The kernel maps these onto its own error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying device failed.
    Disk,
    /// The on-disk image is not a flat_fs or is inconsistent.
    Corrupted,
    /// No directory entry with the requested name.
    NoSuchFile,
    /// A directory entry with the requested name already exists.
    FileExists,
    /// The directory is full.
    TooManyFiles,
    /// Not enough unallocated sectors for the requested capacity.
    NoSpace,
    /// The file name does not fit a directory entry.
    NameTooLong,
}

impl From<DiskError> for Error {
    fn from(_: DiskError) -> Self {
        Error::Disk
    }
}

#[derive(Clone)]
struct DirEntry {
    name: [u8; NAME_LEN + 1],
    start: u32,
    capacity: u32,
    length: u32,
}

impl DirEntry {
    const fn empty() -> Self {
        Self {
            name: [0; NAME_LEN + 1],
            start: 0,
            capacity: 0,
            length: 0,
        }
    }

    fn in_use(&self) -> bool {
        self.name[0] != 0
    }

    fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[..NAME_LEN + 1].copy_from_slice(&self.name);
        out[28..32].copy_from_slice(&self.start.to_le_bytes());
        out[32..36].copy_from_slice(&self.capacity.to_le_bytes());
        out[36..40].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; ENTRY_SIZE]) -> Self {
        let mut name = [0u8; NAME_LEN + 1];
        name.copy_from_slice(&raw[..NAME_LEN + 1]);
        let word = |at: usize| u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
        Self {
            name,
            start: word(28),
            capacity: word(32),
            length: word(36),
        }
    }
}

struct FsState {
    entries: [DirEntry; DIR_ENTRIES],
    next_free: u32,
}

struct NodeInner {
    index: usize,
    start: Sector,
    /// Capacity in sectors, fixed at creation.
    capacity: usize,
    /// Current file length in bytes.
    length: AtomicUsize,
    /// While positive, writes are refused. See [`FsFile::deny_write`].
    deny_write: AtomicUsize,
}

struct FlatFsInner {
    cache: BlockCache<Box<dyn Disk>>,
    state: SpinLock<FsState>,
    nodes: SpinLock<BTreeMap<usize, Weak<NodeInner>>>,
    sector_count: usize,
}

/// A handle to a mounted flat filesystem.
#[derive(Clone)]
pub struct FlatFs(Arc<FlatFsInner>);

impl FlatFs {
    /// Writes a fresh, empty filesystem onto `disk` and mounts it.
    pub fn format(disk: impl Disk + 'static) -> Result<Self, Error> {
        let sector_count = disk.sector_count();
        if sector_count <= DATA_START {
            return Err(Error::NoSpace);
        }
        let inner = FlatFsInner {
            cache: BlockCache::new(Box::new(disk)),
            state: SpinLock::new(FsState {
                entries: [const { DirEntry::empty() }; DIR_ENTRIES],
                next_free: DATA_START as u32,
            }),
            nodes: SpinLock::new(BTreeMap::new()),
            sector_count,
        };
        let fs = FlatFs(Arc::new(inner));
        let state = fs.0.state.lock();
        let mut r = fs.write_superblock(&state);
        for idx in 0..DIR_ENTRIES {
            if r.is_err() {
                break;
            }
            r = fs.write_dir_entry(idx, &state.entries[idx]);
        }
        state.unlock();
        r?;
        debug!("flat_fs: formatted {} sectors", sector_count);
        Ok(fs)
    }

    /// Mounts the filesystem already present on `disk`.
    pub fn mount(disk: impl Disk + 'static) -> Result<Self, Error> {
        let sector_count = disk.sector_count();
        let cache = BlockCache::new(Box::new(disk) as Box<dyn Disk>);

        let mut sb = [0u8; 16];
        cache.read_partial(Sector(0), &mut sb, 0)?;
        if sb[..8] != MAGIC {
            return Err(Error::Corrupted);
        }
        let next_free = u32::from_le_bytes(sb[8..12].try_into().unwrap());
        if (next_free as usize) < DATA_START || next_free as usize > sector_count {
            return Err(Error::Corrupted);
        }

        let mut entries = [const { DirEntry::empty() }; DIR_ENTRIES];
        for (idx, entry) in entries.iter_mut().enumerate() {
            let mut raw = [0u8; ENTRY_SIZE];
            read_meta(&cache, DIR_BYTE_OFFSET + idx * ENTRY_SIZE, &mut raw)?;
            let decoded = DirEntry::decode(&raw);
            if decoded.in_use()
                && (decoded.start as usize) < DATA_START
            {
                return Err(Error::Corrupted);
            }
            *entry = decoded;
        }
        debug!("flat_fs: mounted, next free sector {}", next_free);
        Ok(FlatFs(Arc::new(FlatFsInner {
            cache,
            state: SpinLock::new(FsState { entries, next_free }),
            nodes: SpinLock::new(BTreeMap::new()),
            sector_count,
        })))
    }

    /// Creates an empty file with room for `capacity` bytes.
    pub fn create(&self, name: &str, capacity: usize) -> Result<FsFile, Error> {
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(Error::NameTooLong);
        }
        let sectors = capacity.div_ceil(SECTOR_SIZE).max(1);
        let mut state = self.0.state.lock();
        if state.entries.iter().any(|e| e.in_use() && e.name_str() == name) {
            state.unlock();
            return Err(Error::FileExists);
        }
        let Some(idx) = state.entries.iter().position(|e| !e.in_use()) else {
            state.unlock();
            return Err(Error::TooManyFiles);
        };
        let start = state.next_free;
        if start as usize + sectors > self.0.sector_count {
            state.unlock();
            return Err(Error::NoSpace);
        }
        state.next_free += sectors as u32;
        let mut entry = DirEntry::empty();
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.start = start;
        entry.capacity = sectors as u32;
        entry.length = 0;
        state.entries[idx] = entry.clone();
        let r = self
            .write_superblock(&state)
            .and_then(|_| self.write_dir_entry(idx, &entry));
        state.unlock();
        r?;
        Ok(self.node_for(idx, &entry))
    }

    /// Opens an existing file by name.
    pub fn open(&self, name: &str) -> Result<FsFile, Error> {
        let state = self.0.state.lock();
        let found = state
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.in_use() && e.name_str() == name)
            .map(|(idx, e)| (idx, e.clone()));
        state.unlock();
        let (idx, entry) = found.ok_or(Error::NoSuchFile)?;
        Ok(self.node_for(idx, &entry))
    }

    /// Writes all dirty cached sectors to the device.
    pub fn flush(&self) -> Result<(), Error> {
        self.0.cache.flush()
    }

    /// The sector cache carrying this filesystem's I/O.
    pub fn cache(&self) -> &BlockCache<Box<dyn Disk>> {
        &self.0.cache
    }

    fn node_for(&self, idx: usize, entry: &DirEntry) -> FsFile {
        let mut nodes = self.0.nodes.lock();
        let node = match nodes.get(&idx).and_then(Weak::upgrade) {
            Some(node) => node,
            None => {
                let node = Arc::new(NodeInner {
                    index: idx,
                    start: Sector(entry.start as usize),
                    capacity: entry.capacity as usize,
                    length: AtomicUsize::new(entry.length as usize),
                    deny_write: AtomicUsize::new(0),
                });
                nodes.insert(idx, Arc::downgrade(&node));
                node
            }
        };
        nodes.unlock();
        FsFile {
            fs: self.clone(),
            node,
        }
    }

    fn write_superblock(&self, state: &FsState) -> Result<(), Error> {
        let mut sb = [0u8; 16];
        sb[..8].copy_from_slice(&MAGIC);
        sb[8..12].copy_from_slice(&state.next_free.to_le_bytes());
        self.0.cache.write_partial(Sector(0), &sb, 0)?;
        Ok(())
    }

    fn write_dir_entry(&self, idx: usize, entry: &DirEntry) -> Result<(), Error> {
        write_meta(
            &self.0.cache,
            DIR_BYTE_OFFSET + idx * ENTRY_SIZE,
            &entry.encode(),
        )
    }
}

/// Read metadata bytes addressed from the start of the device, crossing
/// sector boundaries as needed.
fn read_meta(
    cache: &BlockCache<Box<dyn Disk>>,
    mut at: usize,
    buf: &mut [u8],
) -> Result<(), Error> {
    let mut done = 0;
    while done < buf.len() {
        let within = at % SECTOR_SIZE;
        let chunk = (SECTOR_SIZE - within).min(buf.len() - done);
        cache.read_partial(Sector(at / SECTOR_SIZE), &mut buf[done..done + chunk], within)?;
        at += chunk;
        done += chunk;
    }
    Ok(())
}

/// Write metadata bytes addressed from the start of the device.
fn write_meta(
    cache: &BlockCache<Box<dyn Disk>>,
    mut at: usize,
    buf: &[u8],
) -> Result<(), Error> {
    let mut done = 0;
    while done < buf.len() {
        let within = at % SECTOR_SIZE;
        let chunk = (SECTOR_SIZE - within).min(buf.len() - done);
        cache.write_partial(Sector(at / SECTOR_SIZE), &buf[done..done + chunk], within)?;
        at += chunk;
        done += chunk;
    }
    Ok(())
}

/// A handle to a regular file.
///
/// Handles opened from the same directory entry share one node, so a
/// write denial placed through any handle binds them all.
#[derive(Clone)]
pub struct FsFile {
    fs: FlatFs,
    node: Arc<NodeInner>,
}

impl FsFile {
    /// Current file length in bytes.
    pub fn len(&self) -> usize {
        self.node.length.load(Ordering::Acquire)
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity in bytes, fixed at creation.
    pub fn capacity(&self) -> usize {
        self.node.capacity * SECTOR_SIZE
    }

    /// Reads up to `buf.len()` bytes at byte offset `offset`. Returns the
    /// number of bytes read; short when the read crosses end of file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let len = self.len();
        if offset >= len {
            return Ok(0);
        }
        let todo = buf.len().min(len - offset);
        let mut done = 0;
        while done < todo {
            let at = offset + done;
            let within = at % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(todo - done);
            self.fs.0.cache.read_partial(
                self.node.start + at / SECTOR_SIZE,
                &mut buf[done..done + chunk],
                within,
            )?;
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at byte offset `offset`, extending the file length up
    /// to its capacity. Returns the number of bytes written: 0 while writes
    /// are denied, short when capacity is exhausted.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, Error> {
        if self.node.deny_write.load(Ordering::Acquire) > 0 {
            return Ok(0);
        }
        let cap = self.capacity();
        if offset >= cap {
            return Ok(0);
        }
        let todo = buf.len().min(cap - offset);
        let mut done = 0;
        while done < todo {
            let at = offset + done;
            let within = at % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(todo - done);
            let sector = self.node.start + at / SECTOR_SIZE;
            if chunk == SECTOR_SIZE {
                self.fs
                    .0
                    .cache
                    .write(sector, buf[done..done + chunk].try_into().unwrap())?;
            } else {
                self.fs
                    .0
                    .cache
                    .write_partial(sector, &buf[done..done + chunk], within)?;
            }
            done += chunk;
        }
        if done > 0 {
            self.extend_length(offset + done)?;
        }
        Ok(done)
    }

    /// Forbid writes through any handle to this file until a matching
    /// [`FsFile::allow_write`].
    pub fn deny_write(&self) {
        self.node.deny_write.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-allow writes denied by [`FsFile::deny_write`].
    pub fn allow_write(&self) {
        let prev = self.node.deny_write.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allow_write without deny_write");
    }

    fn extend_length(&self, min_len: usize) -> Result<(), Error> {
        if self.node.length.load(Ordering::Acquire) >= min_len {
            return Ok(());
        }
        let mut state = self.fs.0.state.lock();
        let entry = &mut state.entries[self.node.index];
        if (entry.length as usize) < min_len {
            entry.length = min_len as u32;
            self.node.length.store(min_len, Ordering::Release);
            let entry = entry.clone();
            let idx = self.node.index;
            let r = self.fs.write_dir_entry(idx, &entry);
            state.unlock();
            return r;
        }
        state.unlock();
        Ok(())
    }
}
