//! Buffered sector cache.
//!
//! A write-back cache of [`CACHE_SLOTS`] disk sectors sitting between the
//! filesystem and the block device; the filesystem is its sole caller. A
//! read or write that hits serves from memory. A miss claims a slot,
//! evicting the second-chance victim and writing it back first if it is
//! dirty. Writes dirty the slot and reach the disk only on eviction or
//! [`BlockCache::flush`], which is invoked on clean shutdown; dirty data
//! after the last flush is lost by design.
//!
//! Locking is split in two levels: a table lock protecting the
//! sector-to-slot index and per-slot metadata, and a reader/writer lock per
//! slot payload. A slot is pinned (`in_use`) while any caller holds or is
//! about to take its payload lock, which keeps eviction from repurposing it
//! mid-access; the eviction path releases the table lock around its own
//! disk I/O and re-validates the victim when it takes the lock back.

use crate::Error;
use crossbeam_utils::Backoff;
use plinth::{
    dev::{Disk, SECTOR_SIZE, Sector},
    rwlock::RwLock,
    spinlock::SpinLock,
};

/// Number of sectors the cache holds.
pub const CACHE_SLOTS: usize = 64;

/// Per-slot bookkeeping, all guarded by the table lock.
struct SlotMeta {
    /// Cached sector, or `None` for an empty slot.
    sector: Option<Sector>,
    dirty: bool,
    accessed: bool,
    /// Pin count. A pinned slot is never chosen as a victim.
    in_use: usize,
    /// Bumped on each dirtying release; detects writes that raced an
    /// in-flight writeback.
    generation: u64,
}

impl SlotMeta {
    const fn empty() -> Self {
        Self {
            sector: None,
            dirty: false,
            accessed: false,
            in_use: 0,
            generation: 0,
        }
    }
}

struct Table {
    meta: [SlotMeta; CACHE_SLOTS],
    hand: usize,
}

/// How a claimed slot gets its initial contents.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Populate from disk: the caller will read, or modify only part of the
    /// sector.
    FromDisk,
    /// The caller overwrites the whole sector; no prior read.
    Overwrite,
}

/// The buffered sector cache over a disk `D`.
pub struct BlockCache<D: Disk> {
    disk: D,
    table: SpinLock<Table>,
    slots: [RwLock<[u8; SECTOR_SIZE]>; CACHE_SLOTS],
}

impl<D: Disk> BlockCache<D> {
    /// Wraps `disk` with an empty cache.
    pub fn new(disk: D) -> Self {
        Self {
            disk,
            table: SpinLock::new(Table {
                meta: [const { SlotMeta::empty() }; CACHE_SLOTS],
                hand: 0,
            }),
            slots: [const { RwLock::new([0; SECTOR_SIZE]) }; CACHE_SLOTS],
        }
    }

    /// Read a whole sector through the cache.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        loop {
            let idx = self.pin(sector, Fill::FromDisk)?;
            let data = self.slots[idx].read();
            buf.copy_from_slice(&*data);
            data.unlock();
            if self.unpin(idx, sector, false) {
                return Ok(());
            }
        }
    }

    /// Write a whole sector through the cache. The slot is installed
    /// without a prior disk read.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        loop {
            let idx = self.pin(sector, Fill::Overwrite)?;
            let mut data = self.slots[idx].write();
            data.copy_from_slice(buf);
            data.unlock();
            if self.unpin(idx, sector, true) {
                return Ok(());
            }
        }
    }

    /// Read `buf.len()` bytes starting `offset` bytes into a sector.
    pub fn read_partial(
        &self,
        sector: Sector,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(), Error> {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        loop {
            let idx = self.pin(sector, Fill::FromDisk)?;
            let data = self.slots[idx].read();
            buf.copy_from_slice(&data[offset..offset + buf.len()]);
            data.unlock();
            if self.unpin(idx, sector, false) {
                return Ok(());
            }
        }
    }

    /// Write `buf.len()` bytes starting `offset` bytes into a sector.
    ///
    /// Read-modify-write: the rest of the sector keeps its on-disk (or
    /// cached) contents. The accessed flag and the dirty mark are only
    /// touched while the slot is pinned, so a concurrent eviction can not
    /// drop the modification.
    pub fn write_partial(&self, sector: Sector, buf: &[u8], offset: usize) -> Result<(), Error> {
        assert!(offset + buf.len() <= SECTOR_SIZE);
        loop {
            let idx = self.pin(sector, Fill::FromDisk)?;
            let mut data = self.slots[idx].write();
            data[offset..offset + buf.len()].copy_from_slice(buf);
            data.unlock();
            if self.unpin(idx, sector, true) {
                return Ok(());
            }
        }
    }

    /// Write every dirty slot back to the device.
    ///
    /// The only operation that guarantees durability.
    pub fn flush(&self) -> Result<(), Error> {
        for idx in 0..CACHE_SLOTS {
            let mut table = self.table.lock();
            let m = &mut table.meta[idx];
            let (sector, generation) = match (m.sector, m.dirty) {
                (Some(sector), true) => (sector, m.generation),
                _ => {
                    table.unlock();
                    continue;
                }
            };
            m.in_use += 1;
            table.unlock();

            let data = self.slots[idx].read();
            let r = self.disk.write(sector, &*data);
            data.unlock();

            let mut table = self.table.lock();
            let m = &mut table.meta[idx];
            if r.is_ok() && m.generation == generation {
                m.dirty = false;
            }
            m.in_use -= 1;
            table.unlock();
            r.map_err(Error::from)?;
        }
        Ok(())
    }

    /// Pin the slot caching `sector`, claiming and filling one on a miss.
    /// The returned index stays valid until [`Self::unpin`].
    fn pin(&self, sector: Sector, fill: Fill) -> Result<usize, Error> {
        let backoff = Backoff::new();
        loop {
            let mut table = self.table.lock();
            if let Some(idx) = table
                .meta
                .iter()
                .position(|m| m.sector == Some(sector))
            {
                let m = &mut table.meta[idx];
                m.in_use += 1;
                m.accessed = true;
                table.unlock();
                return Ok(idx);
            }

            let Some(victim) = Self::choose_victim(&mut table) else {
                // Every slot pinned; wait for one to come free.
                table.unlock();
                backoff.snooze();
                continue;
            };

            let m = &mut table.meta[victim];
            m.in_use += 1;
            if !m.dirty {
                return self.install(table, victim, sector, fill);
            }

            // Write the old contents back with the table lock released. The
            // victim keeps its old identity until the writeback is known
            // good, so concurrent lookups stay correct.
            let (old, generation) = (m.sector.unwrap(), m.generation);
            table.unlock();

            let data = self.slots[victim].read();
            let r = self.disk.write(old, &*data);
            data.unlock();

            let mut table = self.table.lock();
            let m = &mut table.meta[victim];
            if let Err(e) = r {
                m.in_use -= 1;
                table.unlock();
                return Err(Error::from(e));
            }
            if m.in_use != 1 || m.generation != generation {
                // Somebody found the old sector (or re-dirtied it) while we
                // were writing. Leave it alone and start over.
                m.in_use -= 1;
                table.unlock();
                continue;
            }
            m.dirty = false;
            if table.meta.iter().any(|m| m.sector == Some(sector)) {
                // The wanted sector got installed elsewhere during our
                // writeback; drop the victim pin and take the hit path.
                table.meta[victim].in_use -= 1;
                table.unlock();
                continue;
            }
            return self.install(table, victim, sector, fill);
        }
    }

    /// Repurpose the pinned, clean `victim` for `sector` and fill it.
    fn install(
        &self,
        mut table: plinth::spinlock::SpinLockGuard<'_, Table>,
        victim: usize,
        sector: Sector,
        fill: Fill,
    ) -> Result<usize, Error> {
        let m = &mut table.meta[victim];
        debug_assert_eq!(m.in_use, 1);
        debug_assert!(!m.dirty);
        m.sector = Some(sector);
        m.accessed = true;
        // The payload lock is taken before the new identity becomes
        // reachable, so a racing lookup blocks until the fill is done.
        let mut data = self.slots[victim].write();
        table.unlock();

        let r = match fill {
            Fill::FromDisk => self.disk.read(sector, &mut *data),
            Fill::Overwrite => {
                data.fill(0);
                Ok(())
            }
        };
        data.unlock();
        if let Err(e) = r {
            let mut table = self.table.lock();
            let m = &mut table.meta[victim];
            m.sector = None;
            m.accessed = false;
            m.in_use -= 1;
            table.unlock();
            return Err(Error::from(e));
        }
        Ok(victim)
    }

    /// Second-chance scan for an unpinned victim. Prefers empty slots.
    fn choose_victim(table: &mut Table) -> Option<usize> {
        if let Some(idx) = table
            .meta
            .iter()
            .position(|m| m.sector.is_none() && m.in_use == 0)
        {
            return Some(idx);
        }
        for _ in 0..2 * CACHE_SLOTS {
            let idx = table.hand;
            table.hand = (table.hand + 1) % CACHE_SLOTS;
            let m = &mut table.meta[idx];
            if m.in_use != 0 {
                continue;
            }
            if m.accessed {
                m.accessed = false;
                continue;
            }
            return Some(idx);
        }
        None
    }

    /// Release a pin. Returns `false` when the slot lost its identity while
    /// pinned (a racing fill failed), in which case the caller's access is
    /// void and must be retried.
    fn unpin(&self, idx: usize, sector: Sector, dirtied: bool) -> bool {
        let mut table = self.table.lock();
        let m = &mut table.meta[idx];
        m.in_use -= 1;
        if m.sector != Some(sector) {
            table.unlock();
            return false;
        }
        m.accessed = true;
        if dirtied {
            m.dirty = true;
            m.generation += 1;
        }
        table.unlock();
        true
    }

    /// Number of dirty slots; test and diagnostics aid.
    pub fn dirty_slots(&self) -> usize {
        let table = self.table.lock();
        let n = table.meta.iter().filter(|m| m.dirty).count();
        table.unlock();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth::dev::MemDisk;
    use std::sync::Arc;

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn write_is_buffered_until_flush() {
        let disk = Arc::new(MemDisk::new(128));
        let cache = BlockCache::new(Arc::clone(&disk) as Arc<dyn Disk>);
        cache.write(Sector(5), &sector_of(0xab)).unwrap();

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(Sector(5), &mut raw).unwrap();
        assert_eq!(raw, sector_of(0), "write-back cache must not write through");

        cache.flush().unwrap();
        disk.read(Sector(5), &mut raw).unwrap();
        assert_eq!(raw, sector_of(0xab));
        assert_eq!(cache.dirty_slots(), 0);
    }

    #[test]
    fn eviction_pressure_preserves_data() {
        let disk = MemDisk::new(1024);
        let cache = BlockCache::new(disk);
        // Three times the cache capacity, so eviction certainly runs.
        for i in 0..3 * CACHE_SLOTS {
            cache.write(Sector(i), &sector_of(i as u8)).unwrap();
        }
        for i in 0..3 * CACHE_SLOTS {
            let mut buf = [0u8; SECTOR_SIZE];
            cache.read(Sector(i), &mut buf).unwrap();
            assert_eq!(buf, sector_of(i as u8), "sector {i} lost under pressure");
        }
    }

    #[test]
    fn partial_write_is_read_modify_write() {
        let disk = MemDisk::new(16);
        let mut raw = sector_of(0x11);
        disk.write(Sector(2), &raw).unwrap();

        let cache = BlockCache::new(disk);
        cache.write_partial(Sector(2), &[0xee; 8], 100).unwrap();

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(Sector(2), &mut buf).unwrap();
        raw[100..108].copy_from_slice(&[0xee; 8]);
        assert_eq!(buf, raw, "bytes around a partial write must survive");
    }

    #[test]
    fn partial_read_returns_slice() {
        let disk = MemDisk::new(16);
        let mut raw = [0u8; SECTOR_SIZE];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        disk.write(Sector(0), &raw).unwrap();
        let cache = BlockCache::new(disk);
        let mut out = [0u8; 16];
        cache.read_partial(Sector(0), &mut out, 32).unwrap();
        assert_eq!(&out[..], &raw[32..48]);
    }

    #[test]
    fn io_error_propagates_without_retry() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        let reads = Arc::new(AtomicUsize::new(0));
        let reads2 = Arc::clone(&reads);
        let disk = MemDisk::new(16).hook(Arc::new(move |_, is_write| {
            if !is_write {
                reads2.fetch_add(1, Ordering::SeqCst);
                Err(plinth::dev::DiskError)
            } else {
                Ok(())
            }
        }));
        let cache = BlockCache::new(disk);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(cache.read(Sector(1), &mut buf), Err(Error::Disk));
        assert_eq!(reads.load(Ordering::SeqCst), 1, "no retries on I/O error");
        // The failed slot must not be left claiming the sector.
        assert_eq!(cache.read(Sector(1), &mut buf), Err(Error::Disk));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let disk = MemDisk::new(256);
        let cache = Arc::new(BlockCache::new(disk));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..64usize {
                        let sector = Sector(t * 64 + i);
                        cache.write(sector, &sector_of((t * 64 + i) as u8)).unwrap();
                        let mut buf = [0u8; SECTOR_SIZE];
                        cache.read(sector, &mut buf).unwrap();
                        assert_eq!(buf[0], (t * 64 + i) as u8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        cache.flush().unwrap();
    }
}
