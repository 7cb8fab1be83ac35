//! Block devices.
//!
//! A block device is addressed in 512-byte [`Sector`]s through the [`Disk`]
//! trait. The sector cache in `flat_fs` is the sole caller for filesystem
//! data; the swap space drives its disk raw. [`MemDisk`] backs both in
//! harnesses, with an optional I/O hook for fault injection.

use crate::spinlock::SpinLock;
use alloc::{boxed::Box, sync::Arc, vec};

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 512;

/// Sector, the access granularity of a disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Sector(pub usize);

impl Sector {
    /// Get the byte offset represented by the sector.
    #[inline]
    pub const fn into_offset(self) -> usize {
        self.0 * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Computes the sector containing a byte offset.
    #[inline]
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / SECTOR_SIZE)
    }
}

impl core::ops::Add<usize> for Sector {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// A device-level I/O failure.
///
/// The cache and the swap space propagate this without retrying.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DiskError;

/// The disk, a device with a 512-byte sector sink.
pub trait Disk
where
    Self: Send + Sync,
{
    /// Read one sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DiskError>;

    /// Write one sector from `buf`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), DiskError>;

    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;
}

impl<D: Disk + ?Sized> Disk for Box<D> {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DiskError> {
        (**self).read(sector, buf)
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), DiskError> {
        (**self).write(sector, buf)
    }

    fn sector_count(&self) -> usize {
        (**self).sector_count()
    }
}

impl<D: Disk + ?Sized> Disk for Arc<D> {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DiskError> {
        (**self).read(sector, buf)
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), DiskError> {
        (**self).write(sector, buf)
    }

    fn sector_count(&self) -> usize {
        (**self).sector_count()
    }
}

/// A hook invoked before each [`MemDisk`] transfer. `true` marks a write.
pub type Hook = Arc<dyn Fn(Sector, bool) -> Result<(), DiskError> + Send + Sync>;

/// A RAM-backed disk.
pub struct MemDisk {
    sectors: SpinLock<Box<[u8]>>,
    count: usize,
    hook: Option<Hook>,
}

impl MemDisk {
    /// Create a zero-filled disk of `count` sectors.
    pub fn new(count: usize) -> Self {
        Self {
            sectors: SpinLock::new(vec![0u8; count * SECTOR_SIZE].into_boxed_slice()),
            count,
            hook: None,
        }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            sectors: self.sectors,
            count: self.count,
            hook: Some(hook),
        }
    }
}

impl Disk for MemDisk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DiskError> {
        if sector.into_usize() >= self.count {
            return Err(DiskError);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, false)?;
        }
        let guard = self.sectors.lock();
        let ofs = sector.into_offset();
        buf.copy_from_slice(&guard[ofs..ofs + SECTOR_SIZE]);
        guard.unlock();
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), DiskError> {
        if sector.into_usize() >= self.count {
            return Err(DiskError);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, true)?;
        }
        let mut guard = self.sectors.lock();
        let ofs = sector.into_offset();
        guard[ofs..ofs + SECTOR_SIZE].copy_from_slice(buf);
        guard.unlock();
        Ok(())
    }

    fn sector_count(&self) -> usize {
        self.count
    }
}
