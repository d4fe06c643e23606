//! Block device abstraction.
//!
//! The filesystem is written against this trait so the same code path
//! serves the real ATA disk in the kernel and a RAM-backed device in tests.

use alloc::vec;
use alloc::vec::Vec;

use super::BLOCK_SIZE;
use crate::{ata, KernelError, KernelResult};

/// A device addressable in [`BLOCK_SIZE`] units.
pub trait BlockDevice: Send {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Read one block into `buf` (must be exactly one block long).
    ///
    /// # Errors
    /// Device-specific I/O failures or an out-of-range index.
    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> KernelResult<()>;

    /// Write one block from `buf` (must be exactly one block long).
    ///
    /// # Errors
    /// Device-specific I/O failures or an out-of-range index.
    fn write_block(&mut self, index: u64, buf: &[u8]) -> KernelResult<()>;
}

/// An ATA drive exposed at block granularity (eight sectors per block).
pub struct AtaBlockDevice {
    drive: u8,
    block_count: u64,
}

const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / ata::SECTOR_SIZE) as u32;

impl AtaBlockDevice {
    /// Wrap a detected drive.
    ///
    /// # Errors
    /// [`KernelError::NotFound`] when the drive did not answer the probe,
    /// [`KernelError::InvalidArgument`] for an out-of-range drive number.
    pub fn new(drive: u8) -> KernelResult<Self> {
        let info = ata::drive_info(drive)?;
        Ok(Self {
            drive,
            block_count: info.sectors / u64::from(SECTORS_PER_BLOCK),
        })
    }

    /// The underlying drive number.
    #[must_use]
    pub const fn drive(&self) -> u8 {
        self.drive
    }
}

impl BlockDevice for AtaBlockDevice {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> KernelResult<()> {
        ata::read_sectors(
            self.drive,
            index * u64::from(SECTORS_PER_BLOCK),
            SECTORS_PER_BLOCK,
            buf,
        )
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> KernelResult<()> {
        ata::write_sectors(
            self.drive,
            index * u64::from(SECTORS_PER_BLOCK),
            SECTORS_PER_BLOCK,
            buf,
        )
    }
}

/// RAM-backed block device: the test double and a usable ramdisk.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    /// Allocate a zeroed ramdisk of `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            data: vec![0_u8; block_count as usize * BLOCK_SIZE],
        }
    }

    fn range(&self, index: u64, len: usize) -> KernelResult<core::ops::Range<usize>> {
        if len != BLOCK_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let start = index as usize * BLOCK_SIZE;
        let end = start + BLOCK_SIZE;
        if end > self.data.len() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE) as u64
    }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> KernelResult<()> {
        let range = self.range(index, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> KernelResult<()> {
        let range = self.range(index, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
