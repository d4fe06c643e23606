//! Filesystem layer: block devices, the on-disk SimpleFS and the global
//! mount plus file-descriptor table.
//!
//! Exactly one filesystem can be mounted at a time. All mutations of the
//! mounted state happen with interrupts masked, like the other kernel
//! singletons.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::{KernelError, KernelResult};

pub mod block;
pub mod fd;
pub mod simplefs;

pub use block::{AtaBlockDevice, BlockDevice, RamDisk};
pub use simplefs::{FileType, SimpleFs};

/// Filesystem block size in bytes (eight disk sectors).
pub const BLOCK_SIZE: usize = 4096;

static MOUNTED: Mutex<Option<SimpleFs>> = Mutex::new(None);

/// Mount a formatted device as the kernel filesystem.
///
/// # Errors
/// [`KernelError::Exists`] when a filesystem is already mounted, plus any
/// validation error from the superblock check.
pub fn mount(device: Box<dyn BlockDevice>) -> KernelResult<()> {
    let fs = SimpleFs::mount(device)?;
    interrupts::without_interrupts(|| {
        let mut mounted = MOUNTED.lock();
        if mounted.is_some() {
            return Err(KernelError::Exists);
        }
        *mounted = Some(fs);
        Ok(())
    })
}

/// Unmount the kernel filesystem, returning the backing device.
///
/// All open descriptors are closed. There is no flush phase: bitmaps,
/// superblock and inodes are persisted eagerly on every mutation.
///
/// # Errors
/// [`KernelError::NotMounted`] when nothing is mounted.
pub fn unmount() -> KernelResult<Box<dyn BlockDevice>> {
    fd::close_all();
    interrupts::without_interrupts(|| {
        MOUNTED
            .lock()
            .take()
            .map(SimpleFs::unmount)
            .ok_or(KernelError::NotMounted)
    })
}

/// Whether a filesystem is currently mounted.
pub fn is_mounted() -> bool {
    interrupts::without_interrupts(|| MOUNTED.lock().is_some())
}

/// Run `f` against the mounted filesystem with interrupts masked.
///
/// # Errors
/// [`KernelError::NotMounted`] when nothing is mounted, otherwise whatever
/// `f` returns.
pub fn with_fs<R>(f: impl FnOnce(&mut SimpleFs) -> KernelResult<R>) -> KernelResult<R> {
    interrupts::without_interrupts(|| {
        let mut mounted = MOUNTED.lock();
        let fs = mounted.as_mut().ok_or(KernelError::NotMounted)?;
        f(fs)
    })
}

/// Create a file or directory at a single-component path under root.
///
/// # Errors
/// See [`SimpleFs::create`].
pub fn create(path: &str, node_type: FileType) -> KernelResult<()> {
    with_fs(|fs| fs.create(path, node_type))
}

/// Read from a file. Returns the number of bytes copied (0 at EOF).
///
/// # Errors
/// See [`SimpleFs::read`].
pub fn read(path: &str, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
    with_fs(|fs| fs.read(path, offset, buf))
}

/// Write to a file, growing it if needed. Returns the bytes written.
///
/// # Errors
/// See [`SimpleFs::write`].
pub fn write(path: &str, offset: u64, buf: &[u8]) -> KernelResult<usize> {
    with_fs(|fs| fs.write(path, offset, buf))
}

/// Names, types and sizes of everything in the root directory.
///
/// # Errors
/// See [`SimpleFs::list`].
pub fn list() -> KernelResult<Vec<(String, FileType, u32)>> {
    with_fs(SimpleFs::list)
}
