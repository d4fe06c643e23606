//! Kernel-global file descriptor table.
//!
//! Fixed at 128 slots; descriptors are process-global in this baseline.
//! Each record carries the inode it refers to, a current offset and the
//! open flags. The user-facing `open`/`close`/`read` syscalls stay reserved;
//! this table serves kernel-level callers.

use spin::Mutex;
use x86_64::instructions::interrupts;

use super::{with_fs, FileType};
use crate::{KernelError, KernelResult};

/// Number of descriptor slots.
pub const MAX_OPEN_FILES: usize = 128;

/// Open for reading.
pub const O_READ: u32 = 0x01;
/// Open for writing.
pub const O_WRITE: u32 = 0x02;
/// Every write goes to the current end of file.
pub const O_APPEND: u32 = 0x04;
/// Create the file when the name does not exist.
pub const O_CREATE: u32 = 0x08;

/// Seek relative to the start of the file.
pub const SEEK_SET: u32 = 0;
/// Seek relative to the current offset.
pub const SEEK_CUR: u32 = 1;
/// Seek relative to the end of the file.
pub const SEEK_END: u32 = 2;

#[derive(Clone, Copy)]
struct Descriptor {
    inode: u32,
    offset: u64,
    flags: u32,
    in_use: bool,
}

const FREE_SLOT: Descriptor = Descriptor {
    inode: 0,
    offset: 0,
    flags: 0,
    in_use: false,
};

static FD_TABLE: Mutex<[Descriptor; MAX_OPEN_FILES]> = Mutex::new([FREE_SLOT; MAX_OPEN_FILES]);

/// Open `path` with `flags`, creating it first when `O_CREATE` is set.
/// Returns the descriptor index.
///
/// # Errors
/// [`KernelError::NotFound`] for a missing name without `O_CREATE`,
/// [`KernelError::InvalidArgument`] when the name is a directory,
/// [`KernelError::NoSpace`] when the table is full, plus filesystem errors.
pub fn open(path: &str, flags: u32) -> KernelResult<usize> {
    let (inode, size) = with_fs(|fs| {
        let inode = match fs.resolve_path(path) {
            Ok(inode) => inode,
            Err(KernelError::NotFound) if flags & O_CREATE != 0 => {
                fs.create(path, FileType::File)?;
                fs.resolve_path(path)?
            }
            Err(err) => return Err(err),
        };
        let record = fs.read_inode(inode)?;
        if record.file_type() != Some(FileType::File) {
            return Err(KernelError::InvalidArgument);
        }
        Ok((inode, u64::from(record.size)))
    })?;

    interrupts::without_interrupts(|| {
        let mut table = FD_TABLE.lock();
        let slot = table
            .iter()
            .position(|descriptor| !descriptor.in_use)
            .ok_or(KernelError::NoSpace)?;
        table[slot] = Descriptor {
            inode,
            offset: if flags & O_APPEND != 0 { size } else { 0 },
            flags,
            in_use: true,
        };
        Ok(slot)
    })
}

/// Close a descriptor.
///
/// # Errors
/// [`KernelError::BadDescriptor`] for an out-of-range or already-closed fd.
pub fn close(fd: usize) -> KernelResult<()> {
    interrupts::without_interrupts(|| {
        let mut table = FD_TABLE.lock();
        let descriptor = table.get_mut(fd).ok_or(KernelError::BadDescriptor)?;
        if !descriptor.in_use {
            return Err(KernelError::BadDescriptor);
        }
        *descriptor = FREE_SLOT;
        Ok(())
    })
}

fn checked_lookup(fd: usize, required_flag: u32) -> KernelResult<Descriptor> {
    interrupts::without_interrupts(|| {
        let table = FD_TABLE.lock();
        let descriptor = *table.get(fd).ok_or(KernelError::BadDescriptor)?;
        if !descriptor.in_use {
            return Err(KernelError::BadDescriptor);
        }
        if descriptor.flags & required_flag == 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(descriptor)
    })
}

fn advance(fd: usize, new_offset: u64) {
    interrupts::without_interrupts(|| {
        let mut table = FD_TABLE.lock();
        if let Some(descriptor) = table.get_mut(fd) {
            if descriptor.in_use {
                descriptor.offset = new_offset;
            }
        }
    });
}

/// Read from the descriptor's current offset, advancing it by the bytes
/// actually copied.
///
/// # Errors
/// [`KernelError::BadDescriptor`], [`KernelError::InvalidArgument`] when
/// the fd was not opened for reading, plus filesystem errors.
pub fn read(fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let descriptor = checked_lookup(fd, O_READ)?;
    let copied = with_fs(|fs| fs.read_file_at(descriptor.inode, descriptor.offset, buf))?;
    advance(fd, descriptor.offset + copied as u64);
    Ok(copied)
}

/// Write at the descriptor's current offset (or the end of file for
/// `O_APPEND`), advancing it by the bytes written.
///
/// # Errors
/// [`KernelError::BadDescriptor`], [`KernelError::InvalidArgument`] when
/// the fd was not opened for writing, plus filesystem errors.
pub fn write(fd: usize, buf: &[u8]) -> KernelResult<usize> {
    let descriptor = checked_lookup(fd, O_WRITE)?;

    let offset = if descriptor.flags & O_APPEND != 0 {
        with_fs(|fs| Ok(u64::from(fs.read_inode(descriptor.inode)?.size)))?
    } else {
        descriptor.offset
    };

    let written = with_fs(|fs| fs.write_file_at(descriptor.inode, offset, buf))?;
    advance(fd, offset + written as u64);
    Ok(written)
}

/// Reposition a descriptor. Returns the new absolute offset.
///
/// # Errors
/// [`KernelError::BadDescriptor`], [`KernelError::InvalidArgument`] for an
/// unknown whence or a seek before the start of the file.
pub fn seek(fd: usize, offset: i64, whence: u32) -> KernelResult<u64> {
    let descriptor = checked_lookup(fd, O_READ | O_WRITE)?;

    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => descriptor.offset,
        SEEK_END => with_fs(|fs| Ok(u64::from(fs.read_inode(descriptor.inode)?.size)))?,
        _ => return Err(KernelError::InvalidArgument),
    };

    let target = base
        .checked_add_signed(offset)
        .ok_or(KernelError::InvalidArgument)?;
    advance(fd, target);
    Ok(target)
}

/// Drop every open descriptor; called on unmount.
pub(crate) fn close_all() {
    interrupts::without_interrupts(|| {
        let mut table = FD_TABLE.lock();
        for descriptor in table.iter_mut() {
            *descriptor = FREE_SLOT;
        }
    });
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::fs::{self, RamDisk, SimpleFs};

    fn mount_fresh() {
        let _ = fs::unmount();
        let mut disk = RamDisk::new(128);
        SimpleFs::format(&mut disk, 128, 0).expect("format");
        fs::mount(Box::new(disk)).expect("mount");
    }

    #[test_case]
    fn test_open_missing_file_fails_without_create() {
        mount_fresh();
        assert_eq!(
            open("/absent", O_READ).err(),
            Some(KernelError::NotFound),
            "Opening a missing name without O_CREATE must fail.",
        );
        let _ = fs::unmount();
    }

    #[test_case]
    fn test_descriptor_read_write_advances_offset() {
        mount_fresh();

        let fd = open("/log", O_READ | O_WRITE | O_CREATE).expect("open");
        assert_eq!(write(fd, b"hello ").expect("first write"), 6, "Six bytes.");
        assert_eq!(write(fd, b"world").expect("second write"), 5, "Five bytes.");

        seek(fd, 0, SEEK_SET).expect("rewind");
        let mut out = [0_u8; 11];
        assert_eq!(read(fd, &mut out).expect("read"), 11, "Full read back.");
        assert_eq!(&out, b"hello world", "Sequential writes must concatenate.");

        close(fd).expect("close");
        let _ = fs::unmount();
    }

    #[test_case]
    fn test_closed_descriptor_is_rejected() {
        mount_fresh();

        let fd = open("/once", O_READ | O_WRITE | O_CREATE).expect("open");
        close(fd).expect("close");
        assert_eq!(
            close(fd).err(),
            Some(KernelError::BadDescriptor),
            "Closing twice must fail with BadDescriptor.",
        );
        let mut out = [0_u8; 4];
        assert_eq!(
            read(fd, &mut out).err(),
            Some(KernelError::BadDescriptor),
            "Reading a closed fd must fail with BadDescriptor.",
        );
        let _ = fs::unmount();
    }

    #[test_case]
    fn test_seek_end_lands_at_file_size() {
        mount_fresh();

        let fd = open("/sized", O_READ | O_WRITE | O_CREATE).expect("open");
        write(fd, b"0123456789").expect("write");
        assert_eq!(
            seek(fd, 0, SEEK_END).expect("seek end"),
            10,
            "SEEK_END with no offset must land at the file size.",
        );

        close(fd).expect("close");
        let _ = fs::unmount();
    }
}
