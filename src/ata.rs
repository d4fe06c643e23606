//! ATA disk driver using programmed I/O.
//!
//! Up to four drives over the two legacy buses (primary/secondary x
//! master/slave). Transfers poll the status register with a fixed iteration
//! budget as a crude timeout and move 256 16-bit words per sector through
//! the data port; the CPU is not released while a transfer is in flight.

use alloc::string::String;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

use crate::{serial_println, KernelError, KernelResult};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;

/// Number of addressable drives.
pub const MAX_DRIVES: u8 = 4;

const PRIMARY_IO: u16 = 0x1F0;
const PRIMARY_CTRL: u16 = 0x3F6;
const SECONDARY_IO: u16 = 0x170;
const SECONDARY_CTRL: u16 = 0x376;

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_BSY: u8 = 0x80;

const CMD_READ_PIO: u8 = 0x20;
const CMD_WRITE_PIO: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;
const CMD_IDENTIFY: u8 = 0xEC;

const SELECT_MASTER: u8 = 0xA0;
const SELECT_SLAVE: u8 = 0xB0;

/// Iteration budget for each status poll.
const POLL_BUDGET: u32 = 1_000_000;

/// Highest LBA reachable with 28-bit addressing.
const LBA28_LIMIT: u64 = 0x0FFF_FFFF;

/// Identification data of a detected drive.
#[derive(Debug, Clone)]
pub struct DriveInfo {
    /// Model string from the identify block, trailing spaces trimmed.
    pub model: String,
    /// Serial number from the identify block, trailing spaces trimmed.
    pub serial: String,
    /// Total addressable sectors.
    pub sectors: u64,
    /// Whether the drive advertises 48-bit LBA.
    pub lba48: bool,
}

struct Drive {
    io_base: u16,
    ctrl_base: u16,
    slave: bool,
    info: Option<DriveInfo>,
}

impl Drive {
    const fn new(io_base: u16, ctrl_base: u16, slave: bool) -> Self {
        Self {
            io_base,
            ctrl_base,
            slave,
            info: None,
        }
    }
}

struct Controller {
    drives: [Drive; MAX_DRIVES as usize],
}

lazy_static! {
    static ref ATA: Mutex<Controller> = Mutex::new(Controller {
        drives: [
            Drive::new(PRIMARY_IO, PRIMARY_CTRL, false),
            Drive::new(PRIMARY_IO, PRIMARY_CTRL, true),
            Drive::new(SECONDARY_IO, SECONDARY_CTRL, false),
            Drive::new(SECONDARY_IO, SECONDARY_CTRL, true),
        ],
    });
}

fn read_status(io_base: u16) -> u8 {
    // SAFETY: reading the ATA status register has no side effect beyond
    // clearing the interrupt condition, which this driver does not use.
    unsafe { Port::<u8>::new(io_base + 7).read() }
}

fn write_register(port: u16, value: u8) {
    // SAFETY: all callers target well-known ATA task-file registers.
    unsafe { Port::<u8>::new(port).write(value) }
}

/// 400ns settle delay: four reads of the alternate status register.
fn io_wait(ctrl_base: u16) {
    for _ in 0..4 {
        // SAFETY: the alternate status register is side-effect free.
        let _: u8 = unsafe { Port::<u8>::new(ctrl_base).read() };
    }
}

fn wait_not_busy(io_base: u16) -> KernelResult<()> {
    for _ in 0..POLL_BUDGET {
        if read_status(io_base) & STATUS_BSY == 0 {
            return Ok(());
        }
    }
    Err(KernelError::IoError)
}

fn wait_data_request(io_base: u16) -> KernelResult<()> {
    for _ in 0..POLL_BUDGET {
        let status = read_status(io_base);
        if status & STATUS_ERR != 0 {
            return Err(KernelError::IoError);
        }
        if status & STATUS_DRQ != 0 {
            return Ok(());
        }
    }
    Err(KernelError::IoError)
}

/// Pull a swapped-byte ASCII string out of the identify block.
fn identify_string(words: &[u16], range: core::ops::Range<usize>) -> String {
    let mut bytes = Vec::with_capacity(range.len() * 2);
    for &word in &words[range] {
        bytes.push((word >> 8) as u8);
        bytes.push((word & 0xFF) as u8);
    }
    let text: String = String::from_utf8_lossy(&bytes).into_owned();
    String::from(text.trim_end_matches([' ', '\0']))
}

/// Issue IDENTIFY to one drive and decode the 256-word response.
fn identify_drive(drive: &mut Drive) -> Option<DriveInfo> {
    let io = drive.io_base;

    let select = if drive.slave { SELECT_SLAVE } else { SELECT_MASTER };
    write_register(io + 6, select);
    io_wait(drive.ctrl_base);

    write_register(io + 7, CMD_IDENTIFY);
    io_wait(drive.ctrl_base);

    // A floating bus reads as zero: no drive at all.
    if read_status(io) == 0 {
        return None;
    }

    wait_not_busy(io).ok()?;

    // ATAPI and friends put a signature in the LBA registers; only plain
    // ATA is supported.
    // SAFETY: reading the LBA-mid/high task-file registers.
    let (lba_mid, lba_high): (u8, u8) = unsafe {
        (
            Port::<u8>::new(io + 4).read(),
            Port::<u8>::new(io + 5).read(),
        )
    };
    if lba_mid != 0 || lba_high != 0 {
        return None;
    }

    wait_data_request(io).ok()?;

    let mut words = [0_u16; 256];
    for word in &mut words {
        // SAFETY: DRQ is set; the data port yields the identify block.
        *word = unsafe { Port::<u16>::new(io).read() };
    }

    let lba48 = words[83] & (1 << 10) != 0;
    let sectors = if lba48 {
        (u64::from(words[103]) << 48)
            | (u64::from(words[102]) << 32)
            | (u64::from(words[101]) << 16)
            | u64::from(words[100])
    } else {
        (u64::from(words[61]) << 16) | u64::from(words[60])
    };

    Some(DriveInfo {
        model: identify_string(&words, 27..47),
        serial: identify_string(&words, 10..20),
        sectors,
        lba48,
    })
}

/// Probe all four drive slots and remember what answers.
pub fn init() {
    serial_println!("[ATA] Probing drives");
    let mut controller = ATA.lock();

    let mut found = 0;
    for (index, drive) in controller.drives.iter_mut().enumerate() {
        drive.info = identify_drive(drive);
        if let Some(info) = &drive.info {
            found += 1;
            serial_println!(
                "[ATA] Drive {}: {} ({} MiB, LBA48: {})",
                index,
                info.model,
                info.sectors * SECTOR_SIZE as u64 / (1024 * 1024),
                if info.lba48 { "yes" } else { "no" }
            );
        }
    }

    if found == 0 {
        serial_println!("[ATA] No drives detected");
    }
}

/// Identification data for `drive`, when present.
///
/// # Errors
/// [`KernelError::InvalidArgument`] for an out-of-range drive number,
/// [`KernelError::NotFound`] when nothing answered the probe there.
pub fn drive_info(drive: u8) -> KernelResult<DriveInfo> {
    if drive >= MAX_DRIVES {
        return Err(KernelError::InvalidArgument);
    }
    ATA.lock().drives[drive as usize]
        .info
        .clone()
        .ok_or(KernelError::NotFound)
}

/// Validate a transfer request and return the io/ctrl ports plus select
/// byte base for the drive.
fn transfer_checks(
    controller: &Controller,
    drive: u8,
    lba: u64,
    count: u32,
    buf_len: usize,
) -> KernelResult<(u16, u16, bool)> {
    if drive >= MAX_DRIVES || count == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let slot = &controller.drives[drive as usize];
    let info = slot.info.as_ref().ok_or(KernelError::InvalidArgument)?;

    if buf_len != count as usize * SECTOR_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let end = lba + u64::from(count);
    if end > info.sectors || end > LBA28_LIMIT {
        return Err(KernelError::InvalidArgument);
    }
    Ok((slot.io_base, slot.ctrl_base, slot.slave))
}

/// Program the task-file registers for a 28-bit LBA transfer.
fn program_transfer(io: u16, ctrl: u16, slave: bool, lba: u64, count: u32, command: u8) {
    let select = 0xE0 | (u8::from(slave) << 4) | ((lba >> 24) & 0x0F) as u8;
    write_register(io + 6, select);
    io_wait(ctrl);

    write_register(io + 2, count as u8);
    write_register(io + 3, (lba & 0xFF) as u8);
    write_register(io + 4, ((lba >> 8) & 0xFF) as u8);
    write_register(io + 5, ((lba >> 16) & 0xFF) as u8);
    write_register(io + 7, command);
    io_wait(ctrl);
}

/// Read `count` sectors starting at `lba` into `buf`.
///
/// `buf` must be exactly `count * 512` bytes. The transfer spins; long
/// reads block the whole system by design of the single-CPU baseline.
///
/// # Errors
/// [`KernelError::InvalidArgument`] on a bad drive, count, buffer size or
/// out-of-range LBA; [`KernelError::IoError`] on a status error or timeout.
pub fn read_sectors(drive: u8, lba: u64, count: u32, buf: &mut [u8]) -> KernelResult<()> {
    interrupts::without_interrupts(|| {
        let controller = ATA.lock();
        let (io, ctrl, slave) = transfer_checks(&controller, drive, lba, count, buf.len())?;

        wait_not_busy(io)?;
        program_transfer(io, ctrl, slave, lba, count, CMD_READ_PIO);

        for sector in 0..count as usize {
            wait_data_request(io)?;
            for word_index in 0..SECTOR_SIZE / 2 {
                // SAFETY: DRQ is set; the data port streams the sector.
                let word: u16 = unsafe { Port::<u16>::new(io).read() };
                let offset = sector * SECTOR_SIZE + word_index * 2;
                buf[offset] = (word & 0xFF) as u8;
                buf[offset + 1] = (word >> 8) as u8;
            }
            io_wait(ctrl);
        }
        Ok(())
    })
}

/// Write `count` sectors starting at `lba` from `buf`, then flush the
/// drive's write cache.
///
/// # Errors
/// Same conditions as [`read_sectors`].
pub fn write_sectors(drive: u8, lba: u64, count: u32, buf: &[u8]) -> KernelResult<()> {
    interrupts::without_interrupts(|| {
        let controller = ATA.lock();
        let (io, ctrl, slave) = transfer_checks(&controller, drive, lba, count, buf.len())?;

        wait_not_busy(io)?;
        program_transfer(io, ctrl, slave, lba, count, CMD_WRITE_PIO);

        for sector in 0..count as usize {
            wait_data_request(io)?;
            for word_index in 0..SECTOR_SIZE / 2 {
                let offset = sector * SECTOR_SIZE + word_index * 2;
                let word = u16::from(buf[offset]) | (u16::from(buf[offset + 1]) << 8);
                // SAFETY: DRQ is set; the data port accepts the sector.
                unsafe { Port::<u16>::new(io).write(word) };
            }
            io_wait(ctrl);
        }

        write_register(io + 7, CMD_CACHE_FLUSH);
        wait_not_busy(io)
    })
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test_case]
    fn test_out_of_range_drive_is_rejected() {
        assert_eq!(
            drive_info(MAX_DRIVES).unwrap_err(),
            KernelError::InvalidArgument,
            "Drive numbers past the bus layout must be rejected.",
        );
    }

    #[test_case]
    fn test_read_from_absent_drive_fails() {
        // The library test image runs without attached disks, so every
        // slot is empty and transfers must fail up front.
        let mut buf = vec![0_u8; SECTOR_SIZE];
        let result = read_sectors(3, 0, 1, &mut buf);
        assert!(
            result.is_err(),
            "Reading an absent drive must fail instead of spinning forever.",
        );
    }

    #[test_case]
    fn test_mismatched_buffer_is_rejected() {
        let mut buf = vec![0_u8; SECTOR_SIZE - 1];
        assert_eq!(
            read_sectors(0, 0, 1, &mut buf).unwrap_err(),
            KernelError::InvalidArgument,
            "A buffer that does not match the sector count must be rejected.",
        );
    }
}
