//! Filesystem durability end-to-end: format, mount, write, remount, read.
//!
//! Runs against the kernel-global mount with a RAM-backed block device so
//! the suite does not depend on an attached disk image; the code path is
//! identical to the ATA-backed one.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(mini_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;
use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use mini_os::fs::{self, FileType, RamDisk, SimpleFs};
use mini_os::KernelError;

entry_point!(main, config = &mini_os::BOOTLOADER_CONFIG);

const DISK_BLOCKS: u32 = 256;

fn main(boot_info: &'static mut BootInfo) -> ! {
    mini_os::init(boot_info);
    test_main();
    mini_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    mini_os::test_panic_handler(info)
}

fn mount_formatted_disk() {
    let _ = fs::unmount();
    let mut disk = RamDisk::new(u64::from(DISK_BLOCKS));
    SimpleFs::format(&mut disk, DISK_BLOCKS, 0).expect("format");
    fs::mount(Box::new(disk)).expect("mount");
}

#[test_case]
fn test_double_mount_is_rejected() {
    mount_formatted_disk();

    let mut second = RamDisk::new(64);
    SimpleFs::format(&mut second, 64, 1).expect("format second");
    assert_eq!(
        fs::mount(Box::new(second)).err(),
        Some(KernelError::Exists),
        "Mounting over a mounted filesystem must fail.",
    );

    let _ = fs::unmount();
}

#[test_case]
fn test_write_survives_unmount_and_remount() {
    mount_formatted_disk();

    fs::create("/greet", FileType::File).expect("create");
    let message = b"Hello from SimpleFS!\n";
    assert_eq!(
        fs::write("/greet", 0, message).expect("write"),
        message.len(),
        "The whole message must be written.",
    );

    // Unmount drops every cached structure; remounting the same device
    // must reload everything from disk.
    let device = fs::unmount().expect("unmount");
    fs::mount(device).expect("remount");

    let mut out = [0_u8; 32];
    let read = fs::read("/greet", 0, &mut out[..message.len()]).expect("read");
    assert_eq!(read, message.len(), "Length must survive the mount cycle.");
    assert_eq!(&out[..read], message, "Contents must survive the mount cycle.");

    let _ = fs::unmount();
}

#[test_case]
fn test_large_write_spans_two_blocks_and_round_trips() {
    mount_formatted_disk();

    fs::create("/big", FileType::File).expect("create");
    let mut data = vec![0_u8; 8192];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    assert_eq!(fs::write("/big", 0, &data).expect("write"), 8192, "Full write.");

    let inode = fs::with_fs(|fs| fs.stat("/big")).expect("stat");
    assert_eq!(inode.blocks, 2, "8 KiB must occupy exactly two blocks.");

    let mut out = vec![0_u8; 8192];
    assert_eq!(fs::read("/big", 0, &mut out).expect("read"), 8192, "Full read.");
    assert_eq!(out, data, "Byte-for-byte round trip.");

    let _ = fs::unmount();
}

#[test_case]
fn test_operations_without_mount_fail() {
    let _ = fs::unmount();

    let mut out = [0_u8; 4];
    assert_eq!(
        fs::read("/anything", 0, &mut out).err(),
        Some(KernelError::NotMounted),
        "Reads without a mounted filesystem must fail with NotMounted.",
    );
    assert_eq!(
        fs::create("/anything", FileType::File).err(),
        Some(KernelError::NotMounted),
        "Creates without a mounted filesystem must fail with NotMounted.",
    );
}
