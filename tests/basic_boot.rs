//! Simple boot test for the kernel.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(mini_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use mini_os::serial_println;

entry_point!(test_kernel_main, config = &mini_os::BOOTLOADER_CONFIG);

fn test_kernel_main(boot_info: &'static mut BootInfo) -> ! {
    mini_os::init(boot_info);
    test_main();
    mini_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    mini_os::test_panic_handler(info)
}

/// Test that the serial console is alive after a full core bring-up.
#[test_case]
fn test_serial_println_after_init() {
    serial_println!("test_serial_println output");
}

/// The boot memory map must leave the allocator with frames to hand out.
#[test_case]
fn test_frames_available_after_boot() {
    assert!(
        mini_os::memory::free_frames() > 0,
        "Boot must leave free physical frames.",
    );
}
