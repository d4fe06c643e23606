//! A small self-contained x86_64 kernel.
//!
//! The kernel owns physical memory through a bitmap frame allocator, manages
//! per-task 4-level page tables through a higher-half direct map, schedules
//! tasks round-robin from the timer interrupt, exposes a `syscall`/`sysret`
//! gateway to ring 3 and stores files on an ATA disk with a simple
//! superblock/bitmap/inode-table filesystem.
//!
//! Refer to the README.md file for more information about the features
//! supported.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader_api::config::Mapping;
use bootloader_api::{BootInfo, BootloaderConfig};

pub mod ata;
pub mod error;
pub mod fs;
pub mod gdt;
pub mod interrupts;
pub mod keyboard;
pub mod memory;
pub mod pit;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod usermode;

pub use error::{KernelError, KernelResult};

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Boot configuration shared by the kernel binary and every test binary.
///
/// The physical-memory mapping is what gives the kernel its higher-half
/// direct map: every physical address `p` is readable at
/// `physical_memory_offset + p`.
pub static BOOTLOADER_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config.kernel_stack_size = 80 * 1024;
    config
};

/// Bring up the kernel core: GDT, IDT, physical and virtual memory, the
/// kernel heap, the syscall gateway and the interrupt controller.
///
/// The scheduler and the timer are started separately so that single-threaded
/// callers (the test binaries) can stay in control of the CPU.
pub fn init(boot_info: &'static mut BootInfo) {
    gdt::init();
    interrupts::init_idt();
    memory::init(boot_info);
    syscall::init();
    keyboard::init();

    // SAFETY:
    // The PICs are remapped to vectors 32..48 which do not collide with CPU
    // exceptions; only the timer and keyboard lines are unmasked.
    unsafe {
        let mut pics = interrupts::PICS.lock();
        pics.initialize();
        pics.write_masks(0b1111_1100, 0b1111_1111);
    }
    x86_64::instructions::interrupts::enable();
}

/// Halt the CPU until the next interrupt, forever.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    // SAFETY:
    // Create a `Port` to write exit_code for qemu.
    unsafe {
        let mut port = Port::new(QEMU_EXIT_PORT);
        port.write(exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);
    hlt_loop();
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}

#[cfg(test)]
bootloader_api::entry_point!(test_kernel_main, config = &BOOTLOADER_CONFIG);

/// Test entry point for cargo test on the library itself.
#[cfg(test)]
fn test_kernel_main(boot_info: &'static mut BootInfo) -> ! {
    init(boot_info);
    test_main();
    hlt_loop();
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info);
}
