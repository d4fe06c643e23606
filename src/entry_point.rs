//! Kernel entry point: bring the machine up, mount the disk, start tasks.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use pc_keyboard::DecodedKey;

use mini_os::{ata, fs, keyboard, pit, print, sched, serial_println};

entry_point!(kernel_main, config = &mini_os::BOOTLOADER_CONFIG);

/// Timer frequency the scheduler runs at.
const TICK_HZ: u32 = 100;

/// Demo user program, hand-assembled flat binary linked at the user code
/// base. It exercises the whole syscall gateway from ring 3:
///
/// ```text
/// mov eax, 11        ; getpid
/// syscall
/// mov r12, rax       ; keep the pid across the next calls
/// mov eax, 1         ; write
/// mov edi, 1         ;   fd = stdout
/// lea rsi, [rip+msg]
/// mov edx, 1         ;   one byte
/// syscall
/// mov eax, 10        ; yield
/// syscall
/// mov eax, 4         ; exit
/// mov edi, 42
/// syscall
/// msg: db 'X'
/// ```
const USER_PROGRAM: &[u8] = &[
    0xB8, 0x0B, 0x00, 0x00, 0x00, // mov eax, 11
    0x0F, 0x05, // syscall
    0x49, 0x89, 0xC4, // mov r12, rax
    0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
    0xBF, 0x01, 0x00, 0x00, 0x00, // mov edi, 1
    0x48, 0x8D, 0x35, 0x1A, 0x00, 0x00, 0x00, // lea rsi, [rip+0x1a]
    0xBA, 0x01, 0x00, 0x00, 0x00, // mov edx, 1
    0x0F, 0x05, // syscall
    0xB8, 0x0A, 0x00, 0x00, 0x00, // mov eax, 10
    0x0F, 0x05, // syscall
    0xB8, 0x04, 0x00, 0x00, 0x00, // mov eax, 4
    0xBF, 0x2A, 0x00, 0x00, 0x00, // mov edi, 42
    0x0F, 0x05, // syscall
    0x58, // msg: 'X'
];

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    serial_println!("mini_os {} booting", env!("CARGO_PKG_VERSION"));

    if let Some(framebuffer) = boot_info.framebuffer.as_ref() {
        let info = framebuffer.info();
        serial_println!(
            "[BOOT] Framebuffer {}x{}, {} bytes per pixel",
            info.width,
            info.height,
            info.bytes_per_pixel
        );
    }

    mini_os::init(boot_info);

    sched::init();
    pit::set_tick_callback(sched::tick);
    if let Err(err) = pit::init(TICK_HZ) {
        serial_println!("[KERNEL] Timer init failed: {}", err);
    }

    ata::init();
    mount_root_filesystem();

    sched::spawn_kernel(ticker_task, 1);
    match sched::spawn_user(USER_PROGRAM, 1) {
        Ok(id) => serial_println!("[KERNEL] User task {} ready", id),
        Err(err) => serial_println!("[KERNEL] User task creation failed: {}", err),
    }

    sched::set_enabled(true);
    serial_println!("[KERNEL] Boot complete");

    // The boot flow stays alive as the first task: echo keyboard input.
    loop {
        while let Some(key) = keyboard::read_key() {
            if let DecodedKey::Unicode(character) = key {
                print!("{}", character);
            }
        }
        x86_64::instructions::hlt();
    }
}

/// Mount drive 0, formatting it on first boot.
fn mount_root_filesystem() {
    let Ok(device) = fs::AtaBlockDevice::new(0) else {
        serial_println!("[KERNEL] No disk on drive 0; filesystem offline");
        return;
    };

    if fs::mount(Box::new(device)).is_err() {
        serial_println!("[KERNEL] Drive 0 has no filesystem; formatting");
        let Ok(mut fresh) = fs::AtaBlockDevice::new(0) else {
            return;
        };
        if let Err(err) = fs::SimpleFs::format(&mut fresh, 0, 0) {
            serial_println!("[KERNEL] Format failed: {}", err);
            return;
        }
        if let Err(err) = fs::mount(Box::new(fresh)) {
            serial_println!("[KERNEL] Mount failed: {}", err);
            return;
        }
    }

    match fs::list() {
        Ok(listing) => {
            serial_println!("[KERNEL] Root directory ({} entries):", listing.len());
            for (name, file_type, size) in listing {
                serial_println!("[KERNEL]   {:?} {:>8} bytes  {}", file_type, size, name);
            }
        }
        Err(err) => serial_println!("[KERNEL] List failed: {}", err),
    }
}

/// Small kernel task proving preemption and the tick-based sleep.
extern "C" fn ticker_task() {
    for count in 1..=3 {
        serial_println!(
            "[TASK] heartbeat {} at tick {}",
            count,
            pit::ticks()
        );
        pit::sleep(u64::from(TICK_HZ) / 4);
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("[KERNEL PANIC] {}", info);
    mini_os::hlt_loop();
}
