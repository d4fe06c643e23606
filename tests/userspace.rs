//! Syscall gateway end-to-end: a ring-3 task drives getpid, write, yield
//! and exit through the `syscall` instruction.
//!
//! The user program is a hand-assembled flat binary (the same one the
//! kernel binary ships as its demo). It writes one byte to the serial
//! console — visible as an `X` in the test output — and exits with code
//! 42, which the kernel-side test observes through the scheduler.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(mini_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use mini_os::{pit, sched};

entry_point!(main, config = &mini_os::BOOTLOADER_CONFIG);

/// getpid; write(1, "X", 1); yield; exit(42).
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

fn main(boot_info: &'static mut BootInfo) -> ! {
    mini_os::init(boot_info);

    sched::init();
    pit::set_tick_callback(sched::tick);
    pit::init(100).expect("timer init");

    test_main();
    mini_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    mini_os::test_panic_handler(info)
}

#[test_case]
fn test_user_task_runs_syscalls_and_exits() {
    let id = sched::spawn_user(USER_PROGRAM, 1).expect("user task");
    sched::set_enabled(true);

    let mut rounds = 0_u64;
    while sched::last_exit_code() != Some(42) {
        sched::yield_now();
        rounds += 1;
        assert!(
            rounds < 100_000,
            "The user task did not exit; the syscall gateway is stuck.",
        );
    }

    assert!(id > 0, "User task ids start at 1.");
    sched::set_enabled(false);
}
