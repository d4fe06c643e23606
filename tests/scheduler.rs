//! Scheduler fairness: three cooperating tasks sharing a counter.
//!
//! Each worker increments the shared counter five times, yielding after
//! every increment. Round-robin rotation must give every worker its five
//! turns: the total lands at 15 and each per-task count at 5.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(mini_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};

use bootloader_api::{entry_point, BootInfo};
use mini_os::{pit, sched};

entry_point!(main, config = &mini_os::BOOTLOADER_CONFIG);

static SHARED_COUNTER: AtomicU64 = AtomicU64::new(0);
static LOCAL_COUNTS: [AtomicU64; 3] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

const INCREMENTS_PER_TASK: u64 = 5;

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

fn worker(slot: usize) {
    for _ in 0..INCREMENTS_PER_TASK {
        SHARED_COUNTER.fetch_add(1, Ordering::Relaxed);
        LOCAL_COUNTS[slot].fetch_add(1, Ordering::Relaxed);
        sched::yield_now();
    }
}

extern "C" fn worker_one() {
    worker(0);
}

extern "C" fn worker_two() {
    worker(1);
}

extern "C" fn worker_three() {
    worker(2);
}

#[test_case]
fn test_three_tasks_share_the_cpu_fairly() {
    let baseline_tasks = sched::task_count();

    sched::spawn_kernel(worker_one, 1);
    sched::spawn_kernel(worker_two, 1);
    sched::spawn_kernel(worker_three, 1);
    sched::set_enabled(true);

    // Drive the rotation from the test task; the timer preempts whoever
    // hogs the CPU (including the idle task's halt loop).
    let mut rounds = 0_u64;
    while SHARED_COUNTER.load(Ordering::Relaxed) < 3 * INCREMENTS_PER_TASK {
        sched::yield_now();
        rounds += 1;
        assert!(rounds < 100_000, "Workers did not finish; rotation is stuck.");
    }

    assert_eq!(
        SHARED_COUNTER.load(Ordering::Relaxed),
        3 * INCREMENTS_PER_TASK,
        "The shared counter must reach exactly 15.",
    );
    for (slot, local) in LOCAL_COUNTS.iter().enumerate() {
        assert_eq!(
            local.load(Ordering::Relaxed),
            INCREMENTS_PER_TASK,
            "Each worker must get exactly its five turns (slot {slot}).",
        );
    }

    // Workers exited; once the reaper has run, only the baseline tasks
    // (boot flow and idle) remain.
    for _ in 0..16 {
        sched::yield_now();
    }
    assert_eq!(
        sched::task_count(),
        baseline_tasks,
        "Exited workers must leave the live-task accounting unchanged.",
    );

    sched::set_enabled(false);
}
