//! End-to-end address-space tests on real frames: mapping, translation,
//! isolation between spaces and frame-allocator round trips.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(mini_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};
use mini_os::memory::{self, AddressSpace};
use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

entry_point!(main, config = &mini_os::BOOTLOADER_CONFIG);

fn main(boot_info: &'static mut BootInfo) -> ! {
    mini_os::init(boot_info);
    test_main();
    mini_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    mini_os::test_panic_handler(info)
}

fn user_rw() -> PageTableFlags {
    PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

/// Frame round-trip: distinct live frames, first-fit reuse after free.
#[test_case]
fn test_frame_alloc_free_round_trip() {
    let p1 = memory::allocate_frame().expect("first frame");
    let p2 = memory::allocate_frame().expect("second frame");
    assert_ne!(p1, p2, "Live frames must be distinct.");

    memory::deallocate_frame(p1);
    let p1_again = memory::allocate_frame().expect("reallocated frame");
    assert_eq!(
        p1, p1_again,
        "First-fit must hand the lowest freed frame out again.",
    );

    memory::deallocate_frame(p1_again);
    memory::deallocate_frame(p2);
}

/// Mapping at 4 MiB in two spaces keeps the spaces fully isolated.
#[test_case]
fn test_lower_half_isolation_between_spaces() {
    let mut s1 = AddressSpace::new().expect("first space");
    let mut s2 = AddressSpace::new().expect("second space");
    let virt = VirtAddr::new(0x40_0000);

    s1.map(virt, PhysAddr::new(0xAAAA_000), user_rw()).expect("map s1");
    s2.map(virt, PhysAddr::new(0xBBBB_000), user_rw()).expect("map s2");

    assert_eq!(
        s1.translate(virt),
        Some(PhysAddr::new(0xAAAA_000)),
        "Space 1 must see its own frame.",
    );
    assert_eq!(
        s2.translate(virt),
        Some(PhysAddr::new(0xBBBB_000)),
        "Space 2 must see its own frame.",
    );
}

/// A mapped-then-unmapped page no longer translates, and destroying a space
/// returns its page-table frames to the allocator.
#[test_case]
fn test_destroy_returns_table_frames() {
    let before = memory::free_frames();
    {
        let mut space = AddressSpace::new().expect("space");
        space
            .map(VirtAddr::new(0x40_0000), PhysAddr::new(0x1234_000), user_rw())
            .expect("map");
        space.unmap(VirtAddr::new(0x40_0000)).expect("unmap");
        assert_eq!(
            space.translate(VirtAddr::new(0x40_0000)),
            None,
            "No stale translation after unmap.",
        );
    }
    assert_eq!(
        memory::free_frames(),
        before,
        "Destroying the space must free the root and all walk tables.",
    );
}

/// The kernel half resolves identically in a fresh space and in the kernel
/// space; lower-half mappings in a space never leak into the kernel space.
#[test_case]
fn test_kernel_half_shared_lower_half_private() {
    let mut space = AddressSpace::new().expect("space");
    let probe: u64 = 0x5a5a_5a5a;
    let kernel_va = VirtAddr::from_ptr(&raw const probe);

    assert_eq!(
        space.translate(kernel_va),
        AddressSpace::kernel().translate(kernel_va),
        "Kernel-half addresses must resolve identically in every space.",
    );

    space
        .map(VirtAddr::new(0x40_0000), PhysAddr::new(0xCAFE_000), user_rw())
        .expect("map");
    assert_eq!(
        AddressSpace::kernel().translate(VirtAddr::new(0x40_0000)),
        None,
        "A space's user mapping must not appear in the kernel space.",
    );
}
