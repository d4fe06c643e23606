//! Memory management: physical frames, the kernel heap and address spaces.
//!
//! The bootloader hands over a memory map and maps all physical memory at a
//! fixed offset (the higher-half direct map). Everything in this module goes
//! through that mapping; page tables are never mapped into their own virtual
//! range.

use bootloader_api::BootInfo;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::structures::paging::PhysFrame;
use x86_64::{PhysAddr, VirtAddr};

use crate::{serial_println, KernelResult};

pub mod address_space;
pub mod frame;
pub mod heap;

pub use address_space::AddressSpace;
pub use frame::BitmapFrameAllocator;

/// Size of a physical frame and of a virtual page.
pub const PAGE_SIZE: usize = 4096;

/// Offset of the higher-half direct map, latched at boot.
static PHYSICAL_MEMORY_OFFSET: AtomicU64 = AtomicU64::new(0);

/// The global physical frame allocator.
static FRAME_ALLOCATOR: OnceCell<Mutex<BitmapFrameAllocator>> = OnceCell::uninit();

/// Initialize all memory management from the boot information.
///
/// Order matters: the frame allocator feeds the heap, and the kernel address
/// space is adopted from the page tables the bootloader set up.
///
/// # Panics
/// Panics if the bootloader did not provide a physical-memory mapping; the
/// kernel cannot reach its page tables without one.
pub fn init(boot_info: &'static mut BootInfo) {
    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .unwrap_or_else(|| panic!("bootloader did not map physical memory"));
    PHYSICAL_MEMORY_OFFSET.store(phys_mem_offset, Ordering::Relaxed);

    serial_println!("[MEM] Higher-half direct map at {:#x}", phys_mem_offset);

    // SAFETY:
    // The memory map comes straight from the bootloader and the direct map
    // covers every usable frame in it.
    let allocator = unsafe { BitmapFrameAllocator::new(&boot_info.memory_regions) };
    serial_println!(
        "[MEM] {} frames total, {} free",
        allocator.total_frames(),
        allocator.free_frames()
    );

    let _ = FRAME_ALLOCATOR.try_init_once(|| Mutex::new(allocator));

    if let Err(err) = heap::init() {
        panic!("kernel heap initialization failed: {err}");
    }

    address_space::kernel_init();
}

/// Returns the virtual alias of a physical address through the direct map.
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new(PHYSICAL_MEMORY_OFFSET.load(Ordering::Relaxed) + phys.as_u64())
}

/// Run `f` with exclusive access to the frame allocator.
///
/// Interrupts are masked for the duration; the bitmap is one of the
/// singletons that must never be mutated concurrently with an interrupt
/// handler performing a context switch.
///
/// # Panics
/// Panics if called before [`init`].
pub fn with_frame_allocator<R>(f: impl FnOnce(&mut BitmapFrameAllocator) -> R) -> R {
    interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "Using frames before memory::init is a kernel bug."
        )]
        let mut allocator = FRAME_ALLOCATOR
            .try_get()
            .expect("frame allocator not initialized")
            .lock();
        f(&mut allocator)
    })
}

/// Allocate one physical frame.
pub fn allocate_frame() -> KernelResult<PhysFrame> {
    with_frame_allocator(BitmapFrameAllocator::allocate)
}

/// Allocate one physical frame and zero it through the direct map.
pub fn allocate_zeroed_frame() -> KernelResult<PhysFrame> {
    let frame = allocate_frame()?;
    let virt = phys_to_virt(frame.start_address());

    // SAFETY:
    // The frame was just allocated, nobody else references it, and the
    // direct map makes it writable at this alias.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
    }
    Ok(frame)
}

/// Release one physical frame back to the allocator.
pub fn deallocate_frame(frame: PhysFrame) {
    with_frame_allocator(|allocator| allocator.deallocate(frame));
}

/// Number of frames currently free.
pub fn free_frames() -> u64 {
    with_frame_allocator(|allocator| allocator.free_frames())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_frame_allocation_returns_distinct_frames() {
        let first = allocate_frame().expect("first frame");
        let second = allocate_frame().expect("second frame");
        assert_ne!(
            first, second,
            "Two live allocations must not share a frame.",
        );
        deallocate_frame(first);
        deallocate_frame(second);
    }

    #[test_case]
    fn test_first_fit_reuses_freed_frame() {
        let first = allocate_frame().expect("first frame");
        let second = allocate_frame().expect("second frame");
        deallocate_frame(first);

        // First-fit: the lowest free bit is handed out again.
        let third = allocate_frame().expect("third frame");
        assert_eq!(
            first, third,
            "A first-fit allocator must reuse the lowest freed frame.",
        );
        deallocate_frame(second);
        deallocate_frame(third);
    }

    #[test_case]
    fn test_free_count_tracks_outstanding_allocations() {
        let before = free_frames();
        let frame = allocate_frame().expect("frame");
        assert_eq!(
            free_frames(),
            before - 1,
            "Allocating one frame must drop the free count by one.",
        );
        deallocate_frame(frame);
        assert_eq!(
            free_frames(),
            before,
            "Freeing must restore the free count.",
        );
    }

    #[test_case]
    fn test_double_free_is_ignored() {
        let before = free_frames();
        let frame = allocate_frame().expect("frame");
        deallocate_frame(frame);
        deallocate_frame(frame);
        assert_eq!(
            free_frames(),
            before,
            "Freeing an already-free frame must be a no-op.",
        );
    }
}
