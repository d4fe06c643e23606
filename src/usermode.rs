//! User-mode support: layout, memory setup and the ring 0 -> ring 3 jump.
//!
//! Every user task sees the same layout: its code mapped at a fixed low
//! address, its stack ending at a fixed address above the code and growing
//! down, and the kernel half above the canonical boundary, unreachable
//! thanks to the user bit.

use core::arch::naked_asm;

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::{self, AddressSpace, PAGE_SIZE};
use crate::{gdt, KernelError, KernelResult};

/// Base virtual address where user program code is loaded (4 MiB).
pub const USER_CODE_START: u64 = 0x40_0000;

/// Top of the user-mode stack (5 MiB; the stack grows downward).
pub const USER_STACK_TOP: u64 = 0x50_0000;

/// Size of the user-mode stack in bytes (16 KiB).
pub const USER_STACK_SIZE: u64 = 4096 * 4;

/// Bottom of the user-mode stack.
pub const USER_STACK_BOTTOM: u64 = USER_STACK_TOP - USER_STACK_SIZE;

/// First address past the canonical lower half; everything at or above this
/// belongs to the kernel.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Whether `addr` lies in the user half of the address space.
#[must_use]
pub const fn is_user_addr(addr: u64) -> bool {
    addr < USER_SPACE_END
}

/// Whether the byte range `[addr, addr + len)` lies entirely in the user
/// half, without wrapping.
#[must_use]
pub const fn user_range_is_valid(addr: u64, len: u64) -> bool {
    if len == 0 {
        return is_user_addr(addr);
    }
    match addr.checked_add(len) {
        Some(end) => is_user_addr(addr) && end <= USER_SPACE_END,
        None => false,
    }
}

/// Populate a fresh address space with a user image and stack.
///
/// Code pages are mapped user-rw at [`USER_CODE_START`] and filled from
/// `image` (the remainder of the last page is zeroed); stack pages are
/// mapped user-rw from [`USER_STACK_BOTTOM`] up to [`USER_STACK_TOP`] and
/// zeroed. Frames are written through the higher-half direct map, so the
/// target space does not need to be active.
///
/// # Errors
/// Propagates frame-allocation and mapping failures.
pub fn setup_user_memory(space: &mut AddressSpace, image: &[u8]) -> KernelResult<()> {
    if image.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let flags =
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;

    let code_pages = (image.len() + PAGE_SIZE - 1) / PAGE_SIZE;
    for page in 0..code_pages {
        let frame = memory::allocate_frame()?;
        copy_page_into_frame(frame.start_address(), image, page * PAGE_SIZE);
        space.map(
            VirtAddr::new(USER_CODE_START + (page * PAGE_SIZE) as u64),
            frame.start_address(),
            flags,
        )?;
    }

    let stack_pages = USER_STACK_SIZE as usize / PAGE_SIZE;
    for page in 0..stack_pages {
        let frame = memory::allocate_zeroed_frame()?;
        space.map(
            VirtAddr::new(USER_STACK_BOTTOM + (page * PAGE_SIZE) as u64),
            frame.start_address(),
            flags,
        )?;
    }

    Ok(())
}

/// Copy one page worth of `image` starting at `offset` into a frame,
/// zero-filling the tail.
fn copy_page_into_frame(frame: PhysAddr, image: &[u8], offset: usize) {
    let dest = memory::phys_to_virt(frame).as_mut_ptr::<u8>();
    let end = image.len().min(offset + PAGE_SIZE);
    let chunk = &image[offset.min(image.len())..end];

    // SAFETY:
    // The frame was just allocated for this page; the direct-map alias is
    // valid for PAGE_SIZE bytes and does not overlap the image.
    unsafe {
        core::ptr::copy_nonoverlapping(chunk.as_ptr(), dest, chunk.len());
        core::ptr::write_bytes(dest.add(chunk.len()), 0, PAGE_SIZE - chunk.len());
    }
}

/// Switch the CPU to Ring 3 at `entry` with the given user stack.
///
/// Builds a fake interrupt frame (user SS:RSP, RFLAGS with interrupts
/// enabled, user CS:RIP) and executes `iretq`, which atomically drops the
/// privilege level and resumes in user code.
///
/// # Safety
/// The caller must guarantee that `entry` and `stack_top` are mapped
/// user-accessible in the active address space, that the GDT user segments
/// exist and that the TSS holds a valid kernel stack for re-entry.
pub unsafe fn enter_user_mode(entry: VirtAddr, stack_top: VirtAddr) -> ! {
    let user_cs = u64::from(gdt::user_code_selector().0);
    let user_ss = u64::from(gdt::user_data_selector().0);

    // SAFETY:
    // Selector and mapping requirements are delegated to this function's
    // contract; the stub never returns.
    unsafe { iretq_to_user(entry.as_u64(), stack_top.as_u64(), user_cs, user_ss) }
}

/// The `iretq` trampoline.
///
/// Uses the System V AMD64 calling convention:
/// * `rdi` - user entry point.
/// * `rsi` - user stack top.
/// * `rdx` - user code segment selector (RPL=3).
/// * `rcx` - user data segment selector (RPL=3).
#[unsafe(naked)]
unsafe extern "C" fn iretq_to_user(_entry: u64, _stack: u64, _user_cs: u64, _user_ss: u64) -> ! {
    naked_asm!(
        // Load the user data selector into the data segment registers.
        "mov ax, cx",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",

        // iretq frame: SS, RSP, RFLAGS (IF set), CS, RIP.
        "push rcx",
        "push rsi",
        "push 0x202",
        "push rdx",
        "push rdi",
        "iretq",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_user_layout_is_consistent() {
        assert_eq!(
            USER_STACK_BOTTOM + USER_STACK_SIZE,
            USER_STACK_TOP,
            "Stack bottom plus size must equal the stack top.",
        );
        assert_eq!(USER_CODE_START % 4096, 0, "Code base must be page-aligned.");
        assert_eq!(USER_STACK_TOP % 4096, 0, "Stack top must be page-aligned.");
        assert!(
            USER_CODE_START < USER_STACK_BOTTOM,
            "User code must sit below the user stack.",
        );
    }

    #[test_case]
    fn test_user_range_validation() {
        assert!(
            user_range_is_valid(USER_CODE_START, 4096),
            "A range inside the user half must validate.",
        );
        assert!(
            !user_range_is_valid(USER_SPACE_END, 1),
            "A range starting at the kernel boundary must be rejected.",
        );
        assert!(
            !user_range_is_valid(u64::MAX - 4, 16),
            "A wrapping range must be rejected.",
        );
        assert!(
            !user_range_is_valid(USER_SPACE_END - 8, 64),
            "A range crossing into the kernel half must be rejected.",
        );
    }
}
