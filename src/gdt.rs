//! GDT and TSS initialization.
//!
//! The segment order is load-bearing: `syscall` loads CS/SS from the kernel
//! base (code at 0x08, data at 0x10) and `sysret` loads them from the user
//! base (data at base+8, code at base+16), so the table is laid out as
//! kernel code, kernel data, TSS, user data, user code.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, DS, ES, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// The index of the IST entry for the double fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Size of the boot kernel stack installed in the TSS before the scheduler
/// hands out per-task stacks.
const BOOT_KERNEL_STACK_SIZE: usize = 4096 * 5;

/// Size of the double fault handler stack.
const DOUBLE_FAULT_STACK_SIZE: usize = 4096 * 5;

static mut TSS: TaskStateSegment = TaskStateSegment::new();

/// Initialize the Global Descriptor Table (GDT).
pub fn init() {
    GDT.0.load();

    // SAFETY:
    // The GDT is loaded; the selectors name the segments created below.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Install `stack_top` as the kernel stack the CPU switches to when an
/// interrupt arrives in ring 3.
///
/// The scheduler calls this on every context switch with the incoming
/// task's kernel stack.
pub fn set_kernel_stack(stack_top: VirtAddr) {
    // SAFETY:
    // Single CPU; the TSS is only written here and during `init`, both with
    // interrupts masked, and the CPU reads RSP0 only on a privilege change.
    unsafe {
        (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = stack_top;
    }
}

/// Returns the kernel code segment selector.
#[must_use]
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.kernel_code
}

/// Returns the kernel data segment selector.
#[must_use]
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.kernel_data
}

/// Returns the user code segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code
}

/// Returns the user data segment selector with Ring 3 privilege level.
#[must_use]
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data
}

/// Holds the GDT segment selectors used during initialization, user mode
/// transitions and syscall MSR setup.
struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
    user_data: SegmentSelector,
    user_code: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        // SAFETY:
        // Runs once, before the TSS selector is loaded; nothing reads the
        // TSS concurrently.
        unsafe {
            let tss = &mut *core::ptr::addr_of_mut!(TSS);

            // Dedicated stack for double fault exceptions, so a kernel stack
            // overflow still reaches its handler.
            tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
                static mut STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];

                let stack_start = VirtAddr::from_ptr(&raw const STACK);
                stack_start + DOUBLE_FAULT_STACK_SIZE as u64
            };

            // Kernel stack used on ring 3 -> ring 0 transitions until the
            // scheduler installs a per-task stack.
            tss.privilege_stack_table[0] = {
                static mut KERNEL_STACK: [u8; BOOT_KERNEL_STACK_SIZE] =
                    [0; BOOT_KERNEL_STACK_SIZE];

                let stack_start = VirtAddr::from_ptr(&raw const KERNEL_STACK);
                stack_start + BOOT_KERNEL_STACK_SIZE as u64
            };
        }

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());

        // SAFETY:
        // The TSS lives in a static and is never moved or dropped.
        let tss = gdt.add_entry(Descriptor::tss_segment(unsafe {
            &*core::ptr::addr_of!(TSS)
        }));

        // `sysret` expects user data then user code; the selectors returned
        // by `add_entry` have RPL=0, so new ones are built with RPL=3.
        let user_data_entry = gdt.add_entry(Descriptor::user_data_segment());
        let user_code_entry = gdt.add_entry(Descriptor::user_code_segment());

        let user_data = SegmentSelector(user_data_entry.0 | 3);
        let user_code = SegmentSelector(user_code_entry.0 | 3);

        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
                user_data,
                user_code,
            },
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_selector_layout_matches_syscall_contract() {
        // syscall: SS = kernel CS + 8; sysret: SS = base + 8, CS = base + 16.
        assert_eq!(
            kernel_data_selector().0,
            kernel_code_selector().0 + 8,
            "Kernel data must directly follow kernel code.",
        );
        assert_eq!(
            user_code_selector().0,
            user_data_selector().0 + 8,
            "User code must directly follow user data.",
        );
        assert_eq!(
            user_code_selector().0 & 3,
            3,
            "User code selector must carry RPL 3.",
        );
    }
}
