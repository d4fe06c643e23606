//! Address spaces: 4-level page-table trees behind a small handle.
//!
//! Every space shares the kernel half by copying the root entries
//! [256..512) from the kernel space; the lower half belongs to user
//! mappings. Page-table frames are reached through the higher-half direct
//! map — physical `p` lives at `hhdm_offset + p` — so walking a tree is pure
//! arithmetic and no table is ever mapped into its own virtual range.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::page_table::PageTableEntry;
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use super::{deallocate_frame, phys_to_virt, PAGE_SIZE};
use crate::{serial_println, KernelError, KernelResult};

/// First root index of the shared kernel half.
pub const KERNEL_HALF_START: usize = 256;

/// Physical address of the kernel root table, latched at boot.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Adopt the page tables the bootloader set up as the kernel address space.
///
/// The kernel image, its stack and the direct map all live in the upper half
/// of that tree, which is exactly the half shared into every new space.
pub(crate) fn kernel_init() {
    let (frame, _) = Cr3::read();
    KERNEL_ROOT.store(frame.start_address().as_u64(), Ordering::Relaxed);
    serial_println!(
        "[VMM] Kernel root table at {:#x}",
        frame.start_address().as_u64()
    );
}

/// Owner of one page-table tree.
///
/// Dropping a non-kernel space frees every lower-half page-table frame
/// reachable from its root, then the root itself. The kernel space is a
/// borrowed handle and is never torn down.
pub struct AddressSpace {
    root_phys: PhysAddr,
    is_kernel: bool,
}

impl AddressSpace {
    /// Handle to the kernel address space.
    #[must_use]
    pub fn kernel() -> Self {
        Self {
            root_phys: PhysAddr::new(KERNEL_ROOT.load(Ordering::Relaxed)),
            is_kernel: true,
        }
    }

    /// Create a fresh address space with an empty user half.
    ///
    /// # Errors
    /// Fails with [`KernelError::OutOfFrames`] when no frame is available
    /// for the root table.
    pub fn new() -> KernelResult<Self> {
        let root = super::allocate_zeroed_frame()?;

        // SAFETY:
        // Both roots are valid page-table frames reached through the direct
        // map; the new root is exclusively ours.
        unsafe {
            let kernel_root = &*table_ptr(PhysAddr::new(KERNEL_ROOT.load(Ordering::Relaxed)));
            let new_root = &mut *table_ptr(root.start_address());
            for i in KERNEL_HALF_START..512 {
                new_root[i] = kernel_root[i].clone();
            }
        }

        Ok(Self {
            root_phys: root.start_address(),
            is_kernel: false,
        })
    }

    /// Physical address of the root table (the CR3 value of this space).
    #[must_use]
    pub const fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Map `virt` to `phys` with the given leaf flags.
    ///
    /// Both addresses are aligned down to a page boundary. Absent
    /// intermediate tables are allocated and given `PRESENT | WRITABLE |
    /// USER_ACCESSIBLE` so the access decision stays with the leaf. The TLB
    /// entry for the page is invalidated on the executing CPU.
    ///
    /// # Errors
    /// [`KernelError::MapFailure`] when a page-table frame cannot be
    /// allocated (the partial walk stays in place), or
    /// [`KernelError::InvalidArgument`] when the walk runs into a huge page.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> KernelResult<()> {
        let virt = virt.align_down(PAGE_SIZE as u64);
        let phys = phys.align_down(PAGE_SIZE as u64);

        // SAFETY:
        // The root belongs to this space and intermediate tables come either
        // from it or from freshly zeroed frames.
        unsafe {
            let l4 = &mut *table_ptr(self.root_phys);
            let l3 = next_table_or_create(&mut l4[virt.p4_index()])?;
            let l2 = next_table_or_create(&mut l3[virt.p3_index()])?;
            let l1 = next_table_or_create(&mut l2[virt.p2_index()])?;
            l1[virt.p1_index()].set_addr(phys, flags | PageTableFlags::PRESENT);
        }

        tlb::flush(virt);
        Ok(())
    }

    /// Remove the mapping of `virt` and invalidate its TLB entry.
    ///
    /// Page tables emptied by the unmap are left in place; they are
    /// reclaimed when the space is destroyed.
    ///
    /// # Errors
    /// [`KernelError::NotMapped`] when any level of the walk is absent.
    pub fn unmap(&mut self, virt: VirtAddr) -> KernelResult<()> {
        let virt = virt.align_down(PAGE_SIZE as u64);

        // SAFETY:
        // Read-only walk over tables owned by this space; only the leaf
        // entry is written.
        unsafe {
            let l4 = &mut *table_ptr(self.root_phys);
            let l3 = next_table(&l4[virt.p4_index()]).ok_or(KernelError::NotMapped)?;
            let l2 = next_table(&l3[virt.p3_index()]).ok_or(KernelError::NotMapped)?;
            let l1 = next_table(&l2[virt.p2_index()]).ok_or(KernelError::NotMapped)?;
            let entry = &mut l1[virt.p1_index()];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return Err(KernelError::NotMapped);
            }
            entry.set_unused();
        }

        tlb::flush(virt);
        Ok(())
    }

    /// Translate a virtual address to its physical mapping, if any.
    ///
    /// Huge mappings at L3 (1 GiB) and L2 (2 MiB) are recognised and the
    /// low bits of the request are folded in; for 4 KiB pages the frame base
    /// is returned. This walk never allocates.
    #[must_use]
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY:
        // Read-only walk over tables owned by this space.
        unsafe {
            let l4 = &*table_ptr(self.root_phys);
            let e4 = &l4[virt.p4_index()];
            if !e4.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }

            let l3 = &*table_ptr(e4.addr());
            let e3 = &l3[virt.p3_index()];
            if !e3.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            if e3.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Some(e3.addr() + (virt.as_u64() & 0x3FFF_FFFF));
            }

            let l2 = &*table_ptr(e3.addr());
            let e2 = &l2[virt.p2_index()];
            if !e2.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            if e2.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Some(e2.addr() + (virt.as_u64() & 0x1F_FFFF));
            }

            let l1 = &*table_ptr(e2.addr());
            let e1 = &l1[virt.p1_index()];
            if !e1.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            Some(e1.addr())
        }
    }

    /// Load this space's root into CR3.
    ///
    /// # Safety
    /// The caller must guarantee that the code, stack and data it keeps
    /// using are mapped in this space (the shared kernel half covers all
    /// kernel-side state).
    pub unsafe fn switch(&self) {
        // SAFETY:
        // The root frame is a valid page-table frame owned by this space.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(self.root_phys),
                Cr3Flags::empty(),
            );
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.is_kernel {
            return;
        }

        // SAFETY:
        // The space is being destroyed and nothing runs on it anymore; the
        // walk only touches the lower half, which this space owns alone.
        unsafe {
            free_lower_half(self.root_phys);
        }
        deallocate_frame(PhysFrame::containing_address(self.root_phys));
    }
}

fn table_ptr(phys: PhysAddr) -> *mut PageTable {
    phys_to_virt(phys).as_mut_ptr()
}

/// Follow `entry` to the next table, allocating and zeroing one if absent.
unsafe fn next_table_or_create(
    entry: &mut PageTableEntry,
) -> KernelResult<&'static mut PageTable> {
    if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
        return Err(KernelError::InvalidArgument);
    }
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        let frame = super::allocate_zeroed_frame().map_err(|_| KernelError::MapFailure)?;
        entry.set_addr(
            frame.start_address(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        );
    }

    // SAFETY:
    // The entry now names a valid table frame reachable through the direct
    // map; the caller holds the walk exclusively.
    Ok(unsafe { &mut *table_ptr(entry.addr()) })
}

/// Follow `entry` without allocating; `None` when absent or huge.
unsafe fn next_table(entry: &PageTableEntry) -> Option<&'static mut PageTable> {
    if !entry.flags().contains(PageTableFlags::PRESENT)
        || entry.flags().contains(PageTableFlags::HUGE_PAGE)
    {
        return None;
    }

    // SAFETY:
    // Present non-huge entries always name a table frame.
    Some(unsafe { &mut *table_ptr(entry.addr()) })
}

/// Depth-first release of every lower-half page-table frame under `root`.
///
/// Huge-page entries carry no subordinate table and are skipped; the shared
/// upper half is never touched. Mapped data frames stay with their owners.
unsafe fn free_lower_half(root: PhysAddr) {
    // SAFETY:
    // All tables reached here belong exclusively to the dying space.
    unsafe {
        let l4 = &mut *table_ptr(root);
        for i in 0..KERNEL_HALF_START {
            let e4 = &mut l4[i];
            if !e4.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }

            let l3 = &mut *table_ptr(e4.addr());
            for j in 0..512 {
                let e3 = &l3[j];
                if !e3.flags().contains(PageTableFlags::PRESENT)
                    || e3.flags().contains(PageTableFlags::HUGE_PAGE)
                {
                    continue;
                }

                let l2 = &*table_ptr(e3.addr());
                for k in 0..512 {
                    let e2 = &l2[k];
                    if !e2.flags().contains(PageTableFlags::PRESENT)
                        || e2.flags().contains(PageTableFlags::HUGE_PAGE)
                    {
                        continue;
                    }
                    deallocate_frame(PhysFrame::containing_address(e2.addr()));
                }
                deallocate_frame(PhysFrame::containing_address(e3.addr()));
            }
            deallocate_frame(PhysFrame::containing_address(e4.addr()));
            e4.set_unused();
        }
    }
}
