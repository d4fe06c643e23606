//! Bit-per-frame physical memory allocator.
//!
//! One bit per 4 KiB frame, set = allocated. Initialization marks the whole
//! bitmap allocated, clears the frames inside usable ranges of the boot
//! memory map and finally re-marks the frames holding the bitmap itself.

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use super::{phys_to_virt, PAGE_SIZE};
use crate::{KernelError, KernelResult};

/// First-fit bitmap allocator over all physical frames reported at boot.
pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u64],
    total_frames: u64,
    used_frames: u64,
}

impl BitmapFrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// The bitmap itself is stored in the first usable region large enough to
    /// hold it, reached through the higher-half direct map.
    ///
    /// # Safety
    /// The caller must guarantee that the memory map is the one provided by
    /// the bootloader and that the direct map is already initialized.
    ///
    /// # Panics
    /// Panics when no usable region can hold the bitmap; the machine cannot
    /// run without a frame allocator.
    pub unsafe fn new(regions: &[MemoryRegion]) -> Self {
        let highest = regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .map(|r| r.end)
            .max()
            .unwrap_or(0);

        let total_frames = highest / PAGE_SIZE as u64;
        let words = usize::try_from((total_frames + 63) / 64).unwrap_or(0);
        let bitmap_bytes = words * 8;

        let storage = regions
            .iter()
            .find(|r| {
                r.kind == MemoryRegionKind::Usable
                    && (r.end - r.start) as usize >= bitmap_bytes
            })
            .unwrap_or_else(|| panic!("no usable region large enough for the frame bitmap"));

        let base = PhysAddr::new(storage.start);

        // SAFETY:
        // `base` points at usable RAM reachable through the direct map; the
        // region is large enough per the check above and nothing else owns
        // it yet.
        let bitmap = unsafe {
            core::slice::from_raw_parts_mut(phys_to_virt(base).as_mut_ptr::<u64>(), words)
        };

        // Everything starts allocated; usable ranges are then released.
        bitmap.fill(u64::MAX);
        let mut allocator = Self {
            bitmap,
            total_frames,
            used_frames: total_frames,
        };

        for region in regions.iter().filter(|r| r.kind == MemoryRegionKind::Usable) {
            let first = region.start / PAGE_SIZE as u64;
            let count = (region.end - region.start) / PAGE_SIZE as u64;
            for frame in first..first + count {
                if frame < allocator.total_frames && allocator.test(frame) {
                    allocator.clear(frame);
                    allocator.used_frames -= 1;
                }
            }
        }

        // The bitmap occupies real frames; take them back out of circulation.
        let bitmap_frames = (bitmap_bytes as u64 + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        let bitmap_base = base.as_u64() / PAGE_SIZE as u64;
        for frame in bitmap_base..bitmap_base + bitmap_frames {
            if frame < allocator.total_frames && !allocator.test(frame) {
                allocator.set(frame);
                allocator.used_frames += 1;
            }
        }

        allocator
    }

    fn set(&mut self, frame: u64) {
        self.bitmap[(frame / 64) as usize] |= 1 << (frame % 64);
    }

    fn clear(&mut self, frame: u64) {
        self.bitmap[(frame / 64) as usize] &= !(1 << (frame % 64));
    }

    fn test(&self, frame: u64) -> bool {
        self.bitmap[(frame / 64) as usize] & (1 << (frame % 64)) != 0
    }

    /// Allocate the first free frame, scanning from the bottom of memory.
    pub fn allocate(&mut self) -> KernelResult<PhysFrame> {
        let frame = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(word_index, word)| word_index as u64 * 64 + u64::from(word.trailing_ones()))
            .filter(|&frame| frame < self.total_frames)
            .ok_or(KernelError::OutOfFrames)?;

        self.set(frame);
        self.used_frames += 1;

        let addr = PhysAddr::new(frame * PAGE_SIZE as u64);

        #[expect(
            clippy::expect_used,
            reason = "The address is a frame index times the frame size, always aligned."
        )]
        Ok(PhysFrame::from_start_address(addr).expect("frame-aligned address"))
    }

    /// Allocate `count` physically contiguous frames and return the first.
    ///
    /// Used once at boot to carve out the kernel heap; the plain first-fit
    /// scan is acceptable at that point because almost everything is free.
    pub fn allocate_contiguous(&mut self, count: u64) -> KernelResult<PhysFrame> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let mut run_start = 0_u64;
        let mut run_len = 0_u64;
        for frame in 0..self.total_frames {
            if self.test(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for taken in run_start..run_start + count {
                    self.set(taken);
                }
                self.used_frames += count;
                let addr = PhysAddr::new(run_start * PAGE_SIZE as u64);

                #[expect(
                    clippy::expect_used,
                    reason = "The address is a frame index times the frame size, always aligned."
                )]
                return Ok(PhysFrame::from_start_address(addr).expect("frame-aligned address"));
            }
        }
        Err(KernelError::OutOfFrames)
    }

    /// Release a frame. Freeing an already-free or out-of-range frame is a
    /// caller contract violation and is ignored.
    pub fn deallocate(&mut self, frame: PhysFrame) {
        let index = frame.start_address().as_u64() / PAGE_SIZE as u64;
        if index < self.total_frames && self.test(index) {
            self.clear(index);
            self.used_frames -= 1;
        }
    }

    /// Total number of frames covered by the bitmap.
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Number of frames currently free.
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.total_frames - self.used_frames
    }
}

/// Implement the `x86_64` allocator trait so page-table code can pull frames
/// directly.
///
/// SAFETY:
///
/// Frames handed out are marked in the bitmap and never returned twice.
unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate().ok()
    }
}
