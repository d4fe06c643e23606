//! Task control blocks.
//!
//! A task is a kernel stack, a saved register context and (for user tasks)
//! an owned address space. Kernel tasks share the kernel address space and
//! run ring-0 code; user tasks get code and stack pages mapped into a fresh
//! lower half and enter ring 3 through a trampoline on their first dispatch.

use alloc::boxed::Box;
use alloc::vec;
use core::arch::naked_asm;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::registers::control::Cr3;
use x86_64::VirtAddr;

use super::context::TaskContext;
use crate::memory::AddressSpace;
use crate::{usermode, KernelResult};

/// Size of each task's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Ticks a task may run before the round-robin rotation, refreshed whenever
/// the task is handed the CPU.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// RFLAGS value for a fresh task: reserved bit 1 plus the interrupt flag.
const INITIAL_RFLAGS: u64 = 0x202;

/// Monotonic task-id source; id 0 is never handed out.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the ready queue.
    Ready,
    /// Currently owning the CPU. Never in the ready queue.
    Running,
    /// Voluntarily off the CPU, waiting to be made ready again.
    Blocked,
    /// Finished; waiting to be reaped.
    Terminated,
}

/// A schedulable task.
pub struct Task {
    /// Unique id, monotonically increasing from 1.
    pub id: u64,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Smaller is more urgent. Recorded for a future policy; the baseline
    /// round-robin ignores it.
    pub priority: u64,
    /// Remaining ticks before rotation.
    pub time_slice: u32,
    /// Total ticks this task has spent on the CPU.
    pub total_runtime: u64,
    kernel_stack: Box<[u8]>,
    pub(crate) context: TaskContext,
    pub(crate) address_space: Option<AddressSpace>,
    pub(crate) next: Option<NonNull<Task>>,
}

impl Task {
    /// Create a kernel task that starts at `entry` on its own 16 KiB stack,
    /// sharing the kernel address space.
    pub fn new_kernel(entry: extern "C" fn(), priority: u64) -> Box<Self> {
        let kernel_stack = vec![0_u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = stack_top_of(&kernel_stack);

        let mut context = TaskContext::zeroed();
        context.rsp = stack_top.as_u64();
        context.rip = kernel_task_startup as usize as u64;
        context.rflags = INITIAL_RFLAGS;
        context.r12 = entry as usize as u64;
        context.cr3 = Cr3::read().0.start_address().as_u64();

        Box::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: TaskState::Ready,
            priority,
            time_slice: DEFAULT_TIME_SLICE,
            total_runtime: 0,
            kernel_stack,
            context,
            address_space: None,
            next: None,
        })
    }

    /// Create a user task from a flat binary image.
    ///
    /// A fresh address space is created, the image is copied into pages
    /// mapped user-rw at the fixed user code base and a user stack is mapped
    /// below the fixed stack top. The task first runs a ring-0 trampoline on
    /// its kernel stack, which drops to ring 3 at the image's first byte.
    ///
    /// # Errors
    /// Propagates frame-allocation and mapping failures; the partially
    /// built space is torn down by its drop.
    pub fn new_user(image: &[u8], priority: u64) -> KernelResult<Box<Self>> {
        let mut space = AddressSpace::new()?;
        usermode::setup_user_memory(&mut space, image)?;

        let kernel_stack = vec![0_u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = stack_top_of(&kernel_stack);

        let mut context = TaskContext::zeroed();
        context.rsp = stack_top.as_u64();
        context.rip = user_task_startup as usize as u64;
        context.rflags = INITIAL_RFLAGS;
        context.r12 = usermode::USER_CODE_START;
        context.r13 = usermode::USER_STACK_TOP;
        context.cr3 = space.root_phys().as_u64();

        Ok(Box::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: TaskState::Ready,
            priority,
            time_slice: DEFAULT_TIME_SLICE,
            total_runtime: 0,
            kernel_stack,
            context,
            address_space: Some(space),
            next: None,
        }))
    }

    /// Adopt the flow that called the scheduler's init as a task.
    ///
    /// Its context is filled in by the first switch away from it; it keeps
    /// running on the boot stack and the kernel address space.
    pub(crate) fn adopt_boot() -> Box<Self> {
        let mut context = TaskContext::zeroed();
        context.cr3 = Cr3::read().0.start_address().as_u64();

        Box::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: TaskState::Running,
            priority: 0,
            time_slice: DEFAULT_TIME_SLICE,
            total_runtime: 0,
            kernel_stack: Box::new([]),
            context,
            address_space: None,
            next: None,
        })
    }

    /// Top of this task's kernel stack, or `None` for the adopted boot task
    /// which runs on the bootloader-provided stack.
    #[must_use]
    pub fn kernel_stack_top(&self) -> Option<VirtAddr> {
        if self.kernel_stack.is_empty() {
            return None;
        }
        Some(stack_top_of(&self.kernel_stack))
    }
}

/// 16-byte aligned address just past the end of a stack buffer.
fn stack_top_of(stack: &[u8]) -> VirtAddr {
    let end = stack.as_ptr() as u64 + stack.len() as u64;
    VirtAddr::new(end & !0xF)
}

/// First instruction of every fresh kernel task.
///
/// The creating code parked the entry function pointer in r12 (a
/// callee-saved register, so the context switch delivers it intact).
#[unsafe(naked)]
extern "C" fn kernel_task_startup() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "call {main}",
        "ud2",
        main = sym kernel_task_main,
    )
}

extern "C" fn kernel_task_main(entry: extern "C" fn()) -> ! {
    entry();
    super::exit(0);
}

/// First instruction of every fresh user task: still ring 0, on the task's
/// kernel stack, with the task's address space already in CR3.
#[unsafe(naked)]
extern "C" fn user_task_startup() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "mov rsi, r13",
        "call {main}",
        "ud2",
        main = sym user_task_main,
    )
}

extern "C" fn user_task_main(entry: u64, stack_top: u64) -> ! {
    // SAFETY:
    // The task's address space maps `entry` and `stack_top` user-accessible;
    // GDT user selectors and the TSS kernel stack are installed.
    unsafe { usermode::enter_user_mode(VirtAddr::new(entry), VirtAddr::new(stack_top)) }
}
