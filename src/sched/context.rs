//! The architecture-specific context switch primitive.

use core::arch::naked_asm;

/// Saved execution state of a suspended task.
///
/// Only the callee-saved registers plus instruction pointer, flags and the
/// page-table root are kept here: a task is always suspended at a call
/// boundary (inside [`context_switch`]), where the System V ABI makes every
/// caller-saved register dead.
///
/// The field order is part of the contract with the assembly below.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Stack pointer. Offset 0x00.
    pub rsp: u64,
    /// Frame pointer. Offset 0x08.
    pub rbp: u64,
    /// Offset 0x10.
    pub rbx: u64,
    /// Offset 0x18.
    pub r12: u64,
    /// Offset 0x20.
    pub r13: u64,
    /// Offset 0x28.
    pub r14: u64,
    /// Offset 0x30.
    pub r15: u64,
    /// Resume instruction pointer. Offset 0x38.
    pub rip: u64,
    /// Saved RFLAGS. Offset 0x40.
    pub rflags: u64,
    /// Physical address of the page-table root. Offset 0x48.
    pub cr3: u64,
}

impl TaskContext {
    /// An all-zero context, filled in either by task creation or by the
    /// first switch away from the running flow.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
        rsp: 0,
        rbp: 0,
        rbx: 0,
        r12: 0,
        r13: 0,
        r14: 0,
        r15: 0,
        rip: 0,
        rflags: 0,
        cr3: 0,
        }
    }
}

/// Switch from the context in `from` to the context in `to`.
///
/// Saves the callee-saved registers, the return address and RFLAGS into
/// `from`, loads `to`'s page-table root into CR3 when it differs from the
/// active one, restores `to`'s registers and resumes at `to`'s saved
/// instruction pointer. The call returns (much later) when some other task
/// switches back to `from`.
///
/// # Safety
/// `to` must point to a valid context whose stack and instruction pointer
/// are live, and whose CR3 maps the kernel half. `from` may be null for a
/// switch that abandons the current flow (the first dispatch and `exit`);
/// otherwise it must point to storage that outlives the suspension. The
/// caller must run with interrupts masked and a 16-byte aligned stack.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut TaskContext, _to: *const TaskContext) {
    // Offsets match the #[repr(C)] layout of TaskContext. rdi = from,
    // rsi = to per the System V ABI.
    naked_asm!(
        "test rdi, rdi",
        "jz 2f",

        // The saved rip is this call's return address; the saved rsp is
        // the stack pointer after that return address is popped.
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x00], rax",

        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",

        "pushfq",
        "pop rax",
        "mov [rdi + 0x40], rax",

        "mov rax, cr3",
        "mov [rdi + 0x48], rax",

        "2:",
        // Reloading CR3 flushes the whole TLB; skip it when the target
        // shares the current address space.
        "mov rax, [rsi + 0x48]",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 3f",
        "mov cr3, rax",

        "3:",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",

        "push qword ptr [rsi + 0x40]",
        "popfq",

        "mov rax, [rsi + 0x38]",
        "jmp rax",
    )
}
