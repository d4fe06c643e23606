//! System-call gateway over `syscall`/`sysret`.
//!
//! User programs load the call number into `rax` and arguments into
//! `rdi`, `rsi`, `rdx`, `r10`, `r8` (the Linux convention; `r10` stands in
//! for `rcx`, which the CPU clobbers with the return address). The result
//! comes back in `rax`; every failure is `-1` at this boundary.
//!
//! The entry stub switches to the current task's kernel stack and runs with
//! interrupts masked (SFMASK clears IF), so a syscall is atomic with
//! respect to the tick unless it yields on purpose.

use core::arch::naked_asm;

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use crate::{gdt, sched, serial_println, usermode};

/// read(fd, buf, n) — reserved, returns -1.
pub const SYS_READ: u64 = 0;
/// write(fd, buf, n) — serial console for fd 1 and 2.
pub const SYS_WRITE: u64 = 1;
/// open — reserved, returns -1.
pub const SYS_OPEN: u64 = 2;
/// close — reserved, returns -1.
pub const SYS_CLOSE: u64 = 3;
/// exit(code) — terminates the calling task; never returns.
pub const SYS_EXIT: u64 = 4;
/// fork — reserved, returns -1.
pub const SYS_FORK: u64 = 5;
/// exec — reserved, returns -1.
pub const SYS_EXEC: u64 = 6;
/// wait — reserved, returns -1.
pub const SYS_WAIT: u64 = 7;
/// mmap — reserved, returns -1.
pub const SYS_MMAP: u64 = 8;
/// munmap — reserved, returns -1.
pub const SYS_MUNMAP: u64 = 9;
/// yield — invokes the scheduler, returns 0.
pub const SYS_YIELD: u64 = 10;
/// getpid — returns the calling task's id.
pub const SYS_GETPID: u64 = 11;

/// Size of the dispatch table; numbers at or past this return -1.
pub const MAX_SYSCALLS: usize = 12;

/// Result of a failed call at the user boundary.
const SYSCALL_ERROR: i64 = -1;

type SyscallHandler = fn(u64, u64, u64, u64, u64) -> i64;

/// The numbered dispatch table. Reserved entries keep their slot so the
/// numbering stays stable when they grow an implementation.
static SYSCALL_TABLE: [SyscallHandler; MAX_SYSCALLS] = [
    sys_reserved, // read
    sys_write,
    sys_reserved, // open
    sys_reserved, // close
    sys_exit,
    sys_reserved, // fork
    sys_reserved, // exec
    sys_reserved, // wait
    sys_reserved, // mmap
    sys_reserved, // munmap
    sys_yield,
    sys_getpid,
];

/// Scratch slot for the caller's stack pointer between entry and the switch
/// to the kernel stack.
static mut SYSCALL_USER_RSP: u64 = 0;

/// Kernel stack the entry stub switches to; refreshed by the scheduler on
/// every context switch.
static mut SYSCALL_KERNEL_RSP: u64 = 0;

/// Install the kernel stack used by the next syscall entry.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY:
    // Single CPU; written only with interrupts masked (context switch) and
    // read only by the entry stub, which cannot interleave with a switch.
    unsafe {
        SYSCALL_KERNEL_RSP = stack_top;
    }
}

/// Program the fast-syscall machinery: EFER.SCE, the STAR selector bases,
/// the LSTAR entry point and the SFMASK flag mask.
pub fn init() {
    // SAFETY:
    // Enabling SCE is required before the MSRs below take effect.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }

    if Star::write(
        gdt::user_code_selector(),
        gdt::user_data_selector(),
        gdt::kernel_code_selector(),
        gdt::kernel_data_selector(),
    )
    .is_err()
    {
        serial_println!("[SYSCALL] ERROR: GDT selector layout unsuitable for sysret");
        return;
    }

    LStar::write(VirtAddr::new(syscall_entry as usize as u64));
    SFMask::write(RFlags::INTERRUPT_FLAG);

    serial_println!("[SYSCALL] Fast syscall gateway initialized");
}

/// The `syscall` instruction lands here with the user stack still live.
///
/// The stub parks the user RSP, switches to the per-task kernel stack,
/// saves the return state (`rcx` = RIP, `r11` = RFLAGS) and the
/// callee-saved registers, remaps the call registers onto the System V
/// convention for the dispatcher and returns through `sysretq`.
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    // Ten pushes keep the stack 16-byte aligned at the call below.
    naked_asm!(
        "mov [rip + {user_rsp}], rsp",
        "mov rsp, [rip + {kernel_rsp}]",

        // The saved user RSP moves onto the kernel stack so a task that
        // yields mid-syscall cannot have it overwritten by another task
        // entering the gateway.
        "push qword ptr [rip + {user_rsp}]",
        "push rax",
        "push rcx",
        "push r11",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",

        // Remap: rax=nr, rdi,rsi,rdx,r10,r8 -> SysV rdi..r9.
        // Chain order matters; each source is read before overwrite.
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "mov r9, r8",
        "mov r8, r10",

        "call {dispatch}",

        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop r11",
        "pop rcx",
        "add rsp, 8",
        "pop rsp",
        "sysretq",

        user_rsp = sym SYSCALL_USER_RSP,
        kernel_rsp = sym SYSCALL_KERNEL_RSP,
        dispatch = sym syscall_dispatch,
    )
}

/// Route a call number to its handler. Numbers outside the table return -1
/// with no side effects.
extern "C" fn syscall_dispatch(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    let Some(handler) = SYSCALL_TABLE.get(nr as usize) else {
        serial_println!("[SYSCALL] {}: {}", nr, crate::KernelError::InvalidCall);
        return SYSCALL_ERROR;
    };
    handler(a0, a1, a2, a3, a4)
}

/// Placeholder for calls that are wired but not implemented.
fn sys_reserved(_a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
    SYSCALL_ERROR
}

/// write(fd, buf, n): fd 1 and 2 go to the serial console.
///
/// The buffer is only dereferenced after validating that it lies entirely
/// below the user/kernel boundary; the hardware enforces the rest because
/// the call runs with the caller's address space loaded.
fn sys_write(fd: u64, buf: u64, len: u64, _a3: u64, _a4: u64) -> i64 {
    if fd != 1 && fd != 2 {
        return SYSCALL_ERROR;
    }
    if !usermode::user_range_is_valid(buf, len) {
        return SYSCALL_ERROR;
    }

    // SAFETY:
    // The range was validated to sit below the kernel boundary and the
    // caller's address space is active, so faults cannot corrupt kernel
    // state reachable from here.
    let bytes = unsafe { core::slice::from_raw_parts(buf as *const u8, len as usize) };

    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut serial = crate::serial::SERIAL1.lock();
        for &byte in bytes {
            serial.send(byte);
        }
    });

    len as i64
}

/// exit(code): terminate the calling task. Never returns to user mode.
fn sys_exit(code: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
    sched::exit(code as i64)
}

/// yield(): rotate the ready queue.
fn sys_yield(_a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
    sched::yield_now();
    0
}

/// getpid(): id of the calling task, or -1 when no task is current.
fn sys_getpid(_a0: u64, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i64 {
    sched::current_task_id().map_or(SYSCALL_ERROR, |id| id as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_invalid_syscall_number_returns_error() {
        assert_eq!(
            syscall_dispatch(MAX_SYSCALLS as u64, 0, 0, 0, 0, 0),
            SYSCALL_ERROR,
            "A number past the table must return -1.",
        );
        assert_eq!(
            syscall_dispatch(999, 0, 0, 0, 0, 0),
            SYSCALL_ERROR,
            "A wild number must return -1.",
        );
    }

    #[test_case]
    fn test_reserved_syscalls_return_error() {
        for nr in [
            SYS_READ, SYS_OPEN, SYS_CLOSE, SYS_FORK, SYS_EXEC, SYS_WAIT, SYS_MMAP, SYS_MUNMAP,
        ] {
            assert_eq!(
                syscall_dispatch(nr, 1, 2, 3, 4, 5),
                SYSCALL_ERROR,
                "Reserved syscalls must return -1 with no side effects.",
            );
        }
    }

    #[test_case]
    fn test_write_rejects_bad_descriptor() {
        assert_eq!(
            syscall_dispatch(SYS_WRITE, 3, usermode::USER_CODE_START, 1, 0, 0),
            SYSCALL_ERROR,
            "Only fd 1 and 2 are writable.",
        );
    }

    #[test_case]
    fn test_write_rejects_kernel_buffer() {
        let kernel_buf = usermode::USER_SPACE_END + 0x1000;
        assert_eq!(
            syscall_dispatch(SYS_WRITE, 1, kernel_buf, 8, 0, 0),
            SYSCALL_ERROR,
            "A buffer above the user boundary must be rejected.",
        );
    }

    #[test_case]
    fn test_getpid_without_scheduler_returns_error() {
        assert_eq!(
            syscall_dispatch(SYS_GETPID, 0, 0, 0, 0, 0),
            SYSCALL_ERROR,
            "getpid must return -1 while no task is current.",
        );
    }
}
