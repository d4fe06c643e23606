//! Round-robin preemptive scheduler.
//!
//! A single FIFO ready queue of task pointers, rotated by the timer tick and
//! by voluntary yields. The idle task is always reachable, so the CPU always
//! has something to run. At most one task is `Running` and that task is
//! never in the queue.
//!
//! All scheduler state is mutated with interrupts masked: the timer
//! interrupt is the only other flow that touches it, and it runs with
//! interrupts disabled by the interrupt gate.

use alloc::boxed::Box;
use core::ptr::NonNull;

use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::{gdt, serial_println, syscall, KernelResult};

pub mod context;
pub mod task;

pub use context::TaskContext;
pub use task::{Task, TaskState};

use context::context_switch;

/// Priority given to the idle task; the baseline policy ignores priority,
/// but the value documents intent (smaller is more urgent).
const IDLE_PRIORITY: u64 = 999;

/// Single-ended FIFO of ready tasks, linked through `Task::next`.
struct ReadyQueue {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
    len: u64,
}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// O(1) append at the tail.
    fn push_back(&mut self, mut task: NonNull<Task>) {
        // SAFETY:
        // The pointer came from Box::into_raw and the scheduler lock is
        // held; nothing else references the node.
        unsafe { task.as_mut() }.next = None;
        match self.tail {
            Some(mut tail) => {
                // SAFETY: same ownership argument as above.
                unsafe { tail.as_mut() }.next = Some(task);
                self.tail = Some(task);
            }
            None => {
                self.head = Some(task);
                self.tail = Some(task);
            }
        }
        self.len += 1;
    }

    /// O(1) removal at the head.
    fn pop_front(&mut self) -> Option<NonNull<Task>> {
        let mut head = self.head?;

        // SAFETY: scheduler lock held, node owned by the queue.
        let next = unsafe { head.as_mut() }.next.take();
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// O(n) unlink of an arbitrary queued task.
    fn remove(&mut self, target: NonNull<Task>) -> bool {
        let mut prev: Option<NonNull<Task>> = None;
        let mut cursor = self.head;

        while let Some(mut node) = cursor {
            // SAFETY: scheduler lock held, nodes owned by the queue.
            let next = unsafe { node.as_ref() }.next;
            if node == target {
                match prev {
                    // SAFETY: same ownership argument.
                    Some(mut p) => unsafe { p.as_mut() }.next = next,
                    None => self.head = next,
                }
                if self.tail == Some(node) {
                    self.tail = prev;
                }
                // SAFETY: the node is now unlinked.
                unsafe { node.as_mut() }.next = None;
                self.len -= 1;
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }
}

struct Scheduler {
    queue: ReadyQueue,
    current: Option<NonNull<Task>>,
    zombie: Option<NonNull<Task>>,
    enabled: bool,
    /// Ready + Running tasks; the accounting the test suite checks.
    live_tasks: u64,
    last_exit_code: Option<i64>,
}

// SAFETY:
//
// Single CPU; every access goes through the spin lock with interrupts
// masked, so the raw task pointers are never accessed concurrently.
unsafe impl Send for Scheduler {}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler {
    queue: ReadyQueue::new(),
    current: None,
    zombie: None,
    enabled: false,
    live_tasks: 0,
    last_exit_code: None,
});

/// Initialize the scheduler: adopt the calling flow as the first task and
/// create the always-present idle task.
pub fn init() {
    let boot = NonNull::from(Box::leak(Task::adopt_boot()));
    let idle = NonNull::from(Box::leak(Task::new_kernel(idle_task_entry, IDLE_PRIORITY)));

    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.current = Some(boot);
        sched.queue.push_back(idle);
        sched.live_tasks = 2;
    });

    serial_println!("[SCHED] Scheduler initialized (idle task ready)");
}

/// Body of the idle task: halt until the next interrupt, forever.
extern "C" fn idle_task_entry() {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Enqueue a task; it becomes `Ready` at the tail of the queue.
pub fn add_task(mut task: Box<Task>) -> u64 {
    task.state = TaskState::Ready;
    let id = task.id;
    let ptr = NonNull::from(Box::leak(task));

    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        sched.queue.push_back(ptr);
        sched.live_tasks += 1;
    });
    id
}

/// Create and enqueue a kernel task. Returns its id.
pub fn spawn_kernel(entry: extern "C" fn(), priority: u64) -> u64 {
    add_task(Task::new_kernel(entry, priority))
}

/// Create and enqueue a user task from a flat binary image. Returns its id.
///
/// # Errors
/// Propagates address-space and mapping failures from task creation.
pub fn spawn_user(image: &[u8], priority: u64) -> KernelResult<u64> {
    Ok(add_task(Task::new_user(image, priority)?))
}

/// Unlink a queued task by id and destroy it. Returns false when the id is
/// not in the ready queue (the running task cannot be removed this way).
pub fn remove_task(id: u64) -> bool {
    interrupts::without_interrupts(|| {
        let mut sched = SCHEDULER.lock();

        let mut cursor = sched.queue.head;
        while let Some(node) = cursor {
            // SAFETY: scheduler lock held.
            let node_ref = unsafe { node.as_ref() };
            if node_ref.id == id {
                let unlinked = sched.queue.remove(node);
                if unlinked {
                    sched.live_tasks -= 1;
                    // SAFETY:
                    // The node is unlinked, not current, and came from
                    // Box::into_raw in add_task.
                    drop(unsafe { Box::from_raw(node.as_ptr()) });
                }
                return unlinked;
            }
            cursor = node_ref.next;
        }
        false
    })
}

/// Gate for the whole scheduling machinery. While disabled the current task
/// runs indefinitely; used during single-threaded early boot and by tests.
pub fn set_enabled(enabled: bool) {
    interrupts::without_interrupts(|| {
        SCHEDULER.lock().enabled = enabled;
    });
    serial_println!(
        "[SCHED] Scheduler {}",
        if enabled { "enabled" } else { "disabled" }
    );
}

/// Number of Ready + Running tasks.
pub fn task_count() -> u64 {
    interrupts::without_interrupts(|| SCHEDULER.lock().live_tasks)
}

/// Id of the task currently owning the CPU.
pub fn current_task_id() -> Option<u64> {
    interrupts::without_interrupts(|| {
        let sched = SCHEDULER.lock();
        // SAFETY: scheduler lock held; current is live.
        sched.current.map(|cur| unsafe { cur.as_ref() }.id)
    })
}

/// Exit code of the most recently terminated task.
pub fn last_exit_code() -> Option<i64> {
    interrupts::without_interrupts(|| SCHEDULER.lock().last_exit_code)
}

/// Voluntarily give up the CPU; returns when the scheduler picks this task
/// again.
pub fn yield_now() {
    interrupts::without_interrupts(schedule);
}

/// Timer-driven entry: account the tick to the running task, then rotate.
/// Called from the timer interrupt with interrupts masked.
pub fn tick() {
    {
        let mut sched = SCHEDULER.lock();
        if !sched.enabled {
            return;
        }
        if let Some(mut cur) = sched.current {
            // SAFETY: scheduler lock held; current is live.
            let cur_task = unsafe { cur.as_mut() };
            cur_task.total_runtime += 1;
            cur_task.time_slice = cur_task.time_slice.saturating_sub(1);
        }
    }
    schedule();
}

/// Round-robin rotation: requeue the running task, dispatch the queue head.
///
/// Interrupts must be masked by the caller. When a switch happens, this
/// call returns only once the suspended task is scheduled again.
pub fn schedule() {
    let mut prev_context: *mut TaskContext = core::ptr::null_mut();
    let next_context: *const TaskContext;

    {
        let mut sched = SCHEDULER.lock();
        if !sched.enabled {
            return;
        }
        reap(&mut sched);

        let current = sched.current;

        if let Some(mut cur) = current {
            // SAFETY: scheduler lock held; current is live.
            let cur_task = unsafe { cur.as_mut() };
            if cur_task.state == TaskState::Running {
                cur_task.state = TaskState::Ready;
                cur_task.time_slice = task::DEFAULT_TIME_SLICE;
                sched.queue.push_back(cur);
            }
        }

        let Some(mut next) = sched.queue.pop_front() else {
            return;
        };

        // SAFETY: scheduler lock held; the queue owns live nodes only.
        let next_task = unsafe { next.as_mut() };
        next_task.state = TaskState::Running;
        next_task.time_slice = task::DEFAULT_TIME_SLICE;
        sched.current = Some(next);

        if current == Some(next) {
            // Only one runnable task; it keeps the CPU.
            return;
        }

        install_task_stacks(next_task);

        if let Some(mut cur) = current {
            // SAFETY: the suspended task outlives its suspension; its
            // context is only touched by the switch below.
            prev_context = &mut unsafe { cur.as_mut() }.context;
        }
        next_context = &next_task.context;
    }

    // The lock is released; interrupts stay masked across the switch, so
    // nothing can observe the half-switched state.
    //
    // SAFETY:
    // next_context belongs to a live task whose stack and CR3 are valid;
    // prev_context (when non-null) outlives the suspension.
    unsafe { context_switch(prev_context, next_context) };
}

/// Terminate the current task and dispatch the next one. Never returns.
///
/// The dying task is parked in the zombie slot and reaped on a later
/// `schedule()`, once its stack is no longer in use.
pub fn exit(code: i64) -> ! {
    interrupts::disable();

    let next_context: *const TaskContext;
    {
        let mut sched = SCHEDULER.lock();

        if let Some(mut cur) = sched.current.take() {
            // SAFETY: scheduler lock held; current is live.
            let cur_task = unsafe { cur.as_mut() };
            cur_task.state = TaskState::Terminated;
            sched.queue.remove(cur);
            sched.live_tasks -= 1;
            sched.last_exit_code = Some(code);
            sched.zombie = Some(cur);
            serial_println!("[SCHED] Task {} exited with code {}", cur_task.id, code);
        }

        let Some(mut next) = sched.queue.pop_front() else {
            // Unreachable while the idle task exists; stop cleanly anyway.
            drop(sched);
            interrupts::enable();
            crate::hlt_loop();
        };

        // SAFETY: scheduler lock held.
        let next_task = unsafe { next.as_mut() };
        next_task.state = TaskState::Running;
        sched.current = Some(next);
        install_task_stacks(next_task);
        next_context = &next_task.context;
    }

    // SAFETY:
    // `from` is null: the dying flow is abandoned, its stack freed later by
    // the reaper. next_context belongs to a live task.
    unsafe { context_switch(core::ptr::null_mut(), next_context) };

    // context_switch with a null `from` cannot come back.
    crate::hlt_loop();
}

/// Hand the incoming task's kernel stack to the CPU (TSS RSP0) and to the
/// syscall entry stub.
fn install_task_stacks(task: &Task) {
    if let Some(top) = task.kernel_stack_top() {
        gdt::set_kernel_stack(top);
        syscall::set_kernel_stack(top.as_u64());
    }
}

/// Free the previously terminated task, if any. Runs under the scheduler
/// lock, strictly after the zombie's stack went out of use.
fn reap(sched: &mut Scheduler) {
    if let Some(zombie) = sched.zombie.take() {
        // SAFETY:
        // The zombie is terminated, unlinked from every list and nobody
        // holds a pointer to it; it came from Box::into_raw.
        let task = unsafe { Box::from_raw(zombie.as_ptr()) };
        // Dropping releases the address space; the stack memory itself is
        // bump-allocated and its free is a no-op.
        drop(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_task_entry() {}

    #[test_case]
    fn test_task_ids_are_unique_and_increasing() {
        let first = Task::new_kernel(noop_task_entry, 1);
        let second = Task::new_kernel(noop_task_entry, 1);
        assert!(
            second.id > first.id,
            "Task ids must increase monotonically.",
        );
    }

    #[test_case]
    fn test_ready_accounting_tracks_adds_and_removes() {
        let before = task_count();

        let id_a = spawn_kernel(noop_task_entry, 1);
        let id_b = spawn_kernel(noop_task_entry, 1);
        assert_eq!(
            task_count(),
            before + 2,
            "Two adds must raise the live count by two.",
        );

        assert!(remove_task(id_a), "A queued task must be removable.");
        assert!(remove_task(id_b), "A queued task must be removable.");
        assert_eq!(
            task_count(),
            before,
            "Removes must bring the live count back down.",
        );
    }

    #[test_case]
    fn test_removing_unknown_task_fails() {
        assert!(
            !remove_task(u64::MAX),
            "Removing a nonexistent id must fail.",
        );
    }

    #[test_case]
    fn test_fresh_task_starts_ready_with_full_slice() {
        let task = Task::new_kernel(noop_task_entry, 3);
        assert_eq!(task.state, TaskState::Ready, "Fresh tasks start Ready.");
        assert_eq!(
            task.time_slice,
            task::DEFAULT_TIME_SLICE,
            "Fresh tasks carry a full time slice.",
        );
        assert_eq!(task.priority, 3, "Priority must be recorded.");
        assert_eq!(task.total_runtime, 0, "No runtime before first dispatch.");
    }
}
