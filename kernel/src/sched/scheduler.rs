//! Priority scheduler
//!
//! Uniprocessor, preemptible on the timer tick. Highest-priority Ready task
//! wins; equal priorities round-robin through per-priority queues. Context
//! switches happen only here -- interrupt handlers just set the resched flag
//! and the outermost interrupt exit calls [`schedule`].

extern crate alloc;

use alloc::{collections::VecDeque, string::ToString, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;

use crate::{
    arch::{ArchContext, CpuContext},
    error::{KernelError, KernelResult, SchedError},
    mm::vmm::{self, AsId, KERNEL_AS},
    sched::task::{KernelStack, Pid, Task, TaskState, KERNEL_STACK_SIZE},
    sync::SpinLockIrq,
};

pub const MAX_TASKS: usize = 64;
pub const NUM_PRIORITIES: usize = 8;
pub const DEFAULT_PRIORITY: u8 = 4;
pub const DEFAULT_TIME_SLICE: u32 = 10;
pub const IDLE_PID: Pid = 0;

/// Wait channel used by the sleep queue (odd value: never a real address).
const SLEEP_CHANNEL: usize = 1;

/// Wait channel a parent blocks on until some child exits.
fn child_exit_channel(parent: Pid) -> usize {
    ((parent as usize) << 2) | 0x3
}

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

pub struct Scheduler {
    slots: Vec<Option<Task>>,
    ready: [VecDeque<Pid>; NUM_PRIORITIES],
    current: Pid,
    /// (pid, wake tick) pairs parked by nanosleep.
    sleepers: Vec<(Pid, u64)>,
}

impl Scheduler {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_TASKS);
        slots.resize_with(MAX_TASKS, || None);

        let mut sched = Self {
            slots,
            ready: core::array::from_fn(|_| VecDeque::new()),
            current: IDLE_PID,
            sleepers: Vec::new(),
        };

        // The boot flow becomes task 0, the idle task: lowest priority,
        // never queued, always a valid switch target.
        sched.slots[0] = Some(Task {
            pid: IDLE_PID,
            name: "idle".to_string(),
            state: TaskState::Running,
            priority: (NUM_PRIORITIES - 1) as u8,
            time_slice: DEFAULT_TIME_SLICE,
            runtime: 0,
            parent: None,
            first_child: None,
            next_sibling: None,
            wait_channel: 0,
            exit_code: 0,
            addr_space: KERNEL_AS,
            fd_table: 0,
            brk_start: 0,
            brk_end: 0,
            kstack: KernelStack::new(),
            context: ArchContext::new(),
            is_user: false,
        });
        sched
    }

    fn task(&self, pid: Pid) -> Option<&Task> {
        self.slots.iter().flatten().find(|t| t.pid == pid)
    }

    fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots.iter_mut().flatten().find(|t| t.pid == pid)
    }

    fn free_slot(&mut self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn enqueue(&mut self, pid: Pid) {
        if let Some(priority) = self.task(pid).map(|t| t.priority as usize) {
            self.ready[priority.min(NUM_PRIORITIES - 1)].push_back(pid);
        }
    }

    fn drop_from_queues(&mut self, pid: Pid) {
        for queue in &mut self.ready {
            queue.retain(|&p| p != pid);
        }
    }

    fn has_ready(&self) -> bool {
        self.ready.iter().any(|q| !q.is_empty())
    }

    fn pick_next(&mut self) -> Pid {
        for queue in &mut self.ready {
            while let Some(pid) = queue.pop_front() {
                if self.slots.iter().flatten().any(|t| t.pid == pid && t.state == TaskState::Ready)
                {
                    return pid;
                }
            }
        }
        IDLE_PID
    }

    fn insert(&mut self, task: Task) -> KernelResult<Pid> {
        let pid = task.pid;
        let parent = task.parent;
        let slot = self
            .free_slot()
            .ok_or(KernelError::Sched(SchedError::TooManyTasks))?;
        self.slots[slot] = Some(task);

        // Thread the new task into the parent's child list.
        if let Some(pp) = parent {
            let old_head = self.task(pp).and_then(|t| t.first_child);
            if let Some(t) = self.task_mut(pid) {
                t.next_sibling = old_head;
            }
            if let Some(t) = self.task_mut(pp) {
                t.first_child = Some(pid);
            }
        }
        self.enqueue(pid);
        Ok(pid)
    }
}

lazy_static! {
    static ref SCHEDULER: SpinLockIrq<Scheduler> = SpinLockIrq::new(Scheduler::new());
}

/// Bring the scheduler up (adopts the boot flow as the idle task).
pub fn init() {
    let pid = SCHEDULER.lock().current;
    log::info!(
        target: "sched",
        "scheduler up, {} task slots, {} KiB kernel stacks, boot flow is pid {}",
        MAX_TASKS,
        KERNEL_STACK_SIZE / 1024,
        pid
    );
}

/// Touch the scheduler from unit tests.
#[cfg(all(test, not(target_os = "none")))]
pub fn init_for_tests() {
    let _ = SCHEDULER.lock().current;
}

fn build_task(name: &str, parent: Option<Pid>, addr_space: AsId, is_user: bool) -> Task {
    Task {
        pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        name: name.to_string(),
        state: TaskState::Ready,
        priority: DEFAULT_PRIORITY,
        time_slice: DEFAULT_TIME_SLICE,
        runtime: 0,
        parent,
        first_child: None,
        next_sibling: None,
        wait_channel: 0,
        exit_code: 0,
        addr_space,
        fd_table: 0,
        brk_start: 0,
        brk_end: 0,
        kstack: KernelStack::new(),
        context: ArchContext::new(),
        is_user,
    }
}

/// Spawn a kernel thread.
pub fn spawn_kernel(name: &str, entry: extern "C" fn()) -> KernelResult<Pid> {
    let mut sched = SCHEDULER.lock();
    let parent = Some(sched.current);
    let mut task = build_task(name, parent, KERNEL_AS, false);
    let stack_top = task.kernel_stack_top();
    task.context.init(entry as usize, stack_top, false);
    sched.insert(task)
}

/// Spawn a user task entering `entry` on `user_stack` inside `space`.
pub fn spawn_user(
    name: &str,
    entry: usize,
    user_stack: usize,
    space: AsId,
) -> KernelResult<Pid> {
    let root = vmm::root_of(space)?;
    let mut sched = SCHEDULER.lock();
    let parent = Some(sched.current);
    let mut task = build_task(name, parent, space, true);
    let stack_top = task.kernel_stack_top();
    task.context.init(entry, stack_top, true);
    task.context.set_user_entry(entry, user_stack);
    task.context.set_root_table(root.as_u64());
    sched.insert(task)
}

/// Spawn the child side of fork: resumes at the parent's trap point with a
/// zero return value, inside the already-forked address space.
pub fn spawn_forked(name: &str, space: AsId, resume_ip: usize, resume_sp: usize) -> KernelResult<Pid> {
    let root = vmm::root_of(space)?;
    let mut sched = SCHEDULER.lock();
    let parent = Some(sched.current);
    let mut task = build_task(name, parent, space, true);
    let stack_top = task.kernel_stack_top();
    task.context.init(resume_ip, stack_top, true);
    task.context.set_user_entry(resume_ip, resume_sp);
    task.context.set_root_table(root.as_u64());
    task.context.set_return_value(0);
    sched.insert(task)
}

/// PID of the running task.
pub fn current_pid() -> Pid {
    SCHEDULER.lock().current
}

/// Parent PID of the running task (0 when none).
pub fn current_ppid() -> Pid {
    let sched = SCHEDULER.lock();
    let cur = sched.current;
    sched.task(cur).and_then(|t| t.parent).unwrap_or(0)
}

/// Address space of the running task.
pub fn current_address_space() -> AsId {
    let sched = SCHEDULER.lock();
    let cur = sched.current;
    sched.task(cur).map(|t| t.addr_space).unwrap_or(KERNEL_AS)
}

/// Staged user-mode entry state of the running task (ip, sp, return reg).
pub fn current_user_state() -> (usize, usize, usize) {
    let sched = SCHEDULER.lock();
    let cur = sched.current;
    sched
        .task(cur)
        .map(|t| {
            let (ip, sp) = t.context.user_entry();
            (ip, sp, t.context.return_value())
        })
        .unwrap_or((0, 0, 0))
}

/// State of an arbitrary task; `None` for unused slots.
pub fn task_state(pid: Pid) -> Option<TaskState> {
    SCHEDULER.lock().task(pid).map(|t| t.state)
}

/// Adjust a task's brk bookkeeping; returns (start, end).
pub fn with_current_brk<R>(f: impl FnOnce(&mut usize, &mut usize) -> R) -> R {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    let task = sched.task_mut(cur).expect("current task always exists");
    let mut start = task.brk_start;
    let mut end = task.brk_end;
    let r = f(&mut start, &mut end);
    task.brk_start = start;
    task.brk_end = end;
    r
}

/// Mark the current task Blocked on `chan` without switching; the caller
/// drops its locks, then calls [`schedule`]. Keeping the two steps separate
/// lets sync primitives publish the blocked state while still holding their
/// own spinlock, closing the lost-wakeup window.
pub fn prepare_block(chan: usize) {
    let mut sched = SCHEDULER.lock();
    let cur = sched.current;
    if cur == IDLE_PID {
        // The idle task must always stay runnable.
        return;
    }
    if let Some(t) = sched.task_mut(cur) {
        t.state = TaskState::Blocked;
        t.wait_channel = chan;
    }
}

/// Block the current task on `chan` and yield.
pub fn block_current(chan: usize) {
    prepare_block(chan);
    schedule();
}

/// Move a Ready task to Blocked on `chan` (drivers parking worker tasks,
/// and the test suite exercising wake paths).
pub fn block_task(pid: Pid, chan: usize) -> KernelResult<()> {
    let mut sched = SCHEDULER.lock();
    match sched.task(pid).map(|t| t.state) {
        Some(TaskState::Ready) => {
            sched.drop_from_queues(pid);
            if let Some(t) = sched.task_mut(pid) {
                t.state = TaskState::Blocked;
                t.wait_channel = chan;
            }
            Ok(())
        }
        Some(_) => Err(KernelError::Sched(SchedError::InvalidState)),
        None => Err(KernelError::TaskNotFound { pid }),
    }
}

/// Wake every task blocked on `chan`. Returns the number woken.
pub fn wakeup(chan: usize) -> usize {
    let mut sched = SCHEDULER.lock();
    let mut woken = Vec::new();
    for task in sched.slots.iter_mut().flatten() {
        if task.state == TaskState::Blocked && task.wait_channel == chan {
            task.state = TaskState::Ready;
            task.wait_channel = 0;
            woken.push(task.pid);
        }
    }
    for pid in &woken {
        sched.enqueue(*pid);
    }
    drop(sched);
    if !woken.is_empty() {
        crate::irq::request_resched();
    }
    woken.len()
}

/// Yield the CPU voluntarily.
pub fn yield_now() {
    schedule();
}

/// Park the current task until `timer::ticks()` reaches `wake_tick`.
pub fn sleep_until(wake_tick: u64) {
    {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        sched.sleepers.push((cur, wake_tick));
    }
    block_current(SLEEP_CHANNEL);
}

/// Timer-tick accounting: runtime, time-slice expiry, sleeper wakeup.
/// Runs in interrupt context; never switches directly.
pub fn on_tick(now: u64) {
    let mut sched = SCHEDULER.lock();

    // Wake expired sleepers.
    let mut due = Vec::new();
    sched.sleepers.retain(|&(pid, deadline)| {
        if deadline <= now {
            due.push(pid);
            false
        } else {
            true
        }
    });
    for pid in due {
        if let Some(t) = sched.task_mut(pid) {
            if t.state == TaskState::Blocked {
                t.state = TaskState::Ready;
                t.wait_channel = 0;
            }
        }
        sched.enqueue(pid);
    }

    // Charge the running task.
    let cur = sched.current;
    let mut expired = false;
    if let Some(t) = sched.task_mut(cur) {
        t.runtime += 1;
        t.time_slice = t.time_slice.saturating_sub(1);
        if t.time_slice == 0 {
            t.time_slice = DEFAULT_TIME_SLICE;
            expired = true;
        }
    }
    drop(sched);
    if expired {
        crate::irq::request_resched();
    }
}

/// Terminate the running task. Reclamation waits for the parent's reap.
pub fn exit_current(code: i32) -> ! {
    let parent = {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        let mut parent = None;
        if let Some(t) = sched.task_mut(cur) {
            t.state = TaskState::Terminated;
            t.exit_code = code;
            t.wait_channel = 0;
            parent = t.parent;
        }
        parent
    };
    if let Some(pp) = parent {
        wakeup(child_exit_channel(pp));
    }
    schedule();
    // A Terminated task is never picked again; reaching this line means the
    // switch machinery is gone (or this is a hosted build).
    loop {
        crate::arch::idle();
    }
}

/// Kill the running task after an unrecoverable user fault (SIGSEGV path).
pub fn kill_current() -> ! {
    exit_current(139)
}

/// Wait for a child to exit; reaps it and returns (pid, exit code).
///
/// `target` narrows the wait to one child PID.
pub fn waitpid(target: Option<Pid>) -> KernelResult<(Pid, i32)> {
    loop {
        let me = current_pid();
        let mut reaped: Option<(Pid, i32, AsId)> = None;
        {
            let mut sched = SCHEDULER.lock();
            let mut has_candidate = false;
            let mut dead: Option<Pid> = None;
            for t in sched.slots.iter().flatten() {
                if t.parent != Some(me) {
                    continue;
                }
                if let Some(want) = target {
                    if t.pid != want {
                        continue;
                    }
                }
                has_candidate = true;
                if t.state == TaskState::Terminated {
                    dead = Some(t.pid);
                    break;
                }
            }
            if !has_candidate {
                return Err(KernelError::Sched(SchedError::NotYourChild));
            }
            if let Some(pid) = dead {
                // Unlink from the child list, then clear the slot.
                let next = sched.task(pid).and_then(|t| t.next_sibling);
                if let Some(p) = sched.task_mut(me) {
                    if p.first_child == Some(pid) {
                        p.first_child = next;
                    }
                }
                let mut prev = sched.task(me).and_then(|t| t.first_child);
                while let Some(p) = prev {
                    let sib = sched.task(p).and_then(|t| t.next_sibling);
                    if sib == Some(pid) {
                        if let Some(t) = sched.task_mut(p) {
                            t.next_sibling = next;
                        }
                        break;
                    }
                    prev = sib;
                }

                let slot = sched.slots.iter().position(|s| {
                    s.as_ref().is_some_and(|t| t.pid == pid)
                });
                if let Some(i) = slot {
                    if let Some(mut t) = sched.slots[i].take() {
                        t.state = TaskState::Unused;
                        reaped = Some((t.pid, t.exit_code, t.addr_space));
                    }
                }
            }
        }
        if let Some((pid, code, space)) = reaped {
            if space != KERNEL_AS {
                vmm::destroy_address_space(space).ok();
            }
            return Ok((pid, code));
        }
        prepare_block(child_exit_channel(me));
        schedule();
    }
}

/// Pick the next task and switch to it.
///
/// Hosted builds have no CPU to give away; the scheduling decisions are
/// exercised through the state-machine API instead, and this is a no-op.
pub fn schedule() {
    #[cfg(target_os = "none")]
    schedule_inner();
}

#[cfg(target_os = "none")]
fn schedule_inner() {
    let flags = crate::arch::irq_save();
    let mut switch: Option<(*mut ArchContext, *const ArchContext)> = None;
    {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current;
        let cur_state = sched
            .task(cur)
            .map(|t| t.state)
            .unwrap_or(TaskState::Terminated);

        if cur_state == TaskState::Running && !sched.has_ready() {
            // Nothing else to run; keep the CPU. Drop the lock before
            // restoring the saved flag, or the guard re-disables on drop.
            drop(sched);
            crate::arch::irq_restore(flags);
            return;
        }

        if cur_state == TaskState::Running {
            if let Some(t) = sched.task_mut(cur) {
                t.state = TaskState::Ready;
            }
            if cur != IDLE_PID {
                sched.enqueue(cur);
            }
        }

        let next = sched.pick_next();
        if next == cur {
            if let Some(t) = sched.task_mut(cur) {
                t.state = TaskState::Running;
            }
        } else {
            let mut stack_top = 0;
            if let Some(t) = sched.task_mut(next) {
                t.state = TaskState::Running;
                stack_top = t.kernel_stack_top();
            }
            sched.current = next;
            crate::arch::context::set_kernel_stack(stack_top);
            #[cfg(target_arch = "x86_64")]
            crate::arch::x86_64::syscall::set_syscall_stack(stack_top as u64);

            let old_ptr = match cur_state {
                // A dying task's context is never resumed; skip the save.
                TaskState::Terminated => core::ptr::null_mut(),
                _ => sched
                    .task_mut(cur)
                    .map(|t| &mut t.context as *mut ArchContext)
                    .unwrap_or(core::ptr::null_mut()),
            };
            let new_ptr = sched
                .task(next)
                .map(|t| &t.context as *const ArchContext)
                .expect("picked task exists");
            switch = Some((old_ptr, new_ptr));
        }
    }

    if let Some((old, new)) = switch {
        // SAFETY: Interrupts are disabled; both pointers target context
        // structs inside the task arena, which never moves (the slot vector
        // is pre-allocated at capacity and only mutated under the lock).
        unsafe { crate::arch::context::switch_context(old, new) };
    }
    crate::arch::irq_restore(flags);
}

#[cfg(all(test, not(target_os = "none")))]
pub fn spawn_kernel_for_tests(name: &str) -> Pid {
    extern "C" fn nop_entry() {}
    spawn_kernel(name, nop_entry).expect("task slots available")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn spawn_block_wake_lifecycle() {
        init_for_tests();
        let pid = spawn_kernel_for_tests("worker");
        assert_eq!(task_state(pid), Some(TaskState::Ready));

        block_task(pid, 0x1234).expect("block a ready task");
        assert_eq!(task_state(pid), Some(TaskState::Blocked));

        // Wakeup on the wrong channel does nothing.
        assert_eq!(wakeup(0x9999), 0);
        assert_eq!(task_state(pid), Some(TaskState::Blocked));

        assert_eq!(wakeup(0x1234), 1);
        assert_eq!(task_state(pid), Some(TaskState::Ready));

        // Blocking a blocked task is an error.
        block_task(pid, 0x1).expect("block again");
        assert!(block_task(pid, 0x2).is_err());
        wakeup(0x1);
    }

    #[test]
    fn pids_are_unique_and_parented() {
        init_for_tests();
        let a = spawn_kernel_for_tests("a");
        let b = spawn_kernel_for_tests("b");
        assert_ne!(a, b);
        let sched = SCHEDULER.lock();
        let ta = sched.task(a).expect("a exists");
        assert_eq!(ta.parent, Some(sched.current));
        assert_eq!(ta.priority, DEFAULT_PRIORITY);
        assert_eq!(ta.time_slice, DEFAULT_TIME_SLICE);
    }

    #[test]
    fn boot_task_is_running_idle() {
        init_for_tests();
        assert_eq!(task_state(IDLE_PID), Some(TaskState::Running));
        assert_eq!(current_address_space(), KERNEL_AS);
    }

    #[test]
    fn tick_accounting_expires_slices() {
        init_for_tests();
        let before = {
            let sched = SCHEDULER.lock();
            let cur = sched.current;
            sched.task(cur).map(|t| t.runtime).unwrap_or(0)
        };
        for now in 0..(DEFAULT_TIME_SLICE as u64 + 1) {
            on_tick(now);
        }
        let sched = SCHEDULER.lock();
        let cur = sched.current;
        let t = sched.task(cur).expect("current");
        assert!(t.runtime >= before + DEFAULT_TIME_SLICE as u64);
    }
}
