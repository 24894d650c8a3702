//! Task control block

extern crate alloc;

use alloc::{boxed::Box, string::String};

use crate::{arch::ArchContext, mm::vmm::AsId};

pub type Pid = u32;

/// Task lifecycle.
///
/// `Unused` exists only transiently while a slot is being recycled; empty
/// arena slots simply hold no task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// Kernel stack size per task.
pub const KERNEL_STACK_SIZE: usize = 8192;

/// Owned, aligned kernel stack.
#[repr(C, align(16))]
pub struct KernelStack(pub [u8; KERNEL_STACK_SIZE]);

impl KernelStack {
    pub fn new() -> Box<Self> {
        // A zeroed box keeps the allocation off the stack of the spawner.
        let mut stack = Box::<Self>::new_uninit();
        // SAFETY: Any byte pattern is a valid KernelStack; zeroing is
        // initialization enough.
        unsafe {
            core::ptr::write_bytes(stack.as_mut_ptr(), 0, 1);
            stack.assume_init()
        }
    }

    /// Highest usable address (stacks grow down).
    pub fn top(&self) -> usize {
        self.0.as_ptr() as usize + KERNEL_STACK_SIZE
    }
}

/// Task control block.
pub struct Task {
    pub pid: Pid,
    pub name: String,
    pub state: TaskState,
    /// 0 is the highest priority.
    pub priority: u8,
    /// Ticks left in the current slice.
    pub time_slice: u32,
    /// Cumulative ticks spent running.
    pub runtime: u64,
    pub parent: Option<Pid>,
    pub first_child: Option<Pid>,
    pub next_sibling: Option<Pid>,
    /// Rendezvous key while Blocked; 0 when runnable.
    pub wait_channel: usize,
    pub exit_code: i32,
    /// Index handle of the owned address space (the kernel space for
    /// kernel threads; owned and destroyed on reap otherwise).
    pub addr_space: AsId,
    /// Opaque token owned by the VFS consumer.
    pub fd_table: usize,
    /// Program break range for the brk syscall (user tasks).
    pub brk_start: usize,
    pub brk_end: usize,
    pub kstack: Box<KernelStack>,
    pub context: ArchContext,
    pub is_user: bool,
}

impl Task {
    pub fn kernel_stack_top(&self) -> usize {
        self.kstack.top()
    }
}
