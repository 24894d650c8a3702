//! Task management and scheduling

pub mod scheduler;
pub mod task;

pub use scheduler::{
    block_current, block_task, current_address_space, current_pid, current_ppid,
    current_user_state, exit_current, init, kill_current, on_tick, prepare_block, schedule,
    sleep_until, spawn_forked, spawn_kernel, spawn_user, task_state, waitpid, wakeup,
    with_current_brk, yield_now, DEFAULT_PRIORITY, DEFAULT_TIME_SLICE, IDLE_PID, MAX_TASKS,
    NUM_PRIORITIES,
};
pub use task::{Pid, Task, TaskState, KERNEL_STACK_SIZE};

#[cfg(all(test, not(target_os = "none")))]
pub use scheduler::{init_for_tests, spawn_kernel_for_tests};
