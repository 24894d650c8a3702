//! Process-class syscalls (0x00xx)

use super::{errno_of, numbers::*, register, SyscallArgs};
use crate::{error::errno, mm::vmm, sched};

pub(super) fn install() {
    register(SYS_EXIT, sys_exit).ok();
    register(SYS_FORK, sys_fork).ok();
    register(SYS_WAITPID, sys_waitpid).ok();
    register(SYS_GETPID, sys_getpid).ok();
    register(SYS_GETPPID, sys_getppid).ok();
    register(SYS_SCHED_YIELD, sys_sched_yield).ok();
    // execve needs the ELF/VFS consumer and clone a shared-space task
    // model; both numbers stay unclaimed (-ENOSYS) until then.
}

fn sys_exit(args: &SyscallArgs) -> i64 {
    sched::exit_current(args.args[0] as i32)
}

fn sys_getpid(_args: &SyscallArgs) -> i64 {
    sched::current_pid() as i64
}

fn sys_getppid(_args: &SyscallArgs) -> i64 {
    sched::current_ppid() as i64
}

fn sys_sched_yield(_args: &SyscallArgs) -> i64 {
    sched::yield_now();
    0
}

/// Where the trapping user task resumes (instruction and stack pointer),
/// read back out of the arch trap frame.
fn resume_state(extra: usize) -> (usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: `extra` was produced by the INT 0x80 path and points at
        // the live trap frame on this task's kernel stack.
        let frame = unsafe { &*(extra as *const crate::arch::x86_64::idt::TrapFrame) };
        (frame.rip as usize, frame.rsp as usize)
    }
    #[cfg(target_arch = "x86")]
    {
        // SAFETY: See the x86_64 branch.
        let frame = unsafe { &*(extra as *const crate::arch::x86::idt::TrapFrame) };
        (frame.eip as usize, frame.user_esp as usize)
    }
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: See the x86_64 branch. The user stack pointer lives in
        // SP_EL0, untouched across the exception.
        let frame = unsafe { &*(extra as *const crate::arch::aarch64::vectors::TrapFrame) };
        let sp_el0: u64;
        // SAFETY: Reading SP_EL0 has no side effects.
        unsafe {
            core::arch::asm!("mrs {}, sp_el0", out(reg) sp_el0, options(nomem, nostack));
        }
        (frame.elr as usize, sp_el0 as usize)
    }
}

fn sys_fork(args: &SyscallArgs) -> i64 {
    let Some(extra) = args.extra else {
        // The SYSCALL fast path keeps no full frame; fork needs one.
        return -errno::EINVAL;
    };
    let (ip, sp) = resume_state(extra);

    let child_space = match vmm::fork_address_space(sched::current_address_space()) {
        Ok(space) => space,
        Err(e) => return errno_of(e),
    };
    match sched::spawn_forked("forked", child_space, ip, sp) {
        Ok(pid) => pid as i64,
        Err(e) => {
            vmm::destroy_address_space(child_space).ok();
            errno_of(e)
        }
    }
}

fn sys_waitpid(args: &SyscallArgs) -> i64 {
    let target = args.args[0] as i64;
    let status_ptr = args.args[1];
    let target = if target <= 0 {
        None
    } else {
        Some(target as u32)
    };
    match sched::waitpid(target) {
        Ok((pid, code)) => {
            if status_ptr != 0 {
                // POSIX wait status: normal exit in bits [8:15].
                let status = ((code & 0xFF) << 8) as i32;
                if super::copy_to_user(status_ptr, &status.to_ne_bytes()).is_err() {
                    return -errno::EFAULT;
                }
            }
            pid as i64
        }
        Err(e) => errno_of(e),
    }
}

