//! x86_64 system-call entry
//!
//! Two doors into the same dispatcher: the legacy INT 0x80 gate (routed
//! through the IDT trap path) and the SYSCALL/SYSRET fast path configured
//! here. Argument registers follow the Linux convention:
//! RAX = number, RDI/RSI/RDX/R10/R8/R9 = arguments, RAX = return.

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, Star};

use crate::{
    arch::x86_64::idt::TrapFrame,
    syscall::SyscallArgs,
};

/// Extract the syscall number and arguments from a trap frame.
pub fn args_from_frame(frame: &TrapFrame) -> SyscallArgs {
    SyscallArgs {
        number: frame.rax,
        args: [
            frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9,
        ],
        extra: Some(frame as *const TrapFrame as usize),
    }
}

/// Place the dispatcher's return value where user land will see it.
pub fn set_return(frame: &mut TrapFrame, value: i64) {
    frame.rax = value as u64;
}

/// Kernel stack installed for the SYSCALL fast path. The scheduler updates
/// this alongside TSS.RSP0 on every task switch.
#[no_mangle]
static mut SYSCALL_KERNEL_STACK: u64 = 0;

/// Scratch slot for the user stack pointer across the fast path.
#[no_mangle]
static mut SYSCALL_USER_STACK: u64 = 0;

/// Record the kernel stack the fast path lands on.
pub fn set_syscall_stack(stack_top: u64) {
    // SAFETY: Word-sized store, written only with interrupts disabled in
    // the scheduler; read only inside the entry stub.
    unsafe {
        SYSCALL_KERNEL_STACK = stack_top;
    }
}

/// Argument block the fast-path stub builds on the kernel stack.
#[repr(C)]
struct RawArgs {
    number: u64,
    args: [u64; 6],
}

extern "C" fn syscall_from_fast_path(raw: &RawArgs) -> i64 {
    let args = SyscallArgs {
        number: raw.number,
        args: raw.args,
        extra: None,
    };
    crate::syscall::dispatch(&args)
}

/// SYSCALL instruction entry.
///
/// Swaps to the kernel stack, preserves the user return state (RCX = RIP,
/// R11 = RFLAGS), marshals the argument registers into a [`RawArgs`] block,
/// and SYSRETs with the result in RAX.
///
/// # Safety
///
/// Reached only via the SYSCALL instruction after [`init`] programmed the
/// MSRs.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "mov [rip + {uscratch}], rsp",
        "mov rsp, [rip + {kstack}]",
        "push rcx", // user RIP
        "push r11", // user RFLAGS
        "sub rsp, 56",
        "mov [rsp + 0], rax",
        "mov [rsp + 8], rdi",
        "mov [rsp + 16], rsi",
        "mov [rsp + 24], rdx",
        "mov [rsp + 32], r10",
        "mov [rsp + 40], r8",
        "mov [rsp + 48], r9",
        "mov rdi, rsp",
        "call {handler}",
        "add rsp, 56",
        "pop r11",
        "pop rcx",
        "mov rsp, [rip + {uscratch}]",
        "sysretq",
        kstack = sym SYSCALL_KERNEL_STACK,
        uscratch = sym SYSCALL_USER_STACK,
        handler = sym syscall_from_fast_path,
    )
}

/// Enable SYSCALL/SYSRET and point them at [`syscall_entry`].
pub fn init() {
    let selectors = crate::arch::x86_64::gdt::selectors();
    // SAFETY: MSR writes during early boot; the selectors come from the
    // GDT loaded earlier and satisfy the STAR layout constraints.
    unsafe {
        Efer::update(|flags| {
            flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS);
        });
        LStar::write(x86_64::VirtAddr::new(syscall_entry as usize as u64));
        Star::write(
            selectors.user_code,
            selectors.user_data,
            selectors.kernel_code,
            selectors.kernel_data,
        )
        .expect("GDT selector layout violates STAR constraints");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_extraction_follows_the_abi() {
        let mut frame = TrapFrame::zeroed();
        frame.rax = 0x0204; // number
        frame.rdi = 1;
        frame.rsi = 2;
        frame.rdx = 3;
        frame.r10 = 4;
        frame.r8 = 5;
        frame.r9 = 6;
        // rcx is NOT an argument register on x86_64 (clobbered by SYSCALL).
        frame.rcx = 0xDEAD;

        let args = args_from_frame(&frame);
        assert_eq!(args.number, 0x0204);
        assert_eq!(args.args, [1, 2, 3, 4, 5, 6]);
        assert!(args.extra.is_some());
    }

    #[test]
    fn return_value_lands_in_rax() {
        let mut frame = TrapFrame::zeroed();
        set_return(&mut frame, -38);
        assert_eq!(frame.rax as i64, -38);
    }
}
