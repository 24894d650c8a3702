//! x86_64 CPU context and context switch

use crate::arch::context::CpuContext;

/// Callee-saved register state plus the resume point.
///
/// Field order is load-bearing: `context_switch` addresses the struct with
/// hard-coded offsets.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct X64Context {
    pub rbx: u64,      // 0x00
    pub rbp: u64,      // 0x08
    pub r12: u64,      // 0x10
    pub r13: u64,      // 0x18
    pub r14: u64,      // 0x20
    pub r15: u64,      // 0x28
    pub rsp: u64,      // 0x30
    pub rip: u64,      // 0x38
    pub rflags: u64,   // 0x40
    pub cr3: u64,      // 0x48
    /// Syscall/fork return value staged for user re-entry.
    pub rax: u64,      // 0x50
    pub user_rip: u64, // 0x58
    pub user_rsp: u64, // 0x60
}

impl CpuContext for X64Context {
    fn new() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0x2,
            cr3: 0,
            rax: 0,
            user_rip: 0,
            user_rsp: 0,
        }
    }

    fn init(&mut self, entry: usize, stack_top: usize, is_user: bool) {
        let first = if is_user {
            user_entry_thunk as usize
        } else {
            entry
        };
        if is_user {
            self.user_rip = entry as u64;
        }

        // The trampoline pops the real entry off the stack and enables
        // interrupts; a second slot catches the entry function returning.
        let sp = (stack_top - 16) as *mut u64;
        // SAFETY: The caller owns `stack_top` and guarantees at least two
        // free slots below it.
        unsafe {
            sp.write(first as u64);
            sp.add(1).write(kthread_exit as usize as u64);
        }
        self.rsp = sp as u64;
        self.rip = kthread_trampoline as usize as u64;
        self.rflags = 0x2; // IF off until the trampoline runs sti
    }

    fn instruction_pointer(&self) -> usize {
        self.rip as usize
    }

    fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    fn set_return_value(&mut self, value: usize) {
        self.rax = value as u64;
    }

    fn return_value(&self) -> usize {
        self.rax as usize
    }

    fn set_root_table(&mut self, root: u64) {
        self.cr3 = root;
    }

    fn set_user_entry(&mut self, entry: usize, user_stack: usize) {
        self.user_rip = entry as u64;
        self.user_rsp = user_stack as u64;
    }

    fn user_entry(&self) -> (usize, usize) {
        (self.user_rip as usize, self.user_rsp as usize)
    }
}

/// First instructions of every kernel thread: enable interrupts, then pop
/// the real entry point off the stack and jump to it.
#[unsafe(naked)]
pub unsafe extern "C" fn kthread_trampoline() {
    core::arch::naked_asm!("sti", "ret")
}

/// Return target for kernel-thread entry functions.
extern "C" fn kthread_exit() -> ! {
    crate::sched::exit_current(0)
}

/// Kernel-side entry of user tasks: fetch the staged user state from the
/// current task and drop to Ring 3.
extern "C" fn user_entry_thunk() -> ! {
    let (rip, rsp, rax) = crate::sched::current_user_state();
    // SAFETY: The scheduler staged a valid user entry; enter_user never
    // returns.
    unsafe { enter_user(rip, rsp, rax) }
}

/// Drop to user mode via IRETQ with the Ring 3 selectors from the GDT
/// (CS=0x33, SS=0x2B), interrupts enabled, and `rax` carrying the staged
/// return value (0 for a forked child).
///
/// # Safety
///
/// `rip`/`rsp` must be mapped user addresses in the current space.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user(rip: usize, rsp: usize, rax: usize) -> ! {
    core::arch::naked_asm!(
        "push 0x2B",   // user SS
        "push rsi",    // user RSP
        "push 0x202",  // RFLAGS: IF set
        "push 0x33",   // user CS
        "push rdi",    // user RIP
        "mov rax, rdx",
        "xor ebx, ebx", // no kernel values leak into user registers
        "xor ecx, ecx",
        "xor edx, edx",
        "xor esi, esi",
        "xor edi, edi",
        "xor ebp, ebp",
        "iretq",
    )
}

/// Switch from `old` to `new`.
///
/// Saves callee-saved registers, the stack pointer, the return address, and
/// RFLAGS into `old` (skipped when null), then restores `new` -- including
/// CR3 when the target context carries a different root.
///
/// # Safety
///
/// Interrupts must be disabled. `new` must hold state produced by `init`
/// or a previous save through this function.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut X64Context, new: *const X64Context) {
    core::arch::naked_asm!(
        "test rdi, rdi",
        "jz 2f",
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        "lea rax, [rsp + 8]", // rsp as it will be after our return
        "mov [rdi + 0x30], rax",
        "mov rax, [rsp]", // return address becomes the resume rip
        "mov [rdi + 0x38], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x40], rax",
        "mov rax, cr3",
        "mov [rdi + 0x48], rax",
        "2:",
        "mov rax, [rsi + 0x48]", // target cr3, if it differs
        "test rax, rax",
        "jz 3f",
        "mov rcx, cr3",
        "cmp rax, rcx",
        "je 3f",
        "mov cr3, rax",
        "3:",
        "mov rbx, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov r12, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r14, [rsi + 0x20]",
        "mov r15, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "push qword ptr [rsi + 0x40]",
        "popfq",
        "jmp qword ptr [rsi + 0x38]",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_builds_a_resumable_kernel_context() {
        extern "C" fn entry() {}

        let mut stack = alloc::vec![0u8; 4096];
        let top = (stack.as_mut_ptr() as usize + 4096) & !0xF;

        let mut ctx = X64Context::new();
        ctx.init(entry as usize, top, false);

        assert_eq!(ctx.instruction_pointer(), kthread_trampoline as usize);
        assert_eq!(ctx.stack_pointer(), top - 16);
        // The entry sits where the trampoline's ret will pop it.
        let slot = unsafe { *((top - 16) as *const u64) };
        assert_eq!(slot as usize, entry as usize);
        // Interrupts stay off until the trampoline runs.
        assert_eq!(ctx.rflags & 0x200, 0);
    }

    #[test]
    fn user_context_routes_through_the_thunk() {
        let mut stack = alloc::vec![0u8; 4096];
        let top = (stack.as_mut_ptr() as usize + 4096) & !0xF;

        let mut ctx = X64Context::new();
        ctx.init(0x40_1000, top, true);
        ctx.set_user_entry(0x40_1000, 0x7FFF_F000);
        ctx.set_return_value(0);

        assert_eq!(ctx.user_entry(), (0x40_1000, 0x7FFF_F000));
        let slot = unsafe { *((top - 16) as *const u64) };
        assert_eq!(slot as usize, user_entry_thunk as usize);
    }
}
