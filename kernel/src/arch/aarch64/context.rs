//! AArch64 CPU context and context switch

use crate::arch::context::CpuContext;

/// Callee-saved register state plus the resume point.
///
/// Field order is load-bearing: `context_switch` addresses the struct with
/// hard-coded offsets (x19..x28 pairs at 0x00-0x48, fp/lr at 0x50/0x58,
/// sp at 0x60, ttbr0 at 0x68).
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Arm64Context {
    pub x19: u64, // 0x00
    pub x20: u64, // 0x08
    pub x21: u64, // 0x10
    pub x22: u64, // 0x18
    pub x23: u64, // 0x20
    pub x24: u64, // 0x28
    pub x25: u64, // 0x30
    pub x26: u64, // 0x38
    pub x27: u64, // 0x40
    pub x28: u64, // 0x48
    pub fp: u64,  // 0x50 (x29)
    pub lr: u64,  // 0x58 (x30, the resume pc)
    pub sp: u64,  // 0x60
    pub ttbr0: u64, // 0x68
    /// Syscall/fork return value staged for user re-entry.
    pub x0: u64, // 0x70
    pub user_pc: u64, // 0x78
    pub user_sp: u64, // 0x80
}

impl CpuContext for Arm64Context {
    fn new() -> Self {
        Self {
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
            sp: 0,
            ttbr0: 0,
            x0: 0,
            user_pc: 0,
            user_sp: 0,
        }
    }

    fn init(&mut self, entry: usize, stack_top: usize, is_user: bool) {
        let first = if is_user {
            user_entry_thunk as usize
        } else {
            entry
        };
        if is_user {
            self.user_pc = entry as u64;
        }

        // The trampoline unmasks interrupts, then branches to the entry
        // staged in x19 with the exit shim in x30.
        self.x19 = first as u64;
        self.lr = kthread_trampoline as usize as u64;
        self.sp = (stack_top & !0xF) as u64;
    }

    fn instruction_pointer(&self) -> usize {
        self.lr as usize
    }

    fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    fn set_return_value(&mut self, value: usize) {
        self.x0 = value as u64;
    }

    fn return_value(&self) -> usize {
        self.x0 as usize
    }

    fn set_root_table(&mut self, root: u64) {
        self.ttbr0 = root;
    }

    fn set_user_entry(&mut self, entry: usize, user_stack: usize) {
        self.user_pc = entry as u64;
        self.user_sp = user_stack as u64;
    }

    fn user_entry(&self) -> (usize, usize) {
        (self.user_pc as usize, self.user_sp as usize)
    }
}

/// First instructions of every kernel thread: unmask IRQs, branch to the
/// entry staged in x19 with the exit shim as the return address.
#[unsafe(naked)]
pub unsafe extern "C" fn kthread_trampoline() {
    core::arch::naked_asm!(
        "msr daifclr, #2",
        "adrp x30, {exit}",
        "add x30, x30, :lo12:{exit}",
        "br x19",
        exit = sym kthread_exit,
    )
}

/// Return target for kernel-thread entry functions.
extern "C" fn kthread_exit() -> ! {
    crate::sched::exit_current(0)
}

/// Kernel-side entry of user tasks.
extern "C" fn user_entry_thunk() -> ! {
    let (pc, sp, x0) = crate::sched::current_user_state();
    // SAFETY: The scheduler staged a valid user entry.
    unsafe { enter_user(pc, sp, x0) }
}

/// Drop to EL0 via ERET: ELR = entry, SPSR = EL0t with interrupts enabled,
/// SP_EL0 = user stack, x0 = staged return value.
///
/// # Safety
///
/// `pc`/`sp` must be mapped user addresses in the current space.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user(pc: usize, sp: usize, x0: usize) -> ! {
    core::arch::naked_asm!(
        "msr elr_el1, x0",
        "msr sp_el0, x1",
        "msr spsr_el1, xzr", // EL0t, DAIF clear
        "mov x0, x2",
        "mov x1, xzr",
        "mov x2, xzr",
        "mov x29, xzr",
        "mov x30, xzr",
        "eret",
    )
}

/// Switch from `old` (x0, may be null) to `new` (x1).
///
/// # Safety
///
/// Interrupts must be masked. `new` must hold state produced by `init` or
/// a previous save through this function.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut Arm64Context, new: *const Arm64Context) {
    core::arch::naked_asm!(
        "cbz x0, 2f",
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "mrs x9, ttbr0_el1",
        "str x9, [x0, #0x68]",
        "2:",
        "ldr x9, [x1, #0x68]", // target ttbr0, if it differs
        "cbz x9, 3f",
        "mrs x10, ttbr0_el1",
        "cmp x9, x10",
        "b.eq 3f",
        "msr ttbr0_el1, x9",
        "msr ttbr1_el1, x9",
        "dsb ish",
        "tlbi vmalle1",
        "dsb ish",
        "isb",
        "3:",
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ret",
    )
}
