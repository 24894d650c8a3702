//! AArch64 architecture support

pub mod boot;
pub mod context;
pub mod gic;
pub mod mmu;
pub mod psci;
pub mod serial;
pub mod timer;
pub mod vectors;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Save DAIF.I and mask IRQs.
pub fn irq_save_raw() -> usize {
    let daif: u64;
    // SAFETY: Reading DAIF and masking IRQs have no other side effects.
    unsafe {
        core::arch::asm!(
            "mrs {}, daif",
            "msr daifset, #2",
            out(reg) daif,
            options(nomem, nostack)
        );
    }
    ((daif & (1 << 7)) == 0) as usize
}

/// Restore the IRQ mask saved by [`irq_save_raw`].
pub fn irq_restore_raw(flags: usize) {
    if flags != 0 {
        // SAFETY: Unmasking IRQs that were unmasked before.
        unsafe {
            core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
        }
    }
}

/// Kernel stack the next user-to-kernel trap should land on.
///
/// On AArch64 EL0 traps use SP_EL1, which is simply wherever the kernel's
/// stack pointer sits when the task enters user mode; this static records
/// the value for diagnostics and for consumers sizing trap stacks.
static EXCEPTION_STACK_TOP: AtomicUsize = AtomicUsize::new(0);

pub fn set_kernel_stack(stack_top: usize) {
    EXCEPTION_STACK_TOP.store(stack_top, Ordering::Relaxed);
}

pub fn kernel_stack() -> usize {
    EXCEPTION_STACK_TOP.load(Ordering::Relaxed)
}

/// Bring up the per-CPU machinery: vector table and interrupt controller.
pub fn early_init() {
    vectors::init();
    gic::init();
}

/// Start the periodic scheduler tick.
pub fn timer_init(hz: u32) {
    timer::init(hz);
}
