//! Hardware abstraction layer
//!
//! One module per ISA plus the arch-neutral facets: capability table, PTE
//! formats, CPU context, and the MMU/interrupt facades the rest of the
//! kernel calls. Hosted builds (unit tests) compile the native module but
//! the privileged operations become no-ops -- there is no MMU to poke.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

pub mod caps;
pub mod context;
pub mod pte;

pub use context::{context_size, ArchContext, CpuContext};

// ---------------------------------------------------------------------------
// Interrupt flag save/restore (spinlock IRQ-save variants build on these)
// ---------------------------------------------------------------------------

/// Disable interrupts, returning the previous state for [`irq_restore`].
pub fn irq_save() -> usize {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use ::x86_64::instructions::interrupts;
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled as usize
    }
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        x86::irq_save_raw()
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        aarch64::irq_save_raw()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Restore the interrupt state captured by [`irq_save`].
pub fn irq_restore(flags: usize) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        if flags != 0 {
            ::x86_64::instructions::interrupts::enable();
        }
    }
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        x86::irq_restore_raw(flags);
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        aarch64::irq_restore_raw(flags);
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = flags;
    }
}

/// Unconditionally enable interrupts (scheduler idle loop, kthread entry).
pub fn irq_enable() {
    irq_restore(1);
}

/// Halt until the next interrupt.
pub fn idle() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::hlt();
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::halt();
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    cortex_a::asm::wfi();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

// ---------------------------------------------------------------------------
// MMU facade
// ---------------------------------------------------------------------------

/// Per-ISA MMU control: install a root table, invalidate translations, read
/// the fault address. The portable mapping operations live in
/// `crate::mm::mapper`; this facade owns everything that touches privileged
/// state, which is why hosted builds stub it out.
pub mod mmu {
    use crate::mm::addr::{PhysAddr, VirtAddr};

    /// Install `root` as the active translation root (CR3 / TTBR0+TTBR1).
    pub fn switch_space(root: PhysAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        super::x86_64::mmu::switch_space(root);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        super::x86::mmu::switch_space(root);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        super::aarch64::mmu::switch_space(root);
        #[cfg(not(target_os = "none"))]
        let _ = root;
    }

    /// Invalidate the translation for one page.
    pub fn flush_tlb(va: VirtAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        super::x86_64::mmu::flush_tlb(va);
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        super::x86::mmu::flush_tlb(va);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        super::aarch64::mmu::flush_tlb(va);
        #[cfg(not(target_os = "none"))]
        let _ = va;
    }

    /// Invalidate every non-global translation.
    pub fn flush_tlb_all() {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        super::x86_64::mmu::flush_tlb_all();
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        super::x86::mmu::flush_tlb_all();
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        super::aarch64::mmu::flush_tlb_all();
    }

    /// Faulting virtual address of the most recent fault (CR2 / FAR_EL1).
    pub fn fault_addr() -> VirtAddr {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            super::x86_64::mmu::fault_addr()
        }
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            super::x86::mmu::fault_addr()
        }
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            super::aarch64::mmu::fault_addr()
        }
        #[cfg(not(target_os = "none"))]
        {
            VirtAddr::INVALID
        }
    }
}

// ---------------------------------------------------------------------------
// Power control
// ---------------------------------------------------------------------------

/// Reboot the machine (keyboard-controller pulse / PSCI SYSTEM_RESET).
pub fn reboot() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::reboot();
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::reboot();
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    aarch64::psci::system_reset();
    #[allow(unreachable_code)]
    loop {
        idle();
    }
}

/// Power the machine off (ACPI shutdown is a consumer concern on x86; the
/// QEMU debug exit port covers development, PSCI covers ARM64).
pub fn poweroff() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::poweroff();
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    x86::poweroff();
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    aarch64::psci::system_off();
    #[allow(unreachable_code)]
    loop {
        idle();
    }
}
