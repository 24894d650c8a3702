//! AArch64 translation control and TLB

use crate::mm::addr::{PhysAddr, VirtAddr};

/// Install `root` as the translation root for both halves.
///
/// The kernel half is shared by copying root entries rather than keeping a
/// separate TTBR1 hierarchy, so both base registers point at the same
/// table.
pub fn switch_space(root: PhysAddr) {
    // SAFETY: The caller hands us a valid L0 table; the barrier sequence is
    // the architectural TTBR switch recipe.
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {0}",
            "msr ttbr1_el1, {0}",
            "dsb ish",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            in(reg) root.as_u64(),
            options(nostack)
        );
    }
}

/// Read the active TTBR0 root.
pub fn read_root() -> PhysAddr {
    let ttbr0: u64;
    // SAFETY: Reading TTBR0_EL1 has no side effects.
    unsafe {
        core::arch::asm!("mrs {}, ttbr0_el1", out(reg) ttbr0, options(nomem, nostack));
    }
    PhysAddr::new(ttbr0 & 0x0000_FFFF_FFFF_F000)
}

/// Invalidate the translation for one page (all ASIDs).
pub fn flush_tlb(va: VirtAddr) {
    let page = (va.as_u64() >> 12) & 0x000F_FFFF_FFFF_FFFF;
    // SAFETY: TLB invalidation only drops cached translations.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1, {}",
            "dsb ish",
            "isb",
            in(reg) page,
            options(nostack)
        );
    }
}

/// Invalidate every translation.
pub fn flush_tlb_all() {
    // SAFETY: See flush_tlb.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            options(nomem, nostack)
        );
    }
}

/// Faulting virtual address of the last abort (FAR_EL1).
pub fn fault_addr() -> VirtAddr {
    let far: u64;
    // SAFETY: Reading FAR_EL1 has no side effects.
    unsafe {
        core::arch::asm!("mrs {}, far_el1", out(reg) far, options(nomem, nostack));
    }
    VirtAddr::new(far as usize)
}
