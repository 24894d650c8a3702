//! AArch64 entry point
//!
//! QEMU's loader (or a stage-1 bootloader) jumps here with the DTB pointer
//! in X0. Secondary cores are parked (uniprocessor design); the boot core
//! gets a static stack, clears BSS, and enters the Rust kernel.

#[cfg(target_os = "none")]
use core::arch::global_asm;

#[cfg(target_os = "none")]
global_asm!(
    r#"
.section .text.boot, "ax"
.global _start
_start:
    // Park everything but core 0.
    mrs x1, mpidr_el1
    and x1, x1, #3
    cbz x1, 2f
1:  wfe
    b 1b

2:  // Boot stack, then clear BSS.
    adrp x1, __boot_stack_top
    add x1, x1, :lo12:__boot_stack_top
    mov sp, x1

    adrp x1, __bss_start
    add x1, x1, :lo12:__bss_start
    adrp x2, __bss_end
    add x2, x2, :lo12:__bss_end
3:  cmp x1, x2
    b.hs 4f
    str xzr, [x1], #8
    b 3b

4:  // x0 still holds the DTB pointer.
    bl aarch64_boot

5:  wfe
    b 5b

.section .bss.boot, "aw", %nobits
.align 16
__boot_stack:
    .skip 0x8000
__boot_stack_top:
"#
);

/// Rust side of the boot path: install the vector table, then hand the DTB
/// pointer to the arch-independent kernel entry.
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn aarch64_boot(dtb: usize) -> ! {
    super::vectors::init();
    crate::kernel_main(dtb)
}
