//! AArch64 exception vector table and trap entry
//!
//! All used vectors funnel into one register-file save and a single Rust
//! dispatcher; unused ones (SP0, AArch32, FIQ, SError) hang loudly so a
//! misconfigured DAIF shows up immediately.

#[cfg(target_os = "none")]
use core::arch::global_asm;

use crate::{arch::aarch64::gic, syscall::SyscallArgs};

/// Register file captured on every exception.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub x: [u64; 31],
    pub elr: u64,
    pub spsr: u64,
    pub _pad: u64,
}

impl TrapFrame {
    pub fn zeroed() -> Self {
        // SAFETY: TrapFrame is plain-old-data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    pub fn from_user(&self) -> bool {
        // SPSR.M[3:0] == 0 means EL0t.
        self.spsr & 0xF == 0
    }
}

#[cfg(target_os = "none")]
global_asm!(
    r#"
.macro VECTOR handler
    .align 7
    b \handler
.endm

.macro TRAP_SAVE
    sub sp, sp, #272
    stp x0, x1, [sp, #16 * 0]
    stp x2, x3, [sp, #16 * 1]
    stp x4, x5, [sp, #16 * 2]
    stp x6, x7, [sp, #16 * 3]
    stp x8, x9, [sp, #16 * 4]
    stp x10, x11, [sp, #16 * 5]
    stp x12, x13, [sp, #16 * 6]
    stp x14, x15, [sp, #16 * 7]
    stp x16, x17, [sp, #16 * 8]
    stp x18, x19, [sp, #16 * 9]
    stp x20, x21, [sp, #16 * 10]
    stp x22, x23, [sp, #16 * 11]
    stp x24, x25, [sp, #16 * 12]
    stp x26, x27, [sp, #16 * 13]
    stp x28, x29, [sp, #16 * 14]
    mrs x9, elr_el1
    stp x30, x9, [sp, #16 * 15]
    mrs x9, spsr_el1
    stp x9, xzr, [sp, #16 * 16]
.endm

.macro TRAP_RESTORE
    ldp x9, xzr, [sp, #16 * 16]
    msr spsr_el1, x9
    ldp x30, x9, [sp, #16 * 15]
    msr elr_el1, x9
    ldp x28, x29, [sp, #16 * 14]
    ldp x26, x27, [sp, #16 * 13]
    ldp x24, x25, [sp, #16 * 12]
    ldp x22, x23, [sp, #16 * 11]
    ldp x20, x21, [sp, #16 * 10]
    ldp x18, x19, [sp, #16 * 9]
    ldp x16, x17, [sp, #16 * 8]
    ldp x14, x15, [sp, #16 * 7]
    ldp x12, x13, [sp, #16 * 6]
    ldp x10, x11, [sp, #16 * 5]
    ldp x8, x9, [sp, #16 * 4]
    ldp x6, x7, [sp, #16 * 3]
    ldp x4, x5, [sp, #16 * 2]
    ldp x2, x3, [sp, #16 * 1]
    ldp x0, x1, [sp, #16 * 0]
    add sp, sp, #272
.endm

.align 11
.global exception_vectors
exception_vectors:
    // Current EL, SP_EL0 (never used: the kernel runs on SP_ELx)
    VECTOR vector_hang
    VECTOR vector_hang
    VECTOR vector_hang
    VECTOR vector_hang
    // Current EL, SP_ELx
    VECTOR el1_sync_entry
    VECTOR el1_irq_entry
    VECTOR vector_hang
    VECTOR vector_hang
    // Lower EL, AArch64
    VECTOR el0_sync_entry
    VECTOR el0_irq_entry
    VECTOR vector_hang
    VECTOR vector_hang
    // Lower EL, AArch32 (unsupported)
    VECTOR vector_hang
    VECTOR vector_hang
    VECTOR vector_hang
    VECTOR vector_hang

vector_hang:
    wfe
    b vector_hang

el1_sync_entry:
    TRAP_SAVE
    mov x0, sp
    bl aarch64_sync_exception
    TRAP_RESTORE
    eret

el0_sync_entry:
    TRAP_SAVE
    mov x0, sp
    bl aarch64_sync_exception
    TRAP_RESTORE
    eret

el1_irq_entry:
    TRAP_SAVE
    mov x0, sp
    bl aarch64_irq_exception
    TRAP_RESTORE
    eret

el0_irq_entry:
    TRAP_SAVE
    mov x0, sp
    bl aarch64_irq_exception
    TRAP_RESTORE
    eret
"#
);

#[cfg(target_os = "none")]
extern "C" {
    static exception_vectors: u8;
}

/// Point VBAR_EL1 at the vector table.
#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: The table above is 2 KiB aligned and permanently mapped.
    unsafe {
        let base = &exception_vectors as *const u8 as u64;
        core::arch::asm!("msr vbar_el1, {}", "isb", in(reg) base, options(nostack));
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}

fn read_esr() -> u64 {
    let esr: u64;
    // SAFETY: Reading ESR_EL1 has no side effects.
    unsafe {
        core::arch::asm!("mrs {}, esr_el1", out(reg) esr, options(nomem, nostack));
    }
    esr
}

/// Synchronous exception dispatch: SVC (syscall), aborts (page fault),
/// everything else panics.
#[no_mangle]
extern "C" fn aarch64_sync_exception(frame: &mut TrapFrame) {
    let esr = read_esr();
    let ec = (esr >> 26) & 0x3F;
    match ec {
        // SVC from AArch64: X8 carries the number, X0-X5 the arguments.
        0x15 => {
            let args = SyscallArgs {
                number: frame.x[8],
                args: [
                    frame.x[0], frame.x[1], frame.x[2], frame.x[3], frame.x[4], frame.x[5],
                ],
                extra: Some(frame as *const TrapFrame as usize),
            };
            frame.x[0] = crate::syscall::dispatch(&args) as u64;
        }
        // Instruction/data aborts from either EL.
        0x20 | 0x21 | 0x24 | 0x25 => {
            let info = crate::mm::fault::from_arm64(
                esr,
                crate::arch::aarch64::mmu::fault_addr().as_usize(),
                frame.elr as usize,
            );
            crate::mm::fault::on_fault(info);
        }
        _ => {
            panic!(
                "unhandled sync exception: EC {:#x}, ESR {:#x}, ELR {:#x}",
                ec, esr, frame.elr
            );
        }
    }
}

/// IRQ dispatch: acknowledge at the GIC, run the registered handler, EOI.
#[no_mangle]
extern "C" fn aarch64_irq_exception(_frame: &mut TrapFrame) {
    let intid = gic::acknowledge();
    if intid == gic::SPURIOUS {
        return;
    }
    crate::irq::dispatch_physical(intid);
    gic::eoi(intid);
}
