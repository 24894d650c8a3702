//! Page-fault cause decoding and escalation
//!
//! Architecture trap handlers decode their error registers into a
//! [`FaultInfo`] and hand it to [`on_fault`], which runs the VMM fault
//! algorithm on the current address space and escalates unrecoverable
//! faults: user faults kill the task, kernel faults panic.

use crate::mm::addr::VirtAddr;

/// Everything the fault handler needs to know about one fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting virtual address (CR2 / FAR_EL1).
    pub addr: VirtAddr,
    /// Write access (false = read).
    pub write: bool,
    /// Instruction fetch.
    pub exec: bool,
    /// Fault raised from user mode.
    pub user: bool,
    /// A translation existed (protection fault) vs. not-present.
    pub present: bool,
    /// Reserved-bit violation (malformed PTE); never recoverable.
    pub rsvd: bool,
    /// Instruction pointer at the time of the fault.
    pub ip: usize,
}

/// Decode an x86 page-fault error code (identical on i686 and x86_64).
///
/// Error code bits (Intel SDM):
/// - bit 0 (P):  0 = not-present, 1 = protection violation
/// - bit 1 (W):  0 = read, 1 = write
/// - bit 2 (U):  0 = supervisor, 1 = user
/// - bit 3 (R):  reserved-bit violation
/// - bit 4 (I):  instruction fetch
pub fn from_x86(error_code: u64, fault_va: usize, ip: usize) -> FaultInfo {
    FaultInfo {
        addr: VirtAddr::new(fault_va),
        write: error_code & 0x2 != 0,
        exec: error_code & 0x10 != 0,
        user: error_code & 0x4 != 0,
        present: error_code & 0x1 != 0,
        rsvd: error_code & 0x8 != 0,
        ip,
    }
}

/// Decode an AArch64 data/instruction abort from ESR_EL1 + FAR_EL1.
///
/// EC (bits [31:26]) distinguishes aborts from lower EL (user) vs. same EL;
/// the DFSC low bits carry translation vs. permission status; WnR (bit 6)
/// is the write flag.
pub fn from_arm64(esr: u64, fault_va: usize, ip: usize) -> FaultInfo {
    let ec = (esr >> 26) & 0x3F;
    let dfsc = esr & 0x3F;
    // EC 0b100000/0b100100: instruction/data abort from EL0.
    let user = ec == 0b10_0000 || ec == 0b10_0100;
    let exec = ec == 0b10_0000 || ec == 0b10_0001;
    // DFSC 0b0001xx = translation fault, 0b0011xx = permission fault.
    let translation = (0x04..=0x07).contains(&dfsc);
    let permission = (0x0C..=0x0F).contains(&dfsc);
    FaultInfo {
        addr: VirtAddr::new(fault_va),
        write: esr & (1 << 6) != 0 && !exec,
        exec,
        user,
        present: permission && !translation,
        rsvd: false,
        ip,
    }
}

/// Resolve a fault on the current address space or escalate.
///
/// Called from the architecture trap handlers with interrupts disabled.
pub fn on_fault(info: FaultInfo) {
    let space = crate::sched::current_address_space();
    match crate::mm::vmm::handle_fault(space, &info) {
        Ok(()) => {}
        Err(err) if info.user => {
            log::warn!(
                target: "fault",
                "SIGSEGV pid {}: {:?} at {:#x} (ip {:#x}, {})",
                crate::sched::current_pid(),
                err,
                info.addr.as_usize(),
                info.ip,
                if info.write { "write" } else { "read" },
            );
            crate::sched::kill_current();
        }
        Err(err) => {
            panic!(
                "kernel fault at {:#x} (ip {:#x}): {}",
                info.addr.as_usize(),
                info.ip,
                err
            );
        }
    }
}
