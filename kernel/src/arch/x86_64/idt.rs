//! Interrupt Descriptor Table and trap entry
//!
//! All vectors funnel through naked stubs into one common frame builder, so
//! the kernel sees a single [`TrapFrame`] layout for exceptions, external
//! interrupts, and the legacy INT 0x80 syscall gate.

// Descriptor fields are written for the CPU, not read back by Rust.
#![allow(dead_code)]

use core::mem::size_of;

use x86_64::instructions::tables::lidt;

use crate::arch::x86_64::pic;

/// Register file captured on every trap.
///
/// Layout mirrors the push order in `trap_common` followed by the stub's
/// vector/error pushes and the hardware frame.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// An empty frame (tests and the syscall fast path build on this).
    pub fn zeroed() -> Self {
        // SAFETY: TrapFrame is plain-old-data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 3
    }
}

// ---------------------------------------------------------------------------
// Descriptor table
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn gate(handler: usize, type_attr: u8, ist: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: crate::arch::x86_64::gdt::selectors().kernel_code.0,
            ist,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

/// Ring 0 interrupt gate (IF cleared on entry).
const GATE_KERNEL: u8 = 0x8E;
/// Ring 3 callable interrupt gate for INT 0x80.
const GATE_USER: u8 = 0xEE;

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

macro_rules! trap_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0", // no hardware error code
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym trap_common,
            )
        }
    };
    ($name:ident, $vec:expr, err) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {vec}",
                "jmp {common}",
                vec = const $vec,
                common = sym trap_common,
            )
        }
    };
}

trap_stub!(stub_de, 0); // divide error
trap_stub!(stub_db, 1); // debug
trap_stub!(stub_nmi, 2);
trap_stub!(stub_bp, 3); // breakpoint
trap_stub!(stub_of, 4);
trap_stub!(stub_br, 5);
trap_stub!(stub_ud, 6); // invalid opcode
trap_stub!(stub_nm, 7); // device not available
trap_stub!(stub_df, 8, err); // double fault
trap_stub!(stub_ts, 10, err);
trap_stub!(stub_np, 11, err);
trap_stub!(stub_ss, 12, err);
trap_stub!(stub_gp, 13, err); // general protection
trap_stub!(stub_pf, 14, err); // page fault
trap_stub!(stub_mf, 16);
trap_stub!(stub_ac, 17, err);
trap_stub!(stub_mc, 18);
trap_stub!(stub_xm, 19);

trap_stub!(stub_irq0, 0x20);
trap_stub!(stub_irq1, 0x21);
trap_stub!(stub_irq2, 0x22);
trap_stub!(stub_irq3, 0x23);
trap_stub!(stub_irq4, 0x24);
trap_stub!(stub_irq5, 0x25);
trap_stub!(stub_irq6, 0x26);
trap_stub!(stub_irq7, 0x27);
trap_stub!(stub_irq8, 0x28);
trap_stub!(stub_irq9, 0x29);
trap_stub!(stub_irq10, 0x2A);
trap_stub!(stub_irq11, 0x2B);
trap_stub!(stub_irq12, 0x2C);
trap_stub!(stub_irq13, 0x2D);
trap_stub!(stub_irq14, 0x2E);
trap_stub!(stub_irq15, 0x2F);

trap_stub!(stub_syscall, 0x80);

/// Common trap path: capture the register file, hand a `&mut TrapFrame` to
/// the Rust handler, restore, and IRETQ.
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "add rsp, 16", // vector + error code
        "iretq",
        handler = sym trap_handler,
    )
}

/// Rust-side trap dispatch.
extern "C" fn trap_handler(frame: &mut TrapFrame) {
    match frame.vector {
        14 => {
            let info = crate::mm::fault::from_x86(
                frame.error_code,
                crate::arch::x86_64::mmu::fault_addr().as_usize(),
                frame.rip as usize,
            );
            crate::mm::fault::on_fault(info);
        }
        0x20..=0x2F => {
            let line = (frame.vector - 0x20) as u32;
            crate::irq::dispatch_physical(line);
            pic::eoi(line as u8);
        }
        0x80 => {
            let args = crate::arch::x86_64::syscall::args_from_frame(frame);
            let ret = crate::syscall::dispatch(&args);
            crate::arch::x86_64::syscall::set_return(frame, ret);
        }
        vec => {
            panic!(
                "unhandled exception {} (error {:#x}) at {:#x}, rsp {:#x}",
                vec, frame.error_code, frame.rip, frame.rsp
            );
        }
    }
}

/// Build and load the IDT.
pub fn init() {
    // SAFETY: Single-threaded early boot; nothing reads the IDT until lidt.
    unsafe {
        let idt = &mut *(&raw mut IDT);
        idt[0] = IdtEntry::gate(stub_de as usize, GATE_KERNEL, 0);
        idt[1] = IdtEntry::gate(stub_db as usize, GATE_KERNEL, 0);
        idt[2] = IdtEntry::gate(stub_nmi as usize, GATE_KERNEL, 0);
        idt[3] = IdtEntry::gate(stub_bp as usize, GATE_KERNEL, 0);
        idt[4] = IdtEntry::gate(stub_of as usize, GATE_KERNEL, 0);
        idt[5] = IdtEntry::gate(stub_br as usize, GATE_KERNEL, 0);
        idt[6] = IdtEntry::gate(stub_ud as usize, GATE_KERNEL, 0);
        idt[7] = IdtEntry::gate(stub_nm as usize, GATE_KERNEL, 0);
        idt[8] = IdtEntry::gate(
            stub_df as usize,
            GATE_KERNEL,
            crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX as u8 + 1,
        );
        idt[10] = IdtEntry::gate(stub_ts as usize, GATE_KERNEL, 0);
        idt[11] = IdtEntry::gate(stub_np as usize, GATE_KERNEL, 0);
        idt[12] = IdtEntry::gate(stub_ss as usize, GATE_KERNEL, 0);
        idt[13] = IdtEntry::gate(stub_gp as usize, GATE_KERNEL, 0);
        idt[14] = IdtEntry::gate(stub_pf as usize, GATE_KERNEL, 0);
        idt[16] = IdtEntry::gate(stub_mf as usize, GATE_KERNEL, 0);
        idt[17] = IdtEntry::gate(stub_ac as usize, GATE_KERNEL, 0);
        idt[18] = IdtEntry::gate(stub_mc as usize, GATE_KERNEL, 0);
        idt[19] = IdtEntry::gate(stub_xm as usize, GATE_KERNEL, 0);

        let irq_stubs: [usize; 16] = [
            stub_irq0 as usize,
            stub_irq1 as usize,
            stub_irq2 as usize,
            stub_irq3 as usize,
            stub_irq4 as usize,
            stub_irq5 as usize,
            stub_irq6 as usize,
            stub_irq7 as usize,
            stub_irq8 as usize,
            stub_irq9 as usize,
            stub_irq10 as usize,
            stub_irq11 as usize,
            stub_irq12 as usize,
            stub_irq13 as usize,
            stub_irq14 as usize,
            stub_irq15 as usize,
        ];
        for (i, stub) in irq_stubs.iter().enumerate() {
            idt[0x20 + i] = IdtEntry::gate(*stub, GATE_KERNEL, 0);
        }

        idt[0x80] = IdtEntry::gate(stub_syscall as usize, GATE_USER, 0);

        let descriptor = x86_64::structures::DescriptorTablePointer {
            limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: x86_64::VirtAddr::new(&raw const IDT as u64),
        };
        lidt(&descriptor);
    }
}
