//! i686 IDT and trap entry

// Descriptor fields are written for the CPU, not read back by Rust.
#![allow(dead_code)]

use core::mem::size_of;

use crate::arch::x86::{gdt, pic};

/// Register file captured on every trap (PUSHA order plus the stub's
/// vector/error pushes and the hardware frame).
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only present on Ring 3 -> Ring 0 transitions.
    pub user_esp: u32,
    pub user_ss: u32,
}

impl TrapFrame {
    pub fn zeroed() -> Self {
        // SAFETY: TrapFrame is plain-old-data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    pub fn from_user(&self) -> bool {
        self.cs & 0x3 == 3
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn gate(handler: usize, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: gdt::KERNEL_CS,
            zero: 0,
            type_attr,
            offset_high: (handler >> 16) as u16,
        }
    }
}

const GATE_KERNEL: u8 = 0x8E;
const GATE_USER: u8 = 0xEE;

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

macro_rules! trap_stub {
    ($name:ident, $vec:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
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

trap_stub!(stub_de, 0);
trap_stub!(stub_db, 1);
trap_stub!(stub_nmi, 2);
trap_stub!(stub_bp, 3);
trap_stub!(stub_of, 4);
trap_stub!(stub_br, 5);
trap_stub!(stub_ud, 6);
trap_stub!(stub_nm, 7);
trap_stub!(stub_df, 8, err);
trap_stub!(stub_ts, 10, err);
trap_stub!(stub_np, 11, err);
trap_stub!(stub_ss, 12, err);
trap_stub!(stub_gp, 13, err);
trap_stub!(stub_pf, 14, err);
trap_stub!(stub_mf, 16);
trap_stub!(stub_ac, 17, err);

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

#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "pusha",
        "push esp",
        "call {handler}",
        "add esp, 4",
        "popa",
        "add esp, 8", // vector + error code
        "iretd",
        handler = sym trap_handler,
    )
}

extern "C" fn trap_handler(frame: &mut TrapFrame) {
    match frame.vector {
        14 => {
            let info = crate::mm::fault::from_x86(
                frame.error_code as u64,
                crate::arch::x86::mmu::fault_addr().as_usize(),
                frame.eip as usize,
            );
            crate::mm::fault::on_fault(info);
        }
        0x20..=0x2F => {
            let line = frame.vector - 0x20;
            crate::irq::dispatch_physical(line);
            pic::eoi(line as u8);
        }
        0x80 => {
            let args = crate::arch::x86::syscall::args_from_frame(frame);
            let ret = crate::syscall::dispatch(&args);
            crate::arch::x86::syscall::set_return(frame, ret);
        }
        vec => {
            panic!(
                "unhandled exception {} (error {:#x}) at {:#x}",
                vec, frame.error_code, frame.eip
            );
        }
    }
}

/// Build and load the IDT.
pub fn init() {
    // SAFETY: Single-threaded early boot; nothing reads the IDT until lidt.
    unsafe {
        let idt = &mut *(&raw mut IDT);
        idt[0] = IdtEntry::gate(stub_de as usize, GATE_KERNEL);
        idt[1] = IdtEntry::gate(stub_db as usize, GATE_KERNEL);
        idt[2] = IdtEntry::gate(stub_nmi as usize, GATE_KERNEL);
        idt[3] = IdtEntry::gate(stub_bp as usize, GATE_KERNEL);
        idt[4] = IdtEntry::gate(stub_of as usize, GATE_KERNEL);
        idt[5] = IdtEntry::gate(stub_br as usize, GATE_KERNEL);
        idt[6] = IdtEntry::gate(stub_ud as usize, GATE_KERNEL);
        idt[7] = IdtEntry::gate(stub_nm as usize, GATE_KERNEL);
        idt[8] = IdtEntry::gate(stub_df as usize, GATE_KERNEL);
        idt[10] = IdtEntry::gate(stub_ts as usize, GATE_KERNEL);
        idt[11] = IdtEntry::gate(stub_np as usize, GATE_KERNEL);
        idt[12] = IdtEntry::gate(stub_ss as usize, GATE_KERNEL);
        idt[13] = IdtEntry::gate(stub_gp as usize, GATE_KERNEL);
        idt[14] = IdtEntry::gate(stub_pf as usize, GATE_KERNEL);
        idt[16] = IdtEntry::gate(stub_mf as usize, GATE_KERNEL);
        idt[17] = IdtEntry::gate(stub_ac as usize, GATE_KERNEL);

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
            idt[0x20 + i] = IdtEntry::gate(*stub, GATE_KERNEL);
        }

        idt[0x80] = IdtEntry::gate(stub_syscall as usize, GATE_USER);

        #[repr(C, packed)]
        struct IdtPointer {
            limit: u16,
            base: u32,
        }
        let pointer = IdtPointer {
            limit: size_of::<[IdtEntry; 256]>() as u16 - 1,
            base: &raw const IDT as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(nostack));
    }
}
