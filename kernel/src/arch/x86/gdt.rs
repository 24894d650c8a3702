//! i686 GDT and TSS (hand-built descriptors)
//!
//! Layout: null, kernel code 0x08, kernel data 0x10, user code 0x1B
//! (0x18 | RPL 3), user data 0x23 (0x20 | RPL 3), TSS 0x28.

use core::mem::size_of;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1B;
pub const USER_DS: u16 = 0x23;
const TSS_SELECTOR: u16 = 0x28;

/// 32-bit TSS; only SS0/ESP0 matter (no hardware task switching).
#[allow(dead_code)]
#[repr(C, packed)]
struct Tss {
    link: u32,
    esp0: u32,
    ss0: u32,
    _unused: [u32; 23],
}

static mut TSS: Tss = Tss {
    link: 0,
    esp0: 0,
    ss0: KERNEL_DS as u32,
    _unused: [0; 23],
};

/// flat 4 GiB segment descriptor
const fn descriptor(access: u8) -> u64 {
    // base 0, limit 0xFFFFF, granularity 4K, 32-bit
    0x000F_0000_0000_FFFF | ((access as u64) << 40) | (0xC << 52)
}

static mut GDT: [u64; 6] = [
    0,
    descriptor(0x9A), // kernel code
    descriptor(0x92), // kernel data
    descriptor(0xFA), // user code
    descriptor(0xF2), // user data
    0,                // TSS, patched at init
];

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let mut desc = limit as u64 & 0xFFFF;
    desc |= ((base as u64) & 0xFFFFFF) << 16;
    desc |= 0x89 << 40; // present, 32-bit available TSS
    desc |= ((limit as u64 >> 16) & 0xF) << 48;
    desc |= ((base as u64) >> 24) << 56;
    desc
}

pub fn init() {
    // SAFETY: Single-threaded early boot; the GDT and TSS are statics that
    // live forever, and the reload sequence below is the architectural one.
    unsafe {
        let tss_base = &raw const TSS as u32;
        (*(&raw mut GDT))[5] = tss_descriptor(tss_base, size_of::<Tss>() as u32 - 1);

        let pointer = GdtPointer {
            limit: size_of::<[u64; 6]>() as u16 - 1,
            base: &raw const GDT as u32,
        };
        core::arch::asm!(
            "lgdt [{ptr}]",
            // Reload CS via far jump, then the data segments.
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            "mov fs, {ds:x}",
            "mov gs, {ds:x}",
            "ltr {tss:x}",
            ptr = in(reg) &pointer,
            cs = const KERNEL_CS as u32,
            ds = in(reg) KERNEL_DS as u32,
            tss = in(reg) TSS_SELECTOR as u32,
            tmp = out(reg) _,
        );
    }
}

/// Update TSS.ESP0 so the next Ring 3 trap lands on `stack_top`.
pub fn set_kernel_stack(stack_top: u32) {
    // SAFETY: Word-sized store to a static, written only by the scheduler
    // with interrupts disabled.
    unsafe {
        (*(&raw mut TSS)).esp0 = stack_top;
    }
}
