//! Global Descriptor Table and TSS
//!
//! Layout:
//! - 0x00: null
//! - 0x08: kernel code (Ring 0)
//! - 0x10: kernel data (Ring 0)
//! - 0x18: TSS (two entries, 0x18-0x20)
//! - 0x28: user data (Ring 3, selector 0x2B with RPL)
//! - 0x30: user code (Ring 3, selector 0x33 with RPL)
//!
//! The user data/code order matches SYSRET expectations: SYSRET computes
//! SS = STAR[63:48]+8 and CS = STAR[63:48]+16.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Boot-time Ring 3 -> Ring 0 stack; the scheduler replaces RSP0
        // with the running task's kernel stack on every switch.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            #[allow(dead_code)] // alignment wrapper, accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_KSTACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let ptr = &raw const BOOT_KSTACK;
            VirtAddr::from_ptr(ptr) + STACK_SIZE as u64
        };

        // Separate stack for double faults (must be 16-byte aligned).
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            #[allow(dead_code)] // alignment wrapper, accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut DF_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let ptr = &raw const DF_STACK;
            VirtAddr::from_ptr(ptr) + STACK_SIZE as u64
        };
        tss
    };
}

/// Segment selectors handed to the IDT, SYSCALL MSRs, and user-mode entry.
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub tss: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
                user_data,
                user_code,
            },
        )
    };
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: The selectors reference descriptors in the GDT loaded on the
    // line above; reloading segments right after lgdt is the required
    // sequence.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update TSS.RSP0 so the next user-to-kernel trap lands on `stack_top`.
/// Called from the scheduler with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: The TSS is a static that lives forever; only the scheduler
    // writes this field, and only with interrupts off.
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Current TSS.RSP0.
pub fn kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}
