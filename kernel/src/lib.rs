//! CastorOS kernel library
//!
//! HAL, memory management, scheduling, and syscall dispatch for a small
//! multi-architecture kernel (i686, x86_64, ARM64). Bare-metal builds get
//! the PMM-fed kernel heap; host builds delegate to the system allocator so
//! the test suite runs under the standard harness.

#![no_std]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod irq;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod timer;

// Re-exports for consumers and the integration test suite.
pub use arch::caps::{hal_capabilities, hal_has, Cap, HalCapabilities};
pub use error::{KernelError, KernelResult};
pub use mm::{PhysAddr, VirtAddr, PAGE_SIZE};

use boot::BootInfo;

/// Arch-independent bring-up, in the canonical order: logging, CPU-local
/// machinery, PMM, heap, VMM, scheduler, IRQ table, syscalls, timer. The
/// boot flow then parks as the idle task.
fn kernel_init(info: BootInfo) -> ! {
    klog::init(log::LevelFilter::Info);
    let caps = hal_capabilities();
    log::info!(
        target: "boot",
        "CastorOS {} on {} ({:?} handoff, {} MiB usable)",
        env!("CARGO_PKG_VERSION"),
        caps.arch_name,
        info.protocol,
        info.total_usable() / (1024 * 1024)
    );
    if let Some(cmdline) = info.cmdline {
        log::info!(target: "boot", "cmdline: {}", cmdline);
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    arch::x86_64::early_init();
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    arch::x86::early_init();
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    arch::aarch64::early_init();

    mm::init(&info).expect("memory bring-up cannot fail and continue");
    sched::init();
    irq::init();
    syscall::init();
    timer::init();

    arch::irq_enable();
    log::info!(target: "boot", "kernel up; idling until subsystems spawn work");
    loop {
        arch::idle();
    }
}

/// x86 family entry, called by the boot trampolines with the multiboot
/// registers.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn x86_boot(magic: u32, info: usize) -> ! {
    // SAFETY: The bootloader owns the info structure it handed us.
    let info = match unsafe { boot::multiboot::parse(magic, info as *const u8) } {
        Ok(info) => info,
        Err(e) => panic!("bad multiboot handoff: {:?}", e),
    };
    kernel_init(info)
}

/// ARM64 entry, called from the boot core with the DTB pointer.
#[cfg(target_arch = "aarch64")]
pub fn kernel_main(dtb: usize) -> ! {
    // SAFETY: Firmware owns the DTB it handed us.
    let info = match unsafe { boot::dtb::parse(dtb) } {
        Ok(info) => info,
        Err(e) => panic!("bad DTB handoff: {:?}", e),
    };
    kernel_init(info)
}

/// Panic path shared by the binary: banner on the console, then halt.
pub fn kernel_panic(info: &core::panic::PanicInfo) -> ! {
    let _ = crate::arch::irq_save();
    println!("\n================ KERNEL PANIC ================");
    println!("{}", info);
    println!("arch: {}", hal_capabilities().arch_name);
    println!("task: {}", sched::current_pid());
    println!("==============================================");
    loop {
        arch::idle();
    }
}
