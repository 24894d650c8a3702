//! CastorOS kernel binary
//!
//! The architecture entry points and all kernel logic live in the library;
//! this binary contributes the panic handler for bare-metal builds. Host
//! builds produce an inert stub so the workspace builds everywhere.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    // Pull the library in so the boot entry symbols are linked.
    extern crate castor_kernel;

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        castor_kernel::kernel_panic(info)
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!("castor-kernel is a bare-metal image; run it under QEMU");
}
