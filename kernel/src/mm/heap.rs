//! Kernel heap
//!
//! A contiguous PMM allocation handed to `linked_list_allocator`, then
//! pinned with `set_heap_reserved_range` so nothing frees the frames out
//! from under the allocator before the VMM takes ownership of mappings.
//! Hosted builds use the system allocator instead (see `lib.rs`).

use crate::error::KernelResult;

/// Kernel heap size (grown by a future consumer if needed).
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(target_os = "none")]
pub fn init() -> KernelResult<()> {
    use crate::{
        error::KernelError,
        mm::{
            addr::{phys_to_virt, PAGE_SIZE},
            pmm::FRAME_ALLOCATOR,
        },
    };

    let frames = HEAP_SIZE / PAGE_SIZE;
    let base = FRAME_ALLOCATOR
        .lock()
        .alloc_frames(frames)
        .ok_or(KernelError::NoMem {
            requested: HEAP_SIZE,
        })?;
    let lo = phys_to_virt(base);
    let hi = lo.offset(HEAP_SIZE);

    // SAFETY: The range was just carved out of the PMM for exclusive heap
    // use and is mapped through the direct map.
    unsafe {
        crate::ALLOCATOR.lock().init(lo.as_ptr::<u8>(), HEAP_SIZE);
    }
    FRAME_ALLOCATOR.lock().set_heap_reserved_range(lo, hi);

    log::info!(
        target: "heap",
        "{} KiB kernel heap at {:#x}",
        HEAP_SIZE / 1024,
        lo.as_usize()
    );
    Ok(())
}

#[cfg(not(target_os = "none"))]
pub fn init() -> KernelResult<()> {
    Ok(())
}
