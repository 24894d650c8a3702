//! Memory management
//!
//! Bring-up order is fixed: PMM over the boot memory map, then the kernel
//! heap (the first two run on the boot identity mapping), then the VMM,
//! which builds the kernel direct map and moves the phys-to-virt offset up
//! to the kernel half.

pub mod addr;
pub mod fault;
pub mod heap;
pub mod mapper;
pub mod pmm;
pub mod vmm;
pub mod walker;

pub use addr::{phys_to_virt, virt_to_phys, PageFrame, PhysAddr, VirtAddr, PAGE_SIZE};
pub use pmm::{FrameAllocator, MemoryZone, FRAME_ALLOCATOR};

use crate::{boot::BootInfo, error::KernelResult};

/// Initialize the whole memory stack from the boot handoff.
pub fn init(info: &BootInfo) -> KernelResult<()> {
    pmm::init(info.memory_map())?;
    heap::init()?;

    let phys_limit = info
        .memory_map()
        .iter()
        .map(|r| r.base + r.length)
        .max()
        .unwrap_or(0);
    vmm::init(phys_limit)?;
    Ok(())
}

/// Shared fixture for the host test suite: one page-aligned allocation
/// masquerading as physical memory at a fixed fake base, reached through
/// the same direct-map offset mechanism the kernel itself uses.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testpool {
    use std::sync::{Mutex, MutexGuard, Once};

    use super::addr::{set_direct_map_offset, PAGE_SIZE};
    use crate::boot::{MemoryKind, MemoryRange};

    /// Fake physical window (the classic 1 MiB mark).
    pub const POOL_BASE: u64 = 0x10_0000;
    pub const POOL_SIZE: usize = 32 * 1024 * 1024;

    /// 2 MiB windows handed to instance-allocator tests.
    const SCRATCH_WINDOW: u64 = 0x20_0000;
    const SCRATCH_WINDOWS: u64 = 8;

    /// Tail of the pool backing the global FRAME_ALLOCATOR.
    const SHARED_BASE: u64 = POOL_BASE + SCRATCH_WINDOWS * SCRATCH_WINDOW;

    static INIT: Once = Once::new();
    static SHARED: Mutex<()> = Mutex::new(());

    fn init_pool() {
        INIT.call_once(|| {
            let layout = std::alloc::Layout::from_size_align(POOL_SIZE, PAGE_SIZE)
                .expect("pool layout is valid");
            // Leaked on purpose: the pool lives as long as the test process.
            // SAFETY: Non-zero, well-formed layout.
            let buf = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!buf.is_null(), "test pool allocation failed");
            set_direct_map_offset((buf as u64).wrapping_sub(POOL_BASE));
        });
    }

    /// A private usable window for one instance-allocator test. Windows
    /// are assigned by hand, one per test, so concurrent tests never share
    /// metadata memory.
    pub fn scratch(index: u64) -> MemoryRange {
        assert!(index < SCRATCH_WINDOWS, "scratch window out of range");
        init_pool();
        MemoryRange {
            base: POOL_BASE + index * SCRATCH_WINDOW,
            length: SCRATCH_WINDOW,
            kind: MemoryKind::Usable,
        }
    }

    /// Bring up the global allocator over the shared tail (idempotent).
    pub fn init_shared() {
        init_pool();
        let range = MemoryRange {
            base: SHARED_BASE,
            length: POOL_BASE + POOL_SIZE as u64 - SHARED_BASE,
            kind: MemoryKind::Usable,
        };
        let _ = super::pmm::FRAME_ALLOCATOR.lock().init(&[range]);
    }

    /// Serialize tests that allocate from the shared global allocator (so
    /// free-count assertions and table memory stay coherent).
    pub fn lock_shared() -> MutexGuard<'static, ()> {
        init_shared();
        SHARED.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
