//! Physical Memory Manager
//!
//! Bitmap frame allocator with a per-frame reference count (for COW sharing)
//! and a protected bit (bootloader reservations, kernel image, the allocator's
//! own metadata, the early heap). The metadata arrays are carved out of the
//! first usable region large enough to hold them and protected in place, so
//! the allocator works before any heap exists.
//!
//! Frame states: free (bit clear), allocated (bit set, refcount >= 1) or
//! reserved (bit set, protected bit set, refcount 0). The scan never returns
//! a reserved frame, and `free_frame` on one is a warning no-op.

use core::ptr;

use crate::{
    boot::{MemoryKind, MemoryRange},
    error::{KernelError, KernelResult},
    mm::addr::{phys_to_virt, virt_to_phys, PageFrame, PhysAddr, VirtAddr, PAGE_SHIFT, PAGE_SIZE},
    sync::SpinLockIrq,
};

/// Memory zone for frame allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryZone {
    /// DMA zone (below 16 MiB)
    Dma,
    /// Normal zone
    Normal,
    /// High memory zone (above 896 MiB on 32-bit; unused on 64-bit)
    High,
}

impl MemoryZone {
    /// Frame-number range covered by this zone on the current architecture.
    pub fn frame_range(&self) -> (PageFrame, PageFrame) {
        const DMA_LIMIT: u64 = (16 * 1024 * 1024) >> PAGE_SHIFT;
        const HIGH_START: u64 = (896 * 1024 * 1024) >> PAGE_SHIFT;
        match self {
            MemoryZone::Dma => (PageFrame::new(0), PageFrame::new(DMA_LIMIT)),
            MemoryZone::Normal => {
                #[cfg(target_pointer_width = "32")]
                {
                    (PageFrame::new(DMA_LIMIT), PageFrame::new(HIGH_START))
                }
                #[cfg(target_pointer_width = "64")]
                {
                    (PageFrame::new(DMA_LIMIT), PageFrame::new(u64::MAX >> PAGE_SHIFT))
                }
            }
            MemoryZone::High => {
                #[cfg(target_pointer_width = "32")]
                {
                    (PageFrame::new(HIGH_START), PageFrame::new(u64::MAX >> PAGE_SHIFT))
                }
                #[cfg(target_pointer_width = "64")]
                {
                    (PageFrame::new(0), PageFrame::new(0))
                }
            }
        }
    }

    /// Check whether a frame belongs to this zone.
    pub fn contains(&self, frame: PageFrame) -> bool {
        let (start, end) = self.frame_range();
        frame >= start && frame < end
    }

    /// Zone a frame falls in.
    pub fn for_frame(frame: PageFrame) -> Self {
        if MemoryZone::Dma.contains(frame) {
            MemoryZone::Dma
        } else if cfg!(target_pointer_width = "32") && MemoryZone::High.contains(frame) {
            MemoryZone::High
        } else {
            MemoryZone::Normal
        }
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub reserved_frames: usize,
    pub allocated_frames: usize,
}

/// Bitmap frame allocator with refcounts and protected bits.
pub struct FrameAllocator {
    /// First managed frame number.
    base: u64,
    /// Frames in the managed span (usable regions plus holes).
    total: usize,
    /// Physical address of the metadata block (bitmap, protected, refcounts).
    meta: PhysAddr,
    /// u64 words per bitmap.
    words: usize,
    free: usize,
    reserved: usize,
    initialized: bool,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            base: 0,
            total: 0,
            meta: PhysAddr::new(0),
            words: 0,
            free: 0,
            reserved: 0,
            initialized: false,
        }
    }

    // -- metadata accessors -------------------------------------------------

    // The metadata block lives in managed physical memory and is reached
    // through the direct map, so its kernel-virtual location follows the
    // direct-map offset wherever it moves.

    fn alloc_word(&self, widx: usize) -> *mut u64 {
        debug_assert!(widx < self.words);
        // SAFETY: `meta` points at a metadata block sized in init() to hold
        // `words` u64s at offset 0; widx is bounds-checked above.
        unsafe { phys_to_virt(self.meta).as_ptr::<u64>().add(widx) }
    }

    fn prot_word(&self, widx: usize) -> *mut u64 {
        debug_assert!(widx < self.words);
        // SAFETY: The protected bitmap starts right after the allocation
        // bitmap (`words` u64s in); sized identically.
        unsafe {
            phys_to_virt(self.meta)
                .as_ptr::<u64>()
                .add(self.words + widx)
        }
    }

    fn refcount_slot(&self, idx: usize) -> *mut u16 {
        debug_assert!(idx < self.total);
        // SAFETY: The refcount array starts after both bitmaps
        // (2 * words * 8 bytes in) and holds `total` u16s.
        unsafe {
            phys_to_virt(self.meta.offset(self.words as u64 * 16))
                .as_ptr::<u16>()
                .add(idx)
        }
    }

    /// Frame index within the managed span, or None if outside it.
    fn index_of(&self, pa: PhysAddr) -> Option<usize> {
        let pfn = pa.frame().as_u64();
        if pfn < self.base {
            return None;
        }
        let idx = (pfn - self.base) as usize;
        if idx < self.total {
            Some(idx)
        } else {
            None
        }
    }

    fn bit_is_set(&self, idx: usize) -> bool {
        // SAFETY: alloc_word bounds-checks the word index.
        unsafe { *self.alloc_word(idx / 64) & (1 << (idx % 64)) != 0 }
    }

    fn set_bit(&mut self, idx: usize) {
        // SAFETY: See bit_is_set.
        unsafe { *self.alloc_word(idx / 64) |= 1 << (idx % 64) }
    }

    fn clear_bit(&mut self, idx: usize) {
        // SAFETY: See bit_is_set.
        unsafe { *self.alloc_word(idx / 64) &= !(1 << (idx % 64)) }
    }

    fn prot_is_set(&self, idx: usize) -> bool {
        // SAFETY: prot_word bounds-checks the word index.
        unsafe { *self.prot_word(idx / 64) & (1 << (idx % 64)) != 0 }
    }

    fn set_prot(&mut self, idx: usize) {
        // SAFETY: See prot_is_set.
        unsafe { *self.prot_word(idx / 64) |= 1 << (idx % 64) }
    }

    fn clear_prot(&mut self, idx: usize) {
        // SAFETY: See prot_is_set.
        unsafe { *self.prot_word(idx / 64) &= !(1 << (idx % 64)) }
    }

    fn refcount(&self, idx: usize) -> u16 {
        // SAFETY: refcount_slot bounds-checks the index.
        unsafe { *self.refcount_slot(idx) }
    }

    fn set_refcount(&mut self, idx: usize, val: u16) {
        // SAFETY: See refcount.
        unsafe { *self.refcount_slot(idx) = val }
    }

    fn frame_addr(&self, idx: usize) -> PhysAddr {
        PageFrame::new(self.base + idx as u64).addr()
    }

    // -- init ---------------------------------------------------------------

    /// Initialize over the bootloader memory map.
    ///
    /// Every frame starts reserved; usable regions are then released, and the
    /// metadata block itself is re-reserved in place.
    pub fn init(&mut self, regions: &[MemoryRange]) -> KernelResult<()> {
        if self.initialized {
            return Err(KernelError::Busy {
                resource: "frame allocator",
            });
        }

        let mut lo = u64::MAX;
        let mut hi = 0u64;
        for r in regions.iter().filter(|r| r.kind == MemoryKind::Usable) {
            let first = r.base >> PAGE_SHIFT;
            let last = (r.base + r.length) >> PAGE_SHIFT;
            lo = lo.min(first);
            hi = hi.max(last);
        }
        if lo >= hi {
            return Err(KernelError::InvalidArg {
                name: "memory_map",
            });
        }

        self.base = lo;
        self.total = (hi - lo) as usize;
        self.words = self.total.div_ceil(64);

        // Metadata: two bitmaps plus one u16 per frame.
        let meta_bytes = self.words * 16 + self.total * 2;
        let meta_frames = meta_bytes.div_ceil(PAGE_SIZE);

        let host = regions
            .iter()
            .filter(|r| r.kind == MemoryKind::Usable)
            .find(|r| (r.length >> PAGE_SHIFT) as usize > meta_frames)
            .ok_or(KernelError::NoMem {
                requested: meta_bytes,
            })?;
        self.meta = PhysAddr::new(host.base).align_up();

        // SAFETY: `meta` points at `meta_frames` whole frames inside a
        // usable region that nothing else has touched yet.
        unsafe {
            ptr::write_bytes(phys_to_virt(self.meta).as_ptr::<u8>(), 0, meta_frames * PAGE_SIZE);
        }

        // Reserve the whole span, then release the usable regions.
        for w in 0..self.words {
            // SAFETY: w < words by construction.
            unsafe {
                *self.alloc_word(w) = u64::MAX;
                *self.prot_word(w) = u64::MAX;
            }
        }
        self.reserved = self.total;
        self.free = 0;

        for r in regions.iter().filter(|r| r.kind == MemoryKind::Usable) {
            let first = r.base.div_ceil(PAGE_SIZE as u64);
            let last = (r.base + r.length) >> PAGE_SHIFT;
            for pfn in first..last {
                let idx = (pfn - self.base) as usize;
                self.clear_bit(idx);
                self.clear_prot(idx);
                self.free += 1;
                self.reserved -= 1;
            }
        }

        self.initialized = true;

        // Finally pin the metadata block so the scan never hands it out.
        for i in 0..meta_frames {
            self.protect(self.meta.offset((i * PAGE_SIZE) as u64));
        }

        log::info!(
            target: "pmm",
            "managing {} frames ({} KiB metadata), {} free",
            self.total,
            meta_bytes / 1024,
            self.free
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // -- allocation ---------------------------------------------------------

    fn zero_frames(&self, pa: PhysAddr, count: usize) {
        // SAFETY: The frames were just taken out of the free pool, so nothing
        // else references them; the direct map covers all managed memory.
        unsafe {
            ptr::write_bytes(phys_to_virt(pa).as_ptr::<u8>(), 0, count * PAGE_SIZE);
        }
    }

    fn scan(&self, count: usize, range: Option<(PageFrame, PageFrame)>) -> Option<usize> {
        let (lo, hi) = match range {
            Some((lo, hi)) => (
                lo.as_u64().saturating_sub(self.base).min(self.total as u64) as usize,
                hi.as_u64().saturating_sub(self.base).min(self.total as u64) as usize,
            ),
            None => (0, self.total),
        };

        let mut run = 0;
        for idx in lo..hi {
            if self.bit_is_set(idx) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(idx + 1 - count);
            }
        }
        None
    }

    fn take(&mut self, start: usize, count: usize) -> PhysAddr {
        for idx in start..start + count {
            self.set_bit(idx);
            self.set_refcount(idx, 1);
        }
        self.free -= count;
        let pa = self.frame_addr(start);
        self.zero_frames(pa, count);
        pa
    }

    /// Allocate one zeroed frame. Returns None when memory is exhausted.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let start = self.scan(1, None)?;
        Some(self.take(start, 1))
    }

    /// Allocate `count` physically contiguous zeroed frames.
    ///
    /// Fails rather than compacting when no contiguous run exists.
    pub fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let start = self.scan(count, None)?;
        Some(self.take(start, count))
    }

    /// Allocate one zeroed frame constrained to a zone.
    pub fn alloc_zone(&mut self, zone: MemoryZone) -> Option<PhysAddr> {
        let start = self.scan(1, Some(zone.frame_range()))?;
        Some(self.take(start, 1))
    }

    /// Release one reference to a frame; frees it when the count reaches
    /// zero. Frame contents are left as-is.
    pub fn free_frame(&mut self, pa: PhysAddr) {
        let Some(idx) = self.index_of(pa) else {
            log::warn!(target: "pmm", "free of unmanaged frame {:#x}", pa.as_u64());
            return;
        };
        if self.prot_is_set(idx) {
            log::warn!(target: "pmm", "free of protected frame {:#x} ignored", pa.as_u64());
            return;
        }
        let rc = self.refcount(idx);
        if rc > 1 {
            self.set_refcount(idx, rc - 1);
            return;
        }
        if rc == 0 || !self.bit_is_set(idx) {
            panic!("PMM: double free of frame {:#x}", pa.as_u64());
        }
        self.set_refcount(idx, 0);
        self.clear_bit(idx);
        self.free += 1;
    }

    // -- refcounts ----------------------------------------------------------

    /// Add a reference to an allocated frame (COW sharing).
    pub fn ref_inc(&mut self, pa: PhysAddr) {
        if let Some(idx) = self.index_of(pa) {
            let rc = self.refcount(idx);
            debug_assert!(rc > 0, "ref_inc on free frame {:#x}", pa.as_u64());
            self.set_refcount(idx, rc.saturating_add(1));
        }
    }

    /// Drop a reference; identical to [`free_frame`] when it reaches zero.
    /// Returns the remaining count.
    pub fn ref_dec(&mut self, pa: PhysAddr) -> u16 {
        let Some(idx) = self.index_of(pa) else {
            return 0;
        };
        let rc = self.refcount(idx);
        if rc <= 1 {
            self.free_frame(pa);
            0
        } else {
            self.set_refcount(idx, rc - 1);
            rc - 1
        }
    }

    /// Current reference count (0 for free or unmanaged frames).
    pub fn ref_get(&self, pa: PhysAddr) -> u16 {
        self.index_of(pa).map_or(0, |idx| self.refcount(idx))
    }

    // -- protection ---------------------------------------------------------

    /// Mark a frame ineligible for allocation.
    pub fn protect(&mut self, pa: PhysAddr) {
        if let Some(idx) = self.index_of(pa) {
            if self.prot_is_set(idx) {
                return;
            }
            if !self.bit_is_set(idx) {
                self.set_bit(idx);
                self.free -= 1;
            }
            self.set_prot(idx);
            self.reserved += 1;
        }
    }

    /// Mark every frame overlapping `[base, base+length)` protected.
    pub fn protect_range(&mut self, base: PhysAddr, length: u64) {
        let mut pa = base.align_down();
        let end = base.offset(length).align_up();
        while pa < end {
            self.protect(pa);
            pa = pa.offset(PAGE_SIZE as u64);
        }
    }

    /// Return a protected frame to the pool (if nobody holds it).
    pub fn unprotect(&mut self, pa: PhysAddr) {
        if let Some(idx) = self.index_of(pa) {
            if !self.prot_is_set(idx) {
                return;
            }
            self.clear_prot(idx);
            self.reserved -= 1;
            if self.refcount(idx) == 0 {
                self.clear_bit(idx);
                self.free += 1;
            }
        }
    }

    pub fn is_protected(&self, pa: PhysAddr) -> bool {
        self.index_of(pa).is_some_and(|idx| self.prot_is_set(idx))
    }

    /// Protect the physical frames backing a kernel-virtual range (the early
    /// heap, before the VMM takes over ownership of mappings).
    pub fn set_heap_reserved_range(&mut self, lo: VirtAddr, hi: VirtAddr) {
        let lo_pa = virt_to_phys(lo.align_down());
        let hi_pa = virt_to_phys(hi.align_up());
        self.protect_range(lo_pa, hi_pa.as_u64() - lo_pa.as_u64());
    }

    // -- accounting ---------------------------------------------------------

    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_frames: self.total,
            free_frames: self.free,
            reserved_frames: self.reserved,
            allocated_frames: self.total - self.free - self.reserved,
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance.
///
/// The IRQ-safe lock covers the bitmap and the refcount array together
/// (single shared-resource lock; see the concurrency model).
pub static FRAME_ALLOCATOR: SpinLockIrq<FrameAllocator> = SpinLockIrq::new(FrameAllocator::new());

/// Initialize the global allocator from the boot memory map, then protect
/// every non-usable range that falls inside the managed span.
pub fn init(regions: &[MemoryRange]) -> KernelResult<()> {
    let mut pmm = FRAME_ALLOCATOR.lock();
    pmm.init(regions)?;
    for r in regions.iter().filter(|r| r.kind != MemoryKind::Usable) {
        pmm.protect_range(PhysAddr::new(r.base), r.length);
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testpool;

    #[test]
    fn alloc_free_realloc_returns_same_frame() {
        // Single usable region at the 1 MiB mark.
        let mut pmm = FrameAllocator::new();
        pmm.init(&[testpool::scratch(0)])
            .expect("init over a 2 MiB region should succeed");

        let mut frames = [PhysAddr::INVALID; 4];
        for f in frames.iter_mut() {
            *f = pmm.alloc_frame().expect("allocation from fresh pool");
            assert!(f.is_page_aligned());
            assert!(f.as_u64() >= 0x10_0000);
        }
        for w in frames.windows(2) {
            assert_ne!(w[0], w[1]);
        }

        pmm.free_frame(frames[1]);
        let again = pmm.alloc_frame().expect("realloc after free");
        assert_eq!(again, frames[1]);
    }

    #[test]
    fn refcount_lifecycle() {
        let mut pmm = FrameAllocator::new();
        pmm.init(&[testpool::scratch(1)]).expect("init");

        let before = pmm.stats().free_frames;
        let pa = pmm.alloc_frame().expect("alloc");
        assert_eq!(pmm.ref_get(pa), 1);

        // alloc + k incs + (k+1) decs frees the frame.
        let k: u16 = 3;
        for _ in 0..k {
            pmm.ref_inc(pa);
        }
        assert_eq!(pmm.ref_get(pa), 1 + k);
        for step in 0..k {
            let left = pmm.ref_dec(pa);
            assert_eq!(left, k - step);
        }
        assert_eq!(pmm.ref_dec(pa), 0);
        assert_eq!(pmm.ref_get(pa), 0);
        assert_eq!(pmm.stats().free_frames, before);

        // alloc + k incs + k decs + one free also frees it.
        let pa = pmm.alloc_frame().expect("alloc");
        for _ in 0..k {
            pmm.ref_inc(pa);
        }
        for _ in 0..k {
            pmm.ref_dec(pa);
        }
        assert_eq!(pmm.ref_get(pa), 1);
        pmm.free_frame(pa);
        assert_eq!(pmm.stats().free_frames, before);
    }

    #[test]
    fn contiguous_allocation_is_contiguous() {
        let mut pmm = FrameAllocator::new();
        pmm.init(&[testpool::scratch(2)]).expect("init");

        let run = pmm.alloc_frames(8).expect("8-frame run");
        let single = pmm.alloc_frame().expect("single");
        assert!(single.as_u64() >= run.as_u64() + 8 * PAGE_SIZE as u64);

        // An impossible run fails instead of compacting.
        assert!(pmm.alloc_frames(1 << 20).is_none());
    }

    #[test]
    fn protected_frames_are_never_handed_out() {
        let mut pmm = FrameAllocator::new();
        pmm.init(&[testpool::scratch(3)]).expect("init");

        let pa = pmm.alloc_frame().expect("alloc");
        pmm.free_frame(pa);
        pmm.protect(pa);
        assert!(pmm.is_protected(pa));

        let next = pmm.alloc_frame().expect("alloc after protect");
        assert_ne!(next, pa);

        // Freeing a protected frame is a no-op warning.
        pmm.free_frame(pa);
        assert!(pmm.is_protected(pa));

        pmm.unprotect(pa);
        assert!(!pmm.is_protected(pa));
    }

    #[test]
    fn accounting_stays_balanced() {
        let mut pmm = FrameAllocator::new();
        pmm.init(&[testpool::scratch(4)]).expect("init");

        let s0 = pmm.stats();
        assert_eq!(
            s0.total_frames,
            s0.free_frames + s0.reserved_frames + s0.allocated_frames
        );

        let a = pmm.alloc_frame().expect("alloc");
        let b = pmm.alloc_frames(4).expect("alloc run");
        let s1 = pmm.stats();
        assert_eq!(s1.allocated_frames, s0.allocated_frames + 5);
        assert_eq!(s1.free_frames, s0.free_frames - 5);

        pmm.free_frame(a);
        for i in 0..4 {
            pmm.free_frame(b.offset(i * PAGE_SIZE as u64));
        }
        let s2 = pmm.stats();
        assert_eq!(s2.free_frames, s0.free_frames);
    }

    #[test]
    fn zone_ranges_partition_the_address_space() {
        let dma_frame = PageFrame::new(0x100);
        let normal_frame = PageFrame::new((64 * 1024 * 1024) >> PAGE_SHIFT);
        assert_eq!(MemoryZone::for_frame(dma_frame), MemoryZone::Dma);
        assert_eq!(MemoryZone::for_frame(normal_frame), MemoryZone::Normal);
        assert!(MemoryZone::Dma.contains(dma_frame));
        assert!(!MemoryZone::Dma.contains(normal_frame));
    }

    #[test]
    fn zone_constrained_allocation_respects_the_range() {
        let mut pmm = FrameAllocator::new();
        pmm.init(&[testpool::scratch(5)]).expect("init");

        // This scratch window sits entirely below 16 MiB.
        let pa = pmm.alloc_zone(MemoryZone::Dma).expect("dma alloc");
        assert!(MemoryZone::Dma.contains(pa.frame()));
        // Nothing in this pool lives above 896 MiB / in High.
        #[cfg(target_pointer_width = "64")]
        assert!(pmm.alloc_zone(MemoryZone::High).is_none());
    }
}
