//! Portable MMU operations
//!
//! `map`/`unmap`/`protect`/`query` over the walker, format-generic and free
//! of TLB side effects: the caller invalidates the TLB for addresses it
//! mutates (through [`crate::arch::mmu`]). The per-ISA pieces of the MMU
//! facet -- switching the root table, flushing, reading the fault address --
//! live in `arch/*/mmu.rs`.
//!
//! COW discipline, identical on every ISA: setting `COW` clears `WRITE`;
//! clearing `COW` never sets `WRITE` back.

use crate::{
    arch::pte::{PteFlags, PteFormat},
    error::{KernelError, KernelResult, WalkError},
    mm::{
        addr::{PhysAddr, VirtAddr},
        walker,
    },
};

/// Apply the COW rule to a requested flag set.
fn normalize(mut flags: PteFlags) -> PteFlags {
    if flags.contains(PteFlags::COW) {
        flags.remove(PteFlags::WRITE);
    }
    flags
}

/// Install a leaf mapping `va -> pa`.
///
/// Both addresses must be page-aligned. Intermediate tables are allocated on
/// demand. If a mapping is already present the call fails and changes
/// nothing. The caller must flush the TLB for `va` afterwards if this
/// address space is live.
pub fn map<F: PteFormat>(
    root: PhysAddr,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PteFlags,
) -> KernelResult<()> {
    if !va.is_page_aligned() || !pa.is_page_aligned() {
        return Err(KernelError::InvalidArg { name: "alignment" });
    }
    let flags = normalize(flags) | PteFlags::PRESENT;

    let slot = walker::walk::<F>(root, va, true).map_err(|e| match e {
        WalkError::NoMem => KernelError::NoMem { requested: 0 },
        other => KernelError::Walk(other),
    })?;

    // SAFETY: The walker hands back a slot inside a live table frame; the
    // per-address-space lock gives us exclusive access to the hierarchy.
    unsafe {
        if F::is_present(*slot) {
            return Err(KernelError::AlreadyMapped {
                vaddr: va.as_usize(),
            });
        }
        let mut pte = F::make(pa, flags);
        if !flags.contains(PteFlags::EXEC) {
            // Positive-logic EXEC: the encoder only sets the no-execute
            // hardware bits when asked to clear the flag explicitly.
            pte = F::modify(pte, PteFlags::empty(), PteFlags::EXEC);
        }
        *slot = pte;
    }
    Ok(())
}

/// Install a block (huge-page) mapping one level above the leaf.
///
/// `va` and `pa` must be aligned to the block size of the format
/// (4 MiB on i686, 2 MiB on the 4-level ISAs).
pub fn map_block<F: PteFormat>(
    root: PhysAddr,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PteFlags,
) -> KernelResult<()> {
    let block = crate::mm::addr::PAGE_SIZE * F::ENTRIES;
    if va.as_usize() % block != 0 || pa.as_usize() % block != 0 {
        return Err(KernelError::InvalidArg { name: "alignment" });
    }
    let flags = normalize(flags) | PteFlags::PRESENT | PteFlags::HUGE;

    let slot = walker::walk_to::<F>(root, va, true, F::LEVELS - 2).map_err(|e| match e {
        WalkError::NoMem => KernelError::NoMem { requested: 0 },
        other => KernelError::Walk(other),
    })?;
    // SAFETY: Slot validity as in map(); see above.
    unsafe {
        if F::is_present(*slot) {
            return Err(KernelError::AlreadyMapped {
                vaddr: va.as_usize(),
            });
        }
        let mut pte = F::make(pa, flags);
        if !flags.contains(PteFlags::EXEC) {
            pte = F::modify(pte, PteFlags::empty(), PteFlags::EXEC);
        }
        *slot = pte;
    }
    Ok(())
}

/// Remove the leaf mapping for `va`, returning the frame it pointed at.
///
/// Intermediate tables are deliberately left in place; the caller flushes
/// the TLB.
pub fn unmap<F: PteFormat>(root: PhysAddr, va: VirtAddr) -> KernelResult<PhysAddr> {
    let slot = walker::walk_existing::<F>(root, va).map_err(|_| KernelError::NotMapped {
        vaddr: va.as_usize(),
    })?;
    // SAFETY: Slot validity as in map(); see above.
    unsafe {
        if !F::is_present(*slot) {
            return Err(KernelError::NotMapped {
                vaddr: va.as_usize(),
            });
        }
        let pa = F::addr(*slot);
        *slot = F::EMPTY;
        Ok(pa)
    }
}

/// Update flag bits on an existing leaf mapping; the frame address is
/// untouched and `PRESENT` cannot be cleared through this call.
pub fn protect<F: PteFormat>(
    root: PhysAddr,
    va: VirtAddr,
    set: PteFlags,
    clear: PteFlags,
) -> KernelResult<()> {
    let set = normalize(set);
    let mut clear = clear - PteFlags::PRESENT;
    if set.contains(PteFlags::COW) {
        clear |= PteFlags::WRITE;
    }

    let slot = walker::walk_existing::<F>(root, va).map_err(|_| KernelError::NotMapped {
        vaddr: va.as_usize(),
    })?;
    // SAFETY: Slot validity as in map(); see above.
    unsafe {
        if !F::is_present(*slot) {
            return Err(KernelError::NotMapped {
                vaddr: va.as_usize(),
            });
        }
        *slot = F::modify(*slot, set, clear);
    }
    Ok(())
}

/// Look up the mapping for `va`. Returns the frame address and decoded
/// flags, or `None` if nothing is present (huge mappings report the block
/// frame).
pub fn query<F: PteFormat>(root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let (pte, _) = walker::find_mapping::<F>(root, va)?;
    Some((F::addr(pte), F::flags(pte)))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::arch::pte::NativeFormat;
    use crate::mm::{pmm::FRAME_ALLOCATOR, testpool};

    type F = NativeFormat;

    fn fresh_root() -> PhysAddr {
        FRAME_ALLOCATOR.lock().alloc_frame().expect("root frame")
    }

    #[test]
    fn map_query_roundtrip() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        let va = VirtAddr::new(0x40_0000);
        let pa = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
        let f = PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER;

        map::<F>(root, va, pa, f).expect("map");
        let (qpa, qf) = query::<F>(root, va).expect("query after map");
        assert_eq!(qpa, pa);
        assert!(qf.contains(PteFlags::PRESENT));
        let compared = PteFlags::COW | PteFlags::WRITE | PteFlags::USER | PteFlags::EXEC;
        assert_eq!(qf & compared, f & compared);
    }

    #[test]
    fn double_map_is_rejected_and_changes_nothing() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        let va = VirtAddr::new(0x50_0000);
        let pa1 = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
        let pa2 = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
        let f = PteFlags::PRESENT | PteFlags::WRITE;

        map::<F>(root, va, pa1, f).expect("first map");
        assert_eq!(
            map::<F>(root, va, pa2, f),
            Err(KernelError::AlreadyMapped {
                vaddr: va.as_usize()
            })
        );
        assert_eq!(query::<F>(root, va).expect("query").0, pa1);
    }

    #[test]
    fn unaligned_map_is_invalid() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        assert_eq!(
            map::<F>(
                root,
                VirtAddr::new(0x1234),
                PhysAddr::new(0x1000),
                PteFlags::PRESENT
            ),
            Err(KernelError::InvalidArg { name: "alignment" })
        );
    }

    #[test]
    fn unmap_clears_only_the_leaf() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        let va = VirtAddr::new(0x60_0000);
        let pa = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");

        map::<F>(root, va, pa, PteFlags::PRESENT | PteFlags::WRITE).expect("map");
        let freed = unmap::<F>(root, va).expect("unmap");
        assert_eq!(freed, pa);
        assert!(query::<F>(root, va).is_none());

        // Intermediates survived: remapping allocates no new tables.
        let before = FRAME_ALLOCATOR.lock().stats().free_frames;
        map::<F>(root, va, pa, PteFlags::PRESENT).expect("remap");
        assert_eq!(FRAME_ALLOCATOR.lock().stats().free_frames, before);

        // Unmapping an absent page fails cleanly.
        assert!(unmap::<F>(root, VirtAddr::new(0x7F_0000)).is_err());
    }

    #[test]
    fn setting_cow_clears_write_but_not_vice_versa() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        let va = VirtAddr::new(0x70_0000);
        let pa = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");

        map::<F>(
            root,
            va,
            pa,
            PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
        )
        .expect("map");

        // Setting COW implies clearing WRITE.
        protect::<F>(root, va, PteFlags::COW, PteFlags::empty()).expect("protect");
        let (_, f) = query::<F>(root, va).expect("query");
        assert!(f.contains(PteFlags::COW));
        assert!(!f.contains(PteFlags::WRITE));

        // Clearing COW does not bring WRITE back.
        protect::<F>(root, va, PteFlags::empty(), PteFlags::COW).expect("protect");
        let (_, f) = query::<F>(root, va).expect("query");
        assert!(!f.contains(PteFlags::COW));
        assert!(!f.contains(PteFlags::WRITE));
    }

    #[test]
    fn protect_cannot_clear_present_or_move_the_frame() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        let va = VirtAddr::new(0x80_0000);
        let pa = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");

        map::<F>(root, va, pa, PteFlags::PRESENT | PteFlags::USER).expect("map");
        protect::<F>(root, va, PteFlags::WRITE, PteFlags::PRESENT | PteFlags::USER)
            .expect("protect");
        let (qpa, f) = query::<F>(root, va).expect("still mapped");
        assert_eq!(qpa, pa);
        assert!(f.contains(PteFlags::PRESENT));
        assert!(f.contains(PteFlags::WRITE));
        assert!(!f.contains(PteFlags::USER));
    }

    #[test]
    fn mapping_without_exec_is_not_executable() {
        let _pool = testpool::lock_shared();
        let root = fresh_root();
        let va = VirtAddr::new(0x90_0000);
        let pa = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");

        map::<F>(root, va, pa, PteFlags::PRESENT | PteFlags::USER).expect("map");
        let (_, f) = query::<F>(root, va).expect("query");
        assert!(!f.contains(PteFlags::EXEC));

        let va2 = VirtAddr::new(0x91_0000);
        let pa2 = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
        map::<F>(root, va2, pa2, PteFlags::PRESENT | PteFlags::USER | PteFlags::EXEC)
            .expect("map exec");
        let (_, f) = query::<F>(root, va2).expect("query");
        assert!(f.contains(PteFlags::EXEC));
    }
}
