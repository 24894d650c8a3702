//! Page-table walker
//!
//! Descends a table hierarchy in the format's geometry and returns a pointer
//! to the leaf PTE slot. Intermediate tables are allocated from the PMM on
//! demand (parent entries get `PRESENT|WRITE|USER`; the leaf carries the
//! caller's flags). The walker never touches the TLB -- that belongs to the
//! MMU layer above.

use crate::{
    arch::pte::{PteFlags, PteFormat},
    error::WalkError,
    mm::{
        addr::{phys_to_virt, PhysAddr, VirtAddr},
        pmm::FRAME_ALLOCATOR,
    },
};

/// Pointer to the PTE slot for `va` at walk depth `depth` in `table`.
fn slot_at<F: PteFormat>(table: PhysAddr, va: VirtAddr, depth: usize) -> *mut F::Repr {
    let index = F::va_index(va, depth);
    debug_assert!(index < F::ENTRIES);
    // SAFETY: `table` is a whole table frame reachable through the direct
    // map and the index is within the format's table geometry.
    unsafe { phys_to_virt(table).as_ptr::<F::Repr>().add(index) }
}

/// Walk to the leaf PTE slot for `va`, optionally creating intermediate
/// tables.
///
/// Errors: `NotMapped` when an intermediate table is missing and `create` is
/// false; `NoMem` when table allocation fails; `HugeInPath` when a huge
/// mapping sits above the leaf level (the caller did not ask for huge
/// semantics).
pub fn walk<F: PteFormat>(
    root: PhysAddr,
    va: VirtAddr,
    create: bool,
) -> Result<*mut F::Repr, WalkError> {
    walk_to::<F>(root, va, create, F::LEVELS - 1)
}

/// Walk to the PTE slot at `target_depth` (for block/huge mappings one
/// level above the leaf). Semantics otherwise match [`walk`].
pub fn walk_to<F: PteFormat>(
    root: PhysAddr,
    va: VirtAddr,
    create: bool,
    target_depth: usize,
) -> Result<*mut F::Repr, WalkError> {
    debug_assert!(target_depth < F::LEVELS);
    let mut table = root;
    for depth in 0..target_depth {
        let slot = slot_at::<F>(table, va, depth);
        // SAFETY: slot_at keeps the pointer inside the table frame.
        let pte = unsafe { *slot };
        if F::is_present(pte) {
            if F::flags(pte).contains(PteFlags::HUGE) {
                return Err(WalkError::HugeInPath);
            }
            table = F::addr(pte);
        } else {
            if !create {
                return Err(WalkError::NotMapped);
            }
            let new_table = FRAME_ALLOCATOR
                .lock()
                .alloc_frame()
                .ok_or(WalkError::NoMem)?;
            // Fresh frames come back zeroed, so the new table is all empty
            // entries already.
            // SAFETY: Writing the parent slot we just read; exclusive access
            // is the caller's per-address-space lock.
            unsafe { *slot = F::make_table(new_table) };
            table = new_table;
        }
    }
    Ok(slot_at::<F>(table, va, target_depth))
}

/// Walk without creating; convenience wrapper.
pub fn walk_existing<F: PteFormat>(root: PhysAddr, va: VirtAddr) -> Result<*mut F::Repr, WalkError> {
    walk::<F>(root, va, false)
}

/// Visit the leaf entry for `va` if the whole path down to it is present.
/// Unlike [`walk`], a huge entry above the leaf is returned as the mapping
/// itself (second tuple field = depth it was found at).
pub fn find_mapping<F: PteFormat>(
    root: PhysAddr,
    va: VirtAddr,
) -> Option<(F::Repr, usize)> {
    let mut table = root;
    for depth in 0..F::LEVELS {
        let slot = slot_at::<F>(table, va, depth);
        // SAFETY: slot_at keeps the pointer inside the table frame.
        let pte = unsafe { *slot };
        if !F::is_present(pte) {
            return None;
        }
        if depth == F::LEVELS - 1 || F::flags(pte).contains(PteFlags::HUGE) {
            return Some((pte, depth));
        }
        table = F::addr(pte);
    }
    None
}
