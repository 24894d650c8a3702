//! Device-tree handoff parsing (ARM64)
//!
//! QEMU/firmware leaves a flattened device tree pointer in X0. The `fdt`
//! crate does the heavy lifting; this adapter lifts `/memory`, the
//! reservation block, and `/chosen` into the canonical [`BootInfo`].

use fdt::Fdt;

use super::{BootInfo, BootInfoError, BootProtocol, MemoryKind, MemoryRange};

/// Normalize a DTB handoff.
///
/// # Safety
///
/// `ptr` must point at a mapped, well-formed (or at least header-readable)
/// flattened device tree.
pub unsafe fn parse(ptr: usize) -> Result<BootInfo, BootInfoError> {
    if ptr == 0 {
        return Err(BootInfoError::Truncated);
    }
    // SAFETY: Caller contract; the crate validates the header magic and
    // internal offsets before handing out a parser.
    let fdt = unsafe { Fdt::from_ptr(ptr as *const u8) }.map_err(|e| match e {
        fdt::FdtError::BadMagic => BootInfoError::MissingMagic,
        _ => BootInfoError::Truncated,
    })?;

    let mut out = BootInfo::new(BootProtocol::DeviceTree, ptr);

    for region in fdt.memory().regions() {
        out.push_range(MemoryRange {
            base: region.starting_address as u64,
            length: region.size.unwrap_or(0) as u64,
            kind: MemoryKind::Usable,
        });
    }

    for rsv in fdt.memory_reservations() {
        out.push_range(MemoryRange {
            base: rsv.address() as u64,
            length: rsv.size() as u64,
            kind: MemoryKind::Reserved,
        });
    }

    out.cmdline = fdt.chosen().bootargs();

    log::debug!(
        target: "boot",
        "DTB: model '{}', {} MiB usable",
        fdt.root().model(),
        out.total_usable() / (1024 * 1024)
    );
    Ok(out)
}
