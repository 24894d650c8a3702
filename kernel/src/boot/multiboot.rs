//! Multiboot1 handoff parsing
//!
//! GRUB leaves the magic `0x2BADB002` in a register and a pointer to the
//! info structure; the memory map is a chain of variable-size entries. The
//! parser rejects a wrong magic with `MissingMagic` and structurally
//! impossible data with `Truncated` rather than walking off into the weeds.

use super::{
    BootInfo, BootInfoError, BootModule, BootProtocol, FramebufferInfo, MemoryKind, MemoryRange,
};

/// Magic the bootloader must hand over in the register.
pub const MULTIBOOT_MAGIC: u32 = 0x2BAD_B002;

// Flag bits of `MbInfo::flags`.
const FLAG_MEM: u32 = 1 << 0;
const FLAG_CMDLINE: u32 = 1 << 2;
const FLAG_MODS: u32 = 1 << 3;
const FLAG_MMAP: u32 = 1 << 6;
const FLAG_FRAMEBUFFER: u32 = 1 << 12;

/// Sanity cap on the mmap blob; a real map is a few hundred bytes.
const MAX_MMAP_BYTES: u32 = 8192;

/// Fixed head of the multiboot1 info structure. Carried in full even
/// though only a few fields are consumed; the offsets are the ABI.
#[allow(dead_code)]
#[repr(C)]
struct MbInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
    drives_length: u32,
    drives_addr: u32,
    config_table: u32,
    boot_loader_name: u32,
    apm_table: u32,
    vbe: [u32; 6],
    framebuffer_addr: u64,
    framebuffer_pitch: u32,
    framebuffer_width: u32,
    framebuffer_height: u32,
    framebuffer_bpp: u8,
    framebuffer_type: u8,
    color_info: [u8; 6],
}

/// One memory-map entry. `size` counts the bytes *after* itself, so the
/// next entry sits at `entry + size + 4`.
#[repr(C, packed)]
struct MbMmapEntry {
    size: u32,
    base: u64,
    length: u64,
    kind: u32,
}

/// One module record.
#[repr(C)]
struct MbModule {
    start: u32,
    end: u32,
    cmdline: u32,
    _pad: u32,
}

fn kind_of(raw: u32) -> MemoryKind {
    match raw {
        1 => MemoryKind::Usable,
        3 => MemoryKind::AcpiReclaimable,
        4 => MemoryKind::AcpiNvs,
        5 => MemoryKind::Bad,
        _ => MemoryKind::Reserved,
    }
}

/// Read a NUL-terminated bootloader string. The pointer lives in
/// bootloader-owned memory that stays mapped, hence the 'static.
///
/// # Safety
///
/// `ptr` must be a readable NUL-terminated string or null.
unsafe fn boot_cstr(ptr: u32) -> Option<&'static str> {
    if ptr == 0 {
        return None;
    }
    // SAFETY: Contract forwarded to the caller; the length scan stops at
    // the terminator.
    let cstr = unsafe { core::ffi::CStr::from_ptr(ptr as usize as *const core::ffi::c_char) };
    cstr.to_str().ok()
}

/// Walk the variable-size memory-map chain.
///
/// # Safety
///
/// `[base, base+length)` must be readable.
unsafe fn parse_mmap_chain(
    base: usize,
    length: u32,
    out: &mut BootInfo,
) -> Result<(), BootInfoError> {
    if length > MAX_MMAP_BYTES {
        return Err(BootInfoError::Truncated);
    }
    let mut at = base;
    let end = base + length as usize;
    while at + core::mem::size_of::<MbMmapEntry>() <= end {
        // SAFETY: `at` stays inside the caller-validated window; entries
        // are packed.
        let entry = unsafe { &*(at as *const MbMmapEntry) };
        let size = entry.size;
        if size < 20 {
            // An impossible entry size means the chain is corrupt.
            return Err(BootInfoError::Truncated);
        }
        out.push_range(MemoryRange {
            base: entry.base,
            length: entry.length,
            kind: kind_of(entry.kind),
        });
        at += size as usize + 4;
    }
    Ok(())
}

/// Normalize a multiboot1 handoff.
///
/// # Safety
///
/// `info` must point at a multiboot1 info structure (or garbage -- the
/// structural checks catch the common failure shapes, which is exactly
/// their job), and any mmap/module/cmdline pointers inside it must still
/// be mapped.
pub unsafe fn parse(magic: u32, info: *const u8) -> Result<BootInfo, BootInfoError> {
    if magic != MULTIBOOT_MAGIC {
        return Err(BootInfoError::MissingMagic);
    }
    if info.is_null() {
        return Err(BootInfoError::Truncated);
    }

    // SAFETY: Caller contract; the fixed head is always present.
    let mb = unsafe { &*(info as *const MbInfo) };
    let mut out = BootInfo::new(BootProtocol::Multiboot1, info as usize);

    if mb.flags & FLAG_MMAP != 0 {
        // SAFETY: The bootloader owns [mmap_addr, mmap_addr+mmap_length).
        unsafe { parse_mmap_chain(mb.mmap_addr as usize, mb.mmap_length, &mut out)? };
    } else if mb.flags & FLAG_MEM != 0 {
        // Fallback: only lower/upper totals were provided.
        out.push_range(MemoryRange {
            base: 0,
            length: mb.mem_lower as u64 * 1024,
            kind: MemoryKind::Usable,
        });
        out.push_range(MemoryRange {
            base: 0x10_0000,
            length: mb.mem_upper as u64 * 1024,
            kind: MemoryKind::Usable,
        });
    } else {
        // A handoff without any memory information is unusable.
        return Err(BootInfoError::Truncated);
    }

    if mb.flags & FLAG_CMDLINE != 0 {
        // SAFETY: cmdline points at a bootloader-owned NUL-terminated
        // string per the multiboot spec.
        out.cmdline = unsafe { boot_cstr(mb.cmdline) };
    }

    if mb.flags & FLAG_MODS != 0 && mb.mods_count > 0 {
        for i in 0..mb.mods_count as usize {
            // SAFETY: mods_addr points at mods_count MbModule records.
            let module = unsafe {
                &*((mb.mods_addr as usize + i * core::mem::size_of::<MbModule>())
                    as *const MbModule)
            };
            out.push_module(BootModule {
                start: module.start as u64,
                end: module.end as u64,
                // SAFETY: Module cmdline follows the same string contract.
                cmdline: unsafe { boot_cstr(module.cmdline) },
            });
        }
    }

    if mb.flags & FLAG_FRAMEBUFFER != 0 {
        out.framebuffer = Some(FramebufferInfo {
            addr: mb.framebuffer_addr,
            width: mb.framebuffer_width,
            height: mb.framebuffer_height,
            pitch: mb.framebuffer_pitch,
            bpp: mb.framebuffer_bpp,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_info() -> MbInfo {
        // SAFETY: MbInfo is repr(C) POD; zero is a valid (if empty) value.
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let info = blank_info();
        let err = unsafe { parse(0xDEAD_BEEF, &info as *const MbInfo as *const u8) };
        assert_eq!(err.err(), Some(BootInfoError::MissingMagic));
    }

    #[test]
    fn null_info_is_truncated() {
        let err = unsafe { parse(MULTIBOOT_MAGIC, core::ptr::null()) };
        assert_eq!(err.err(), Some(BootInfoError::Truncated));
    }

    #[test]
    fn handoff_without_memory_info_is_truncated() {
        let info = blank_info();
        let err = unsafe { parse(MULTIBOOT_MAGIC, &info as *const MbInfo as *const u8) };
        assert_eq!(err.err(), Some(BootInfoError::Truncated));
    }

    #[test]
    fn mmap_entries_are_normalized() {
        // Build a two-entry map: usable RAM at 1 MiB, ACPI tables above.
        let entries = [
            MbMmapEntry {
                size: 20,
                base: 0x10_0000,
                length: 0x20_0000,
                kind: 1,
            },
            MbMmapEntry {
                size: 20,
                base: 0x30_0000,
                length: 0x1000,
                kind: 3,
            },
        ];

        let mut boot = BootInfo::new(BootProtocol::Multiboot1, 0);
        unsafe {
            parse_mmap_chain(
                entries.as_ptr() as usize,
                core::mem::size_of_val(&entries) as u32,
                &mut boot,
            )
        }
        .expect("well-formed chain");

        let map = boot.memory_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map[0].base, 0x10_0000);
        assert_eq!(map[0].kind, MemoryKind::Usable);
        assert_eq!(map[1].kind, MemoryKind::AcpiReclaimable);
        assert_eq!(boot.total_usable(), 0x20_0000);
    }

    #[test]
    fn corrupt_mmap_entry_is_truncated() {
        let entry = MbMmapEntry {
            size: 3, // impossible
            base: 0,
            length: 0x1000,
            kind: 1,
        };
        let mut boot = BootInfo::new(BootProtocol::Multiboot1, 0);
        let err = unsafe {
            parse_mmap_chain(
                &entry as *const MbMmapEntry as usize,
                core::mem::size_of::<MbMmapEntry>() as u32,
                &mut boot,
            )
        };
        assert_eq!(err.err(), Some(BootInfoError::Truncated));
    }

    #[test]
    fn oversized_mmap_blob_is_truncated() {
        let mut boot = BootInfo::new(BootProtocol::Multiboot1, 0);
        let err = unsafe { parse_mmap_chain(0x1000, MAX_MMAP_BYTES + 1, &mut boot) };
        assert_eq!(err.err(), Some(BootInfoError::Truncated));
    }

    #[test]
    fn lower_upper_fallback() {
        let mut info = blank_info();
        info.flags = FLAG_MEM;
        info.mem_lower = 640;
        info.mem_upper = 31 * 1024;

        let boot = unsafe { parse(MULTIBOOT_MAGIC, &info as *const MbInfo as *const u8) }
            .expect("well-formed handoff");
        assert_eq!(boot.memory_map().len(), 2);
        assert_eq!(boot.total_usable(), (640 + 31 * 1024) * 1024);
    }
}
