//! Page-table entry formats
//!
//! One [`PteFormat`] implementation per ISA maps the architecture-neutral
//! flag set onto real hardware bits. The encoders are pure integer math and
//! compile on every target, so the whole matrix is covered by the host test
//! suite; [`NativeFormat`] selects the one the running kernel walks with.
//!
//! Encoding quirks worth knowing:
//! - `EXEC` is positive logic everywhere. `pte_make` never sets NX on its
//!   own; the mapper clears `EXEC` through [`PteFormat::modify`] for
//!   non-executable mappings on ISAs where the capability table reports NX.
//! - `COW` lives in a hardware-ignored bit: AVL9 on x86, bit 56 on ARM64.
//! - On ARM64 the write/global/exec senses are inverted in hardware
//!   (AP[2], nG, UXN/PXN); the encoder hides that.

use bitflags::bitflags;

use crate::mm::addr::{PhysAddr, VirtAddr};

bitflags! {
    /// Architecture-neutral PTE flag set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u16 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const NOCACHE  = 1 << 3;
        const EXEC     = 1 << 4;
        const COW      = 1 << 5;
        const DIRTY    = 1 << 6;
        const ACCESSED = 1 << 7;
        const HUGE     = 1 << 8;
        const GLOBAL   = 1 << 9;
    }
}

/// A page-table entry format: bit layout plus walker geometry.
pub trait PteFormat {
    /// Raw entry representation (u32 on i686, u64 elsewhere).
    type Repr: Copy + PartialEq + core::fmt::Debug;

    /// Number of translation levels (2 on i686, 4 on x86_64/ARM64).
    const LEVELS: usize;

    /// Entries per table (1024 on i686, 512 elsewhere).
    const ENTRIES: usize;

    /// Flags this format can round-trip through make()/flags().
    const LOGICAL_MASK: PteFlags;

    /// Empty (not-present, unused) entry.
    const EMPTY: Self::Repr;

    /// Short architecture name for diagnostics.
    const NAME: &'static str;

    /// Build an entry from a page-aligned frame address and logical flags.
    fn make(pa: PhysAddr, flags: PteFlags) -> Self::Repr;

    /// Extract the frame address.
    fn addr(pte: Self::Repr) -> PhysAddr;

    /// Decode the logical flags.
    fn flags(pte: Self::Repr) -> PteFlags;

    /// Set and clear logical flags without touching the frame address.
    fn modify(pte: Self::Repr, set: PteFlags, clear: PteFlags) -> Self::Repr;

    /// Build an intermediate (non-leaf) table entry pointing at `pa`.
    ///
    /// The x86 family encodes `PRESENT|WRITE|USER` so leaf flags stay
    /// authoritative; formats whose table descriptors carry hierarchical
    /// controls override this.
    fn make_table(pa: PhysAddr) -> Self::Repr {
        Self::make(
            pa,
            PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
        )
    }

    /// Table index of `va` at walk depth `depth` (0 = root).
    fn va_index(va: VirtAddr, depth: usize) -> usize;

    fn is_present(pte: Self::Repr) -> bool {
        Self::flags(pte).contains(PteFlags::PRESENT)
    }

    fn is_unused(pte: Self::Repr) -> bool {
        pte == Self::EMPTY
    }
}

// ---------------------------------------------------------------------------
// i686: 2-level, 1024-entry tables, 32-bit entries
// ---------------------------------------------------------------------------

/// i686 legacy 32-bit paging: `[frame20 | flags12]`.
pub struct Ia32;

impl Ia32 {
    const P: u32 = 1 << 0;
    const RW: u32 = 1 << 1;
    const US: u32 = 1 << 2;
    const PCD: u32 = 1 << 4;
    const A: u32 = 1 << 5;
    const D: u32 = 1 << 6;
    const PS: u32 = 1 << 7;
    const G: u32 = 1 << 8;
    const SW_COW: u32 = 1 << 9;
    const FRAME_MASK: u32 = 0xFFFF_F000;

    fn to_hw(flags: PteFlags) -> u32 {
        let mut hw = 0;
        if flags.contains(PteFlags::PRESENT) {
            hw |= Self::P;
        }
        if flags.contains(PteFlags::WRITE) {
            hw |= Self::RW;
        }
        if flags.contains(PteFlags::USER) {
            hw |= Self::US;
        }
        if flags.contains(PteFlags::NOCACHE) {
            hw |= Self::PCD;
        }
        if flags.contains(PteFlags::ACCESSED) {
            hw |= Self::A;
        }
        if flags.contains(PteFlags::DIRTY) {
            hw |= Self::D;
        }
        if flags.contains(PteFlags::HUGE) {
            hw |= Self::PS;
        }
        if flags.contains(PteFlags::GLOBAL) {
            hw |= Self::G;
        }
        if flags.contains(PteFlags::COW) {
            hw |= Self::SW_COW;
        }
        hw
    }
}

impl PteFormat for Ia32 {
    type Repr = u32;

    const LEVELS: usize = 2;
    const ENTRIES: usize = 1024;
    const LOGICAL_MASK: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITE)
        .union(PteFlags::USER)
        .union(PteFlags::NOCACHE)
        .union(PteFlags::COW)
        .union(PteFlags::DIRTY)
        .union(PteFlags::ACCESSED)
        .union(PteFlags::HUGE)
        .union(PteFlags::GLOBAL);
    const EMPTY: u32 = 0;
    const NAME: &'static str = "i686";

    fn make(pa: PhysAddr, flags: PteFlags) -> u32 {
        // Upper physical bits are zero on i686 by the PhysAddr contract.
        (pa.as_u64() as u32 & Self::FRAME_MASK) | Self::to_hw(flags)
    }

    fn addr(pte: u32) -> PhysAddr {
        PhysAddr::new((pte & Self::FRAME_MASK) as u64)
    }

    fn flags(pte: u32) -> PteFlags {
        let mut f = PteFlags::empty();
        if pte & Self::P != 0 {
            f |= PteFlags::PRESENT;
        }
        if pte & Self::RW != 0 {
            f |= PteFlags::WRITE;
        }
        if pte & Self::US != 0 {
            f |= PteFlags::USER;
        }
        if pte & Self::PCD != 0 {
            f |= PteFlags::NOCACHE;
        }
        if pte & Self::A != 0 {
            f |= PteFlags::ACCESSED;
        }
        if pte & Self::D != 0 {
            f |= PteFlags::DIRTY;
        }
        if pte & Self::PS != 0 {
            f |= PteFlags::HUGE;
        }
        if pte & Self::G != 0 {
            f |= PteFlags::GLOBAL;
        }
        if pte & Self::SW_COW != 0 {
            f |= PteFlags::COW;
        }
        f
    }

    fn modify(pte: u32, set: PteFlags, clear: PteFlags) -> u32 {
        // EXEC has no bit here; setting or clearing it is a no-op.
        let merged = (Self::flags(pte) | (set & Self::LOGICAL_MASK)) - (clear & Self::LOGICAL_MASK);
        (pte & Self::FRAME_MASK) | Self::to_hw(merged)
    }

    fn va_index(va: VirtAddr, depth: usize) -> usize {
        match depth {
            0 => (va.as_usize() >> 22) & 0x3FF,
            _ => (va.as_usize() >> 12) & 0x3FF,
        }
    }
}

// ---------------------------------------------------------------------------
// x86_64: 4-level, 512-entry tables, 64-bit entries
// ---------------------------------------------------------------------------

/// x86_64 long-mode paging: frame in bits [12:51], NX in bit 63, COW in AVL9.
pub struct X64;

impl X64 {
    const P: u64 = 1 << 0;
    const RW: u64 = 1 << 1;
    const US: u64 = 1 << 2;
    const PCD: u64 = 1 << 4;
    const A: u64 = 1 << 5;
    const D: u64 = 1 << 6;
    const PS: u64 = 1 << 7;
    const G: u64 = 1 << 8;
    const SW_COW: u64 = 1 << 9;
    const NX: u64 = 1 << 63;
    const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    fn to_hw(flags: PteFlags) -> u64 {
        let mut hw = 0;
        if flags.contains(PteFlags::PRESENT) {
            hw |= Self::P;
        }
        if flags.contains(PteFlags::WRITE) {
            hw |= Self::RW;
        }
        if flags.contains(PteFlags::USER) {
            hw |= Self::US;
        }
        if flags.contains(PteFlags::NOCACHE) {
            hw |= Self::PCD;
        }
        if flags.contains(PteFlags::ACCESSED) {
            hw |= Self::A;
        }
        if flags.contains(PteFlags::DIRTY) {
            hw |= Self::D;
        }
        if flags.contains(PteFlags::HUGE) {
            hw |= Self::PS;
        }
        if flags.contains(PteFlags::GLOBAL) {
            hw |= Self::G;
        }
        if flags.contains(PteFlags::COW) {
            hw |= Self::SW_COW;
        }
        hw
    }
}

impl PteFormat for X64 {
    type Repr = u64;

    const LEVELS: usize = 4;
    const ENTRIES: usize = 512;
    const LOGICAL_MASK: PteFlags = Ia32::LOGICAL_MASK;
    const EMPTY: u64 = 0;
    const NAME: &'static str = "x86_64";

    fn make(pa: PhysAddr, flags: PteFlags) -> u64 {
        (pa.as_u64() & Self::FRAME_MASK) | Self::to_hw(flags)
    }

    fn addr(pte: u64) -> PhysAddr {
        PhysAddr::new(pte & Self::FRAME_MASK)
    }

    fn flags(pte: u64) -> PteFlags {
        let mut f = PteFlags::empty();
        if pte & Self::P != 0 {
            f |= PteFlags::PRESENT;
        }
        if pte & Self::RW != 0 {
            f |= PteFlags::WRITE;
        }
        if pte & Self::US != 0 {
            f |= PteFlags::USER;
        }
        if pte & Self::PCD != 0 {
            f |= PteFlags::NOCACHE;
        }
        if pte & Self::A != 0 {
            f |= PteFlags::ACCESSED;
        }
        if pte & Self::D != 0 {
            f |= PteFlags::DIRTY;
        }
        if pte & Self::PS != 0 {
            f |= PteFlags::HUGE;
        }
        if pte & Self::G != 0 {
            f |= PteFlags::GLOBAL;
        }
        if pte & Self::SW_COW != 0 {
            f |= PteFlags::COW;
        }
        if pte & Self::NX == 0 {
            f |= PteFlags::EXEC;
        }
        f
    }

    fn modify(pte: u64, set: PteFlags, clear: PteFlags) -> u64 {
        let low = Self::flags(pte) & Self::LOGICAL_MASK;
        let merged = (low | (set & Self::LOGICAL_MASK)) - (clear & Self::LOGICAL_MASK);
        let mut out = (pte & (Self::FRAME_MASK | Self::NX)) | Self::to_hw(merged);
        // EXEC inverts to NX; an explicit clear is the only thing that sets it.
        if set.contains(PteFlags::EXEC) {
            out &= !Self::NX;
        } else if clear.contains(PteFlags::EXEC) {
            out |= Self::NX;
        }
        out
    }

    fn va_index(va: VirtAddr, depth: usize) -> usize {
        let shift = 12 + 9 * (Self::LEVELS - 1 - depth);
        (va.as_u64() >> shift) as usize & 0x1FF
    }
}

// ---------------------------------------------------------------------------
// ARM64: 4-level, 512-entry tables, 4 KiB granule
// ---------------------------------------------------------------------------

/// ARMv8-A stage-1 descriptors, 4 KiB granule, frame in bits [12:47].
///
/// Hardware senses are inverted for write (AP[2] = read-only), global
/// (nG = non-global) and exec (UXN/PXN = no-execute); the encoder presents
/// the positive logical flags regardless.
pub struct Arm64;

impl Arm64 {
    const VALID: u64 = 1 << 0;
    /// Page/table descriptor marker; clear means block (huge) at L1/L2.
    const PAGE: u64 = 1 << 1;
    /// AttrIndx[0]: index 1 selects device (uncached) memory in MAIR_EL1.
    const ATTR_DEVICE: u64 = 1 << 2;
    /// AP[1]: EL0 accessible.
    const AP_EL0: u64 = 1 << 6;
    /// AP[2]: read-only.
    const AP_RO: u64 = 1 << 7;
    /// SH[1:0] = inner shareable.
    const SH_INNER: u64 = 0b11 << 8;
    /// Access flag.
    const AF: u64 = 1 << 10;
    /// Not-global.
    const NG: u64 = 1 << 11;
    const PXN: u64 = 1 << 53;
    const UXN: u64 = 1 << 54;
    /// Software dirty bit (bits 55-58 are ignored by hardware).
    const SW_DIRTY: u64 = 1 << 55;
    /// Software COW bit.
    const SW_COW: u64 = 1 << 56;
    const FRAME_MASK: u64 = 0x0000_FFFF_FFFF_F000;
}

impl PteFormat for Arm64 {
    type Repr = u64;

    const LEVELS: usize = 4;
    const ENTRIES: usize = 512;
    const LOGICAL_MASK: PteFlags = Ia32::LOGICAL_MASK.union(PteFlags::EXEC);
    const EMPTY: u64 = 0;
    const NAME: &'static str = "arm64";

    fn make(pa: PhysAddr, flags: PteFlags) -> u64 {
        let mut pte = pa.as_u64() & Self::FRAME_MASK;
        if flags.contains(PteFlags::PRESENT) {
            pte |= Self::VALID | Self::SH_INNER;
        }
        if !flags.contains(PteFlags::HUGE) {
            pte |= Self::PAGE;
        }
        if flags.contains(PteFlags::NOCACHE) {
            pte |= Self::ATTR_DEVICE;
        }
        if flags.contains(PteFlags::USER) {
            pte |= Self::AP_EL0;
        }
        if !flags.contains(PteFlags::WRITE) {
            pte |= Self::AP_RO;
        }
        if flags.contains(PteFlags::ACCESSED) {
            pte |= Self::AF;
        }
        if !flags.contains(PteFlags::GLOBAL) {
            pte |= Self::NG;
        }
        if flags.contains(PteFlags::DIRTY) {
            pte |= Self::SW_DIRTY;
        }
        if flags.contains(PteFlags::COW) {
            pte |= Self::SW_COW;
        }
        if !flags.contains(PteFlags::EXEC) {
            pte |= Self::UXN | Self::PXN;
        }
        pte
    }

    fn addr(pte: u64) -> PhysAddr {
        PhysAddr::new(pte & Self::FRAME_MASK)
    }

    fn flags(pte: u64) -> PteFlags {
        let mut f = PteFlags::empty();
        if pte & Self::VALID != 0 {
            f |= PteFlags::PRESENT;
        }
        if pte & Self::PAGE == 0 {
            f |= PteFlags::HUGE;
        }
        if pte & Self::ATTR_DEVICE != 0 {
            f |= PteFlags::NOCACHE;
        }
        if pte & Self::AP_EL0 != 0 {
            f |= PteFlags::USER;
        }
        if pte & Self::AP_RO == 0 {
            f |= PteFlags::WRITE;
        }
        if pte & Self::AF != 0 {
            f |= PteFlags::ACCESSED;
        }
        if pte & Self::NG == 0 {
            f |= PteFlags::GLOBAL;
        }
        if pte & Self::SW_DIRTY != 0 {
            f |= PteFlags::DIRTY;
        }
        if pte & Self::SW_COW != 0 {
            f |= PteFlags::COW;
        }
        if pte & Self::UXN == 0 {
            f |= PteFlags::EXEC;
        }
        f
    }

    fn modify(pte: u64, set: PteFlags, clear: PteFlags) -> u64 {
        let merged = (Self::flags(pte) | (set & Self::LOGICAL_MASK)) - (clear & Self::LOGICAL_MASK);
        Self::make(Self::addr(pte), merged)
    }

    fn va_index(va: VirtAddr, depth: usize) -> usize {
        let shift = 12 + 9 * (Self::LEVELS - 1 - depth);
        (va.as_u64() >> shift) as usize & 0x1FF
    }

    /// Bits [53:54] of a table descriptor are the hierarchical
    /// UXNTable/PXNTable controls, so a bare VALID|TABLE descriptor is the
    /// only correct parent entry; permissions live in the leaves.
    fn make_table(pa: PhysAddr) -> u64 {
        (pa.as_u64() & Self::FRAME_MASK) | Self::VALID | Self::PAGE
    }
}

// ---------------------------------------------------------------------------
// Native selection
// ---------------------------------------------------------------------------

/// The format the running kernel's walker uses.
#[cfg(target_arch = "x86")]
pub type NativeFormat = Ia32;
#[cfg(target_arch = "x86_64")]
pub type NativeFormat = X64;
#[cfg(target_arch = "aarch64")]
pub type NativeFormat = Arm64;

#[cfg(test)]
mod tests {
    use super::*;

    /// Enumerate every subset of `mask` (spec property: round-trip for all
    /// page-aligned addresses and all representable flag subsets).
    fn subsets(mask: PteFlags) -> impl Iterator<Item = PteFlags> {
        let bits = mask.bits();
        (0u32..=u16::MAX as u32)
            .map(|raw| raw as u16)
            .filter(move |raw| raw & !bits == 0)
            .map(PteFlags::from_bits_truncate)
    }

    fn roundtrip<F: PteFormat>(pa: u64) {
        for f in subsets(F::LOGICAL_MASK) {
            let pte = F::make(PhysAddr::new(pa), f);
            assert_eq!(F::addr(pte).as_u64(), pa, "{}: paddr for {:?}", F::NAME, f);
            assert_eq!(
                F::flags(pte) & F::LOGICAL_MASK,
                f,
                "{}: flags for {:?}",
                F::NAME,
                f
            );
        }
    }

    #[test]
    fn ia32_roundtrip() {
        for pa in [0u64, 0x1000, 0x100000, 0xFFFF_F000] {
            roundtrip::<Ia32>(pa);
        }
    }

    #[test]
    fn x64_roundtrip() {
        for pa in [0u64, 0x1000, 0x100000, 0xF_FFFF_FFFF_F000] {
            roundtrip::<X64>(pa);
        }
    }

    #[test]
    fn arm64_roundtrip() {
        for pa in [0u64, 0x1000, 0x100000, 0xFFFF_FFFF_F000] {
            roundtrip::<Arm64>(pa);
        }
    }

    #[test]
    fn multi_arch_layout_anchor_values() {
        // x86 family: PRESENT|WRITE at 0x1000 is literally 0x1003.
        let f = PteFlags::PRESENT | PteFlags::WRITE;
        assert_eq!(X64::make(PhysAddr::new(0x1000), f), 0x1003);
        assert_eq!(Ia32::make(PhysAddr::new(0x1000), f), 0x1003);

        // ARM64 uses different bits but recovers the same address and flags.
        let pte = Arm64::make(PhysAddr::new(0x1000), f);
        assert_ne!(pte, 0x1003);
        assert_eq!(Arm64::addr(pte).as_u64(), 0x1000);
        assert_eq!(Arm64::flags(pte) & f, f);
        assert!(!Arm64::flags(pte).contains(PteFlags::EXEC));
    }

    #[test]
    fn exec_clears_through_modify() {
        let f = PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER;
        let pte = X64::make(PhysAddr::new(0x4000), f);
        // Fresh x86 entries are executable until EXEC is explicitly cleared.
        assert!(X64::flags(pte).contains(PteFlags::EXEC));
        let nx = X64::modify(pte, PteFlags::empty(), PteFlags::EXEC);
        assert!(!X64::flags(nx).contains(PteFlags::EXEC));
        assert_eq!(X64::addr(nx).as_u64(), 0x4000);
        // And re-setting EXEC drops NX again.
        let back = X64::modify(nx, PteFlags::EXEC, PteFlags::empty());
        assert!(X64::flags(back).contains(PteFlags::EXEC));

        // i686 has no NX bit; the modify is a no-op there.
        let pte = Ia32::make(PhysAddr::new(0x4000), f);
        let same = Ia32::modify(pte, PteFlags::empty(), PteFlags::EXEC);
        assert_eq!(pte, same);
    }

    #[test]
    fn modify_preserves_address_and_untouched_flags() {
        for_each_format_modify::<Ia32>();
        for_each_format_modify::<X64>();
        for_each_format_modify::<Arm64>();
    }

    fn for_each_format_modify<F: PteFormat>() {
        let base = PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITE;
        let pte = F::make(PhysAddr::new(0x7000), base);
        let cow = F::modify(pte, PteFlags::COW, PteFlags::WRITE);
        assert_eq!(F::addr(cow).as_u64(), 0x7000, "{}", F::NAME);
        let f = F::flags(cow);
        assert!(f.contains(PteFlags::COW), "{}", F::NAME);
        assert!(!f.contains(PteFlags::WRITE), "{}", F::NAME);
        assert!(f.contains(PteFlags::PRESENT | PteFlags::USER), "{}", F::NAME);
    }

    #[test]
    fn va_index_geometry() {
        // i686: 10-bit indices at both levels.
        let va = VirtAddr::new(0x8040_3000);
        assert_eq!(Ia32::va_index(va, 0), 0x8040_3000 >> 22);
        assert_eq!(Ia32::va_index(va, 1), (0x8040_3000 >> 12) & 0x3FF);

        // 64-bit formats: 9-bit indices, leaf at depth 3.
        let va = VirtAddr::new(0x0000_7FFF_DEAD_B000_usize);
        for depth in 0..4 {
            let shift = 12 + 9 * (3 - depth);
            assert_eq!(
                X64::va_index(va, depth),
                (0x0000_7FFF_DEAD_B000_usize >> shift) & 0x1FF
            );
            assert_eq!(X64::va_index(va, depth), Arm64::va_index(va, depth));
        }
    }
}
