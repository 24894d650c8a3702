//! Memory-layer integration tests: address types, the three PTE formats,
//! and the capability tables, exercised through the public API.

use castor_kernel::arch::caps::{ARM64_CAPS, IA32_CAPS, X64_CAPS};
use castor_kernel::arch::pte::{Arm64, Ia32, PteFlags, PteFormat, X64};
use castor_kernel::mm::{PageFrame, PhysAddr, VirtAddr, PAGE_SIZE};

#[test]
fn pfn_conversion_roundtrip() {
    for pa in (0..64u64).map(|i| i * PAGE_SIZE as u64) {
        assert_eq!(PageFrame::new(pa >> 12).addr(), PhysAddr::new(pa));
        assert_eq!(PhysAddr::new(pa).frame().addr().as_u64(), pa);
    }
}

#[test]
fn pte_layout_anchors_per_architecture() {
    let f = PteFlags::PRESENT | PteFlags::WRITE;

    // x86 family: literal encodings.
    assert_eq!(X64::make(PhysAddr::new(0x1000), f), 0x1003);
    assert_eq!(Ia32::make(PhysAddr::new(0x1000), f), 0x1003);

    // ARM64: different bits, same logical recovery.
    let pte = Arm64::make(PhysAddr::new(0x1000), f);
    assert_eq!(Arm64::addr(pte), PhysAddr::new(0x1000));
    let flags = Arm64::flags(pte);
    assert!(flags.contains(PteFlags::PRESENT));
    assert!(flags.contains(PteFlags::WRITE));
}

#[test]
fn cow_bit_lives_in_software_bits() {
    let f = PteFlags::PRESENT | PteFlags::USER | PteFlags::COW;
    // AVL bit 9 on the x86 family.
    assert_ne!(X64::make(PhysAddr::new(0), f) & (1 << 9), 0);
    assert_ne!(Ia32::make(PhysAddr::new(0), f) & (1 << 9), 0);
    // Software bit 56 on ARM64.
    assert_ne!(Arm64::make(PhysAddr::new(0), f) & (1 << 56), 0);
}

#[test]
fn setting_cow_then_querying_reports_readonly() {
    // The COW => !WRITE rule is applied by the mapper on every ISA; at the
    // encoder level a COW+WRITE set must at least round-trip per format so
    // the mapper's normalization is observable.
    for (name, pte, flags) in [
        (
            "x86_64",
            X64::make(PhysAddr::new(0x2000), PteFlags::PRESENT | PteFlags::COW),
            X64::flags(X64::make(PhysAddr::new(0x2000), PteFlags::PRESENT | PteFlags::COW)),
        ),
        (
            "arm64",
            Arm64::make(PhysAddr::new(0x2000), PteFlags::PRESENT | PteFlags::COW),
            Arm64::flags(Arm64::make(
                PhysAddr::new(0x2000),
                PteFlags::PRESENT | PteFlags::COW,
            )),
        ),
    ] {
        let _ = pte;
        assert!(flags.contains(PteFlags::COW), "{name}");
        assert!(!flags.contains(PteFlags::WRITE), "{name}");
    }
}

#[test]
fn kernel_and_user_predicates_per_isa() {
    for caps in [&IA32_CAPS, &X64_CAPS, &ARM64_CAPS] {
        // Kernel base itself is a kernel address; user end is a user one.
        assert!(caps.is_kernel_addr(caps.kernel_base));
        assert!(caps.is_user_addr(caps.user_space_end));
        // The two ranges never overlap.
        assert!(!(caps.is_kernel_addr(caps.user_space_end)));
        assert!(!(caps.is_user_addr(caps.kernel_base)));
        // Every address is user, kernel, or in the canonical gap.
        for probe in [0u64, 0x40_0000, caps.kernel_base, u64::MAX, 1 << 47] {
            let classes = caps.is_user_addr(probe) as u8
                + caps.is_kernel_addr(probe) as u8
                + caps.is_canonical_gap(probe) as u8;
            assert_eq!(classes, 1, "{}: {:#x}", caps.arch_name, probe);
        }
    }
}

#[test]
fn walker_geometry_constants() {
    assert_eq!(Ia32::LEVELS, 2);
    assert_eq!(Ia32::ENTRIES, 1024);
    assert_eq!(X64::LEVELS, 4);
    assert_eq!(X64::ENTRIES, 512);
    assert_eq!(Arm64::LEVELS, 4);
    assert_eq!(Arm64::ENTRIES, 512);

    // A table of entries exactly spans one page on every format.
    assert_eq!(Ia32::ENTRIES * core::mem::size_of::<u32>(), PAGE_SIZE);
    assert_eq!(X64::ENTRIES * core::mem::size_of::<u64>(), PAGE_SIZE);
}

#[test]
fn va_index_selects_disjoint_bits() {
    // Two addresses differing only in one level's bits index differently
    // at that level and identically elsewhere.
    let a = VirtAddr::new(0x0000_0040_0000_0000);
    let b = VirtAddr::new(0x0000_0040_0020_0000);
    assert_eq!(X64::va_index(a, 0), X64::va_index(b, 0));
    assert_eq!(X64::va_index(a, 1), X64::va_index(b, 1));
    assert_ne!(X64::va_index(a, 2), X64::va_index(b, 2));
    assert_eq!(X64::va_index(a, 3), X64::va_index(b, 3));
}
