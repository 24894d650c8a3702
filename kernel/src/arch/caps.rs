//! HAL capability table
//!
//! One compile-time record per ISA describing what the hardware can do and
//! how its address space is carved up. All three tables are plain consts so
//! the invariants (disjoint kernel/user ranges, canonical gaps) are testable
//! from any host; [`hal_capabilities`] returns the native one.

/// Queryable capability bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cap {
    HugePages,
    Nx,
    PortIo,
    CacheCoherentDma,
    Iommu,
    Smp,
    Fpu,
    Simd,
}

/// Per-ISA capability record.
#[derive(Debug, Clone, Copy)]
pub struct HalCapabilities {
    pub huge_pages: bool,
    pub nx: bool,
    pub port_io: bool,
    pub cache_coherent_dma: bool,
    pub iommu: bool,
    pub smp: bool,
    pub fpu: bool,
    pub simd: bool,
    pub page_table_levels: u8,
    pub page_sizes: &'static [usize],
    pub phys_addr_bits: u8,
    pub virt_addr_bits: u8,
    /// Lowest kernel virtual address; the direct map starts here.
    pub kernel_base: u64,
    /// Highest user virtual address (inclusive).
    pub user_space_end: u64,
    pub gpr_count: u8,
    pub gpr_size: u8,
    /// Size of the per-arch CPU context struct in bytes.
    pub context_size: usize,
    pub arch_name: &'static str,
}

impl HalCapabilities {
    pub fn has(&self, cap: Cap) -> bool {
        match cap {
            Cap::HugePages => self.huge_pages,
            Cap::Nx => self.nx,
            Cap::PortIo => self.port_io,
            Cap::CacheCoherentDma => self.cache_coherent_dma,
            Cap::Iommu => self.iommu,
            Cap::Smp => self.smp,
            Cap::Fpu => self.fpu,
            Cap::Simd => self.simd,
        }
    }

    /// Kernel half: everything at or above `kernel_base`.
    pub fn is_kernel_addr(&self, v: u64) -> bool {
        v >= self.kernel_base
    }

    /// User half: everything at or below `user_space_end`.
    pub fn is_user_addr(&self, v: u64) -> bool {
        v <= self.user_space_end
    }

    /// Neither kernel nor user: the architectural canonical-address gap.
    pub fn is_canonical_gap(&self, v: u64) -> bool {
        !self.is_user_addr(v) && !self.is_kernel_addr(v)
    }
}

/// i686: 2-level legacy paging, no NX, PSE 4 MiB pages.
pub const IA32_CAPS: HalCapabilities = HalCapabilities {
    huge_pages: true,
    nx: false,
    port_io: true,
    cache_coherent_dma: true,
    iommu: false,
    smp: false,
    fpu: true,
    simd: true,
    page_table_levels: 2,
    page_sizes: &[4096, 4 * 1024 * 1024],
    phys_addr_bits: 32,
    virt_addr_bits: 32,
    kernel_base: 0x8000_0000,
    user_space_end: 0x7FFF_FFFF,
    gpr_count: 8,
    gpr_size: 4,
    context_size: 44,
    arch_name: "i686",
};

/// x86_64: 4-level long mode, NX, 2 MiB / 1 GiB pages.
pub const X64_CAPS: HalCapabilities = HalCapabilities {
    huge_pages: true,
    nx: true,
    port_io: true,
    cache_coherent_dma: true,
    iommu: false,
    smp: false,
    fpu: true,
    simd: true,
    page_table_levels: 4,
    page_sizes: &[4096, 2 * 1024 * 1024, 1024 * 1024 * 1024],
    phys_addr_bits: 52,
    virt_addr_bits: 48,
    kernel_base: 0xFFFF_8000_0000_0000,
    user_space_end: 0x0000_7FFF_FFFF_FFFF,
    gpr_count: 16,
    gpr_size: 8,
    context_size: 104,
    arch_name: "x86_64",
};

/// ARM64: 4-level 4 KiB granule, UXN/PXN, no port I/O.
pub const ARM64_CAPS: HalCapabilities = HalCapabilities {
    huge_pages: true,
    nx: true,
    port_io: false,
    cache_coherent_dma: false,
    iommu: false,
    smp: false,
    fpu: true,
    simd: true,
    page_table_levels: 4,
    page_sizes: &[4096, 2 * 1024 * 1024, 1024 * 1024 * 1024],
    phys_addr_bits: 48,
    virt_addr_bits: 48,
    kernel_base: 0xFFFF_0000_0000_0000,
    user_space_end: 0x0000_FFFF_FFFF_FFFF,
    gpr_count: 31,
    gpr_size: 8,
    context_size: 136,
    arch_name: "arm64",
};

/// Capability table for the architecture this kernel was built for.
pub fn hal_capabilities() -> &'static HalCapabilities {
    #[cfg(target_arch = "x86")]
    {
        &IA32_CAPS
    }
    #[cfg(target_arch = "x86_64")]
    {
        &X64_CAPS
    }
    #[cfg(target_arch = "aarch64")]
    {
        &ARM64_CAPS
    }
}

/// Convenience accessor: does the native architecture have `cap`?
pub fn hal_has(cap: Cap) -> bool {
    hal_capabilities().has(cap)
}
