//! Virtual Memory Manager
//!
//! Address spaces live in an arena and are named by index handles ([`AsId`]),
//! which breaks the task/address-space ownership cycle: tasks hold an id, the
//! arena owns the spaces, and the PMM refcounts the frames underneath.
//!
//! Every space shares the kernel half by construction: creating a space
//! copies the kernel-side root entries from the kernel space, so the direct
//! map and kernel image are identical everywhere. Only the user half is
//! per-space and is torn down on destroy.

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    arch::{
        caps::hal_capabilities,
        mmu,
        pte::{NativeFormat, PteFlags, PteFormat},
    },
    error::{KernelError, KernelResult},
    mm::{
        addr::{phys_to_virt, set_direct_map_offset, PhysAddr, VirtAddr, PAGE_SIZE},
        fault::FaultInfo,
        mapper,
        pmm::FRAME_ALLOCATOR,
    },
    sync::{InitCell, SpinLock, SpinLockIrq},
};

type Fmt = NativeFormat;

/// Address-space handle. Index into the space arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsId(pub u32);

/// The kernel's own address space (slot 0, never destroyed).
pub const KERNEL_AS: AsId = AsId(0);

/// What backs a region's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Demand-zero anonymous memory.
    Anon,
    /// Backed by an external object read through the registered
    /// [`BackingReader`].
    File { backing: u64, offset: u64 },
    /// Shared between parent and child across fork (no COW).
    Shared,
}

/// A contiguous user range with uniform protection and backing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: VirtAddr,
    pub end: VirtAddr,
    pub prot: PteFlags,
    pub kind: RegionKind,
}

impl Region {
    pub fn new(base: usize, length: usize, prot: PteFlags, kind: RegionKind) -> Self {
        Self {
            base: VirtAddr::new(base),
            end: VirtAddr::new(base + length),
            prot,
            kind,
        }
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && va < self.end
    }

    pub fn len(&self) -> usize {
        self.end.as_usize() - self.base.as_usize()
    }

    pub fn is_empty(&self) -> bool {
        self.base == self.end
    }
}

/// Page-aligned addresses in `[lo, hi)`.
fn pages(lo: VirtAddr, hi: VirtAddr) -> impl Iterator<Item = VirtAddr> {
    (lo.as_usize()..hi.as_usize())
        .step_by(PAGE_SIZE)
        .map(VirtAddr::new)
}

/// One address space: root table frame plus the user region list.
pub struct AddrSpace {
    pub root: PhysAddr,
    regions: Vec<Region>,
}

struct SpaceTable {
    slots: Vec<Option<Arc<SpinLock<AddrSpace>>>>,
}

/// Arena of address spaces. The table lock covers only slot management;
/// each space carries its own lock for region/page-table mutation.
static SPACES: SpinLockIrq<SpaceTable> = SpinLockIrq::new(SpaceTable { slots: Vec::new() });

/// The currently-installed address space.
static CURRENT: AtomicU32 = AtomicU32::new(0);

/// Reader hook for file-backed regions; registered by the VFS consumer.
/// Short reads leave the remainder of the page zeroed.
pub type BackingReader = fn(backing: u64, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;

static BACKING_READER: InitCell<BackingReader> = InitCell::new();

/// Register the file-backing reader. First caller wins.
pub fn register_backing_reader(reader: BackingReader) {
    let _ = BACKING_READER.init(reader);
}

fn with_table<R>(f: impl FnOnce(&mut SpaceTable) -> R) -> R {
    let mut table = SPACES.lock();
    if table.slots.is_empty() {
        // Slot 0 is the kernel space; its root is filled in by init() on
        // real hardware and stays invalid on hosted test builds.
        table.slots.push(Some(Arc::new(SpinLock::new(AddrSpace {
            root: PhysAddr::INVALID,
            regions: Vec::new(),
        }))));
    }
    f(&mut table)
}

fn space(id: AsId) -> KernelResult<Arc<SpinLock<AddrSpace>>> {
    with_table(|t| {
        t.slots
            .get(id.0 as usize)
            .and_then(|s| s.clone())
            .ok_or(KernelError::BadAddressSpace { id: id.0 })
    })
}

/// Root table frame of a space (for `switch_space` and the HAL MMU).
pub fn root_of(id: AsId) -> KernelResult<PhysAddr> {
    Ok(space(id)?.lock().root)
}

/// The address space currently installed in the MMU.
pub fn current_space() -> AsId {
    AsId(CURRENT.load(Ordering::Acquire))
}

/// Install `id` into the MMU and remember it as current.
pub fn switch_to(id: AsId) -> KernelResult<()> {
    let root = root_of(id)?;
    mmu::switch_space(root);
    CURRENT.store(id.0, Ordering::Release);
    Ok(())
}

fn flush_if_current(id: AsId, va: VirtAddr) {
    if current_space() == id {
        mmu::flush_tlb(va);
    }
}

/// Root-table index where the kernel half begins.
fn kernel_split_index() -> usize {
    Fmt::va_index(
        VirtAddr::new(hal_capabilities().kernel_base as usize),
        0,
    )
}

/// Copy the kernel-half root entries of the kernel space into `root`.
fn share_kernel_half(root: PhysAddr) {
    let kroot = with_table(|t| t.slots[0].as_ref().map(|s| s.lock().root));
    let Some(kroot) = kroot else { return };
    if !kroot.is_valid() {
        return;
    }
    let split = kernel_split_index();
    // SAFETY: Both roots are whole, live table frames reachable through the
    // direct map; indices stay inside the table.
    unsafe {
        let src = phys_to_virt(kroot).as_ptr::<<Fmt as PteFormat>::Repr>();
        let dst = phys_to_virt(root).as_ptr::<<Fmt as PteFormat>::Repr>();
        for i in split..Fmt::ENTRIES {
            *dst.add(i) = *src.add(i);
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Create a fresh address space with an empty user half.
pub fn create_address_space() -> KernelResult<AsId> {
    let root = FRAME_ALLOCATOR
        .lock()
        .alloc_frame()
        .ok_or(KernelError::NoMem {
            requested: PAGE_SIZE,
        })?;
    share_kernel_half(root);

    let arc = Arc::new(SpinLock::new(AddrSpace {
        root,
        regions: Vec::new(),
    }));
    let id = with_table(|t| {
        for (i, slot) in t.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(arc.clone());
                return AsId(i as u32);
            }
        }
        t.slots.push(Some(arc.clone()));
        AsId(t.slots.len() as u32 - 1)
    });
    Ok(id)
}

/// Tear down a space: drop every user mapping (dereferencing the frames),
/// free the intermediate user tables, then the root.
pub fn destroy_address_space(id: AsId) -> KernelResult<()> {
    if id == KERNEL_AS {
        return Err(KernelError::PermissionDenied {
            operation: "destroy kernel address space",
        });
    }
    if id == current_space() {
        return Err(KernelError::Busy {
            resource: "current address space",
        });
    }

    let arc = with_table(|t| {
        t.slots
            .get_mut(id.0 as usize)
            .and_then(|s| s.take())
            .ok_or(KernelError::BadAddressSpace { id: id.0 })
    })?;

    let mut sp = arc.lock();
    let regions = core::mem::take(&mut sp.regions);
    for r in &regions {
        for va in pages(r.base, r.end) {
            if let Ok(pa) = mapper::unmap::<Fmt>(sp.root, va) {
                FRAME_ALLOCATOR.lock().ref_dec(pa);
            }
        }
    }
    free_user_tables(sp.root, 0);
    FRAME_ALLOCATOR.lock().free_frame(sp.root);
    sp.root = PhysAddr::INVALID;
    Ok(())
}

/// Recursively free user-half intermediate tables under `table`.
/// Kernel-half entries are shared with every other space and must survive.
fn free_user_tables(table: PhysAddr, depth: usize) {
    let limit = if depth == 0 {
        kernel_split_index()
    } else {
        Fmt::ENTRIES
    };
    for i in 0..limit {
        // SAFETY: `table` is a live table frame; i < ENTRIES.
        let pte = unsafe { *phys_to_virt(table).as_ptr::<<Fmt as PteFormat>::Repr>().add(i) };
        if !Fmt::is_present(pte) || Fmt::flags(pte).contains(PteFlags::HUGE) {
            continue;
        }
        let child = Fmt::addr(pte);
        if depth + 1 < Fmt::LEVELS - 1 {
            free_user_tables(child, depth + 1);
        }
        FRAME_ALLOCATOR.lock().free_frame(child);
    }
}

// ---------------------------------------------------------------------------
// Region operations
// ---------------------------------------------------------------------------

/// Add a user region. Pages materialize on first touch (or via
/// [`map_fixed`] for eager consumers).
pub fn mmap(id: AsId, region: Region) -> KernelResult<()> {
    if !region.base.is_page_aligned() || !region.end.is_page_aligned() || region.is_empty() {
        return Err(KernelError::InvalidArg { name: "region" });
    }
    let caps = hal_capabilities();
    if region.end.as_u64() - 1 > caps.user_space_end {
        return Err(KernelError::InvalidArg { name: "region" });
    }

    let arc = space(id)?;
    let mut sp = arc.lock();
    if sp.regions.iter().any(|r| r.base < region.end && region.base < r.end) {
        return Err(KernelError::AlreadyMapped {
            vaddr: region.base.as_usize(),
        });
    }
    sp.regions.push(region);
    sp.regions.sort_by_key(|r| r.base);
    Ok(())
}

/// Remove `[base, base+length)` from the space: mapped pages are released,
/// covering regions are trimmed or split.
pub fn munmap(id: AsId, base: VirtAddr, length: usize) -> KernelResult<()> {
    if !base.is_page_aligned() || length == 0 || length % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArg { name: "range" });
    }
    let lo = base;
    let hi = base.offset(length);

    let arc = space(id)?;
    let mut sp = arc.lock();
    let root = sp.root;
    let old = core::mem::take(&mut sp.regions);
    let mut kept = Vec::with_capacity(old.len() + 1);
    for r in old {
        if r.end <= lo || r.base >= hi {
            kept.push(r);
            continue;
        }
        let cut_lo = if r.base > lo { r.base } else { lo };
        let cut_hi = if r.end < hi { r.end } else { hi };
        for va in pages(cut_lo, cut_hi) {
            if let Ok(pa) = mapper::unmap::<Fmt>(root, va) {
                FRAME_ALLOCATOR.lock().ref_dec(pa);
                flush_if_current(id, va);
            }
        }
        if r.base < cut_lo {
            kept.push(Region {
                end: cut_lo,
                ..r.clone()
            });
        }
        if cut_hi < r.end {
            kept.push(Region { base: cut_hi, ..r });
        }
    }
    kept.sort_by_key(|r| r.base);
    sp.regions = kept;
    Ok(())
}

/// Protection bits mprotect may change.
const PROT_MASK: PteFlags = PteFlags::WRITE.union(PteFlags::EXEC);

/// Change the protection of `[base, base+length)`. Regions are split at the
/// boundaries; present PTEs are rewritten (COW pages keep `WRITE` clear --
/// the fault handler grants it after duplication).
pub fn mprotect(id: AsId, base: VirtAddr, length: usize, prot: PteFlags) -> KernelResult<()> {
    if !base.is_page_aligned() || length == 0 || length % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArg { name: "range" });
    }
    let lo = base;
    let hi = base.offset(length);
    let grant = prot & PROT_MASK;

    let arc = space(id)?;
    let mut sp = arc.lock();
    let root = sp.root;
    let old = core::mem::take(&mut sp.regions);
    let mut kept = Vec::with_capacity(old.len() + 2);
    for r in old {
        if r.end <= lo || r.base >= hi {
            kept.push(r);
            continue;
        }
        let cut_lo = if r.base > lo { r.base } else { lo };
        let cut_hi = if r.end < hi { r.end } else { hi };

        for va in pages(cut_lo, cut_hi) {
            let Some((_, flags)) = mapper::query::<Fmt>(root, va) else {
                continue;
            };
            let mut set = grant;
            if flags.contains(PteFlags::COW) {
                set.remove(PteFlags::WRITE);
            }
            mapper::protect::<Fmt>(root, va, set, PROT_MASK - set)?;
            flush_if_current(id, va);
        }

        if r.base < cut_lo {
            kept.push(Region {
                end: cut_lo,
                ..r.clone()
            });
        }
        kept.push(Region {
            base: cut_lo,
            end: cut_hi,
            prot: (r.prot - PROT_MASK) | grant,
            kind: r.kind,
        });
        if cut_hi < r.end {
            kept.push(Region { base: cut_hi, ..r });
        }
    }
    kept.sort_by_key(|r| r.base);
    sp.regions = kept;
    Ok(())
}

/// Eagerly install a page into a space (consumers with a frame in hand:
/// ELF loading, shared buffers). Ownership of the frame's reference moves
/// into the mapping.
pub fn map_fixed(id: AsId, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> KernelResult<()> {
    let arc = space(id)?;
    let sp = arc.lock();
    mapper::map::<Fmt>(sp.root, va, pa, flags)?;
    flush_if_current(id, va);
    Ok(())
}

/// Look up the mapping for `va` in a space.
pub fn query_page(id: AsId, va: VirtAddr) -> KernelResult<Option<(PhysAddr, PteFlags)>> {
    let arc = space(id)?;
    let sp = arc.lock();
    Ok(mapper::query::<Fmt>(sp.root, va))
}

/// Number of regions in a space (diagnostics).
pub fn region_count(id: AsId) -> KernelResult<usize> {
    Ok(space(id)?.lock().regions.len())
}

/// First gap of `length` bytes at or above `floor` (mmap address picking).
/// Relies on the region list being sorted by base.
pub fn find_free_range(id: AsId, length: usize, floor: usize) -> KernelResult<VirtAddr> {
    let caps = hal_capabilities();
    let arc = space(id)?;
    let sp = arc.lock();

    let mut candidate = floor;
    for r in &sp.regions {
        if candidate + length <= r.base.as_usize() {
            break;
        }
        if r.end.as_usize() > candidate {
            candidate = r.end.as_usize();
        }
    }
    if (candidate + length - 1) as u64 > caps.user_space_end {
        return Err(KernelError::NoMem { requested: length });
    }
    Ok(VirtAddr::new(candidate))
}

// ---------------------------------------------------------------------------
// Fork
// ---------------------------------------------------------------------------

/// Duplicate `parent` for fork: regions are cloned, every mapped private
/// page becomes copy-on-write in both spaces, shared pages are mapped into
/// the child as-is. Frame refcounts go up by one per shared page.
pub fn fork_address_space(parent: AsId) -> KernelResult<AsId> {
    let child = create_address_space()?;
    let parent_arc = space(parent)?;
    let child_arc = space(child)?;

    let psp = parent_arc.lock();
    let mut csp = child_arc.lock();
    csp.regions = psp.regions.clone();

    for r in &psp.regions {
        for va in pages(r.base, r.end) {
            let Some((pa, flags)) = mapper::query::<Fmt>(psp.root, va) else {
                continue;
            };
            match r.kind {
                RegionKind::Shared => {
                    mapper::map::<Fmt>(csp.root, va, pa, flags)?;
                }
                _ => {
                    mapper::protect::<Fmt>(psp.root, va, PteFlags::COW, PteFlags::WRITE)?;
                    flush_if_current(parent, va);
                    let child_flags = (flags | PteFlags::COW) - PteFlags::WRITE;
                    mapper::map::<Fmt>(csp.root, va, pa, child_flags)?;
                }
            }
            FRAME_ALLOCATOR.lock().ref_inc(pa);
        }
    }
    Ok(child)
}

// ---------------------------------------------------------------------------
// Fault handling
// ---------------------------------------------------------------------------

/// Resolve a page fault against a space.
///
/// 1. Reserved-bit faults are never recoverable.
/// 2. No covering region: the caller signals or panics.
/// 3. Not-present access inside a region: demand-allocate (zero-fill or
///    read from backing) and map with the region protection.
/// 4. Write to a COW page: relabel in place when this is the last
///    reference, otherwise duplicate the frame.
/// 5. Anything else is a protection violation.
pub fn handle_fault(id: AsId, info: &FaultInfo) -> KernelResult<()> {
    if info.rsvd {
        return Err(KernelError::InvalidArg {
            name: "reserved-bit pte",
        });
    }
    let va = info.addr.align_down();
    let arc = space(id)?;
    let sp = arc.lock();

    let region = sp
        .regions
        .iter()
        .find(|r| r.contains(info.addr))
        .cloned()
        .ok_or(KernelError::NotMapped {
            vaddr: info.addr.as_usize(),
        })?;

    if info.write && !region.prot.contains(PteFlags::WRITE) {
        return Err(KernelError::PermissionDenied {
            operation: "write to read-only region",
        });
    }
    if info.exec && !region.prot.contains(PteFlags::EXEC) {
        return Err(KernelError::PermissionDenied {
            operation: "execute from no-exec region",
        });
    }

    match mapper::query::<Fmt>(sp.root, va) {
        None => {
            // Demand allocation: fresh zeroed frame, optionally filled from
            // the region's backing object.
            let pa = FRAME_ALLOCATOR
                .lock()
                .alloc_frame()
                .ok_or(KernelError::NoMem {
                    requested: PAGE_SIZE,
                })?;
            if let RegionKind::File { backing, offset } = region.kind {
                let page_off = (va.as_usize() - region.base.as_usize()) as u64;
                read_backing(backing, offset + page_off, pa)?;
            }
            mapper::map::<Fmt>(sp.root, va, pa, region.prot | PteFlags::PRESENT)?;
            flush_if_current(id, va);
            Ok(())
        }
        Some((pa, flags)) if info.write && flags.contains(PteFlags::COW) => {
            let rc = FRAME_ALLOCATOR.lock().ref_get(pa);
            if rc <= 1 {
                // Sole owner: relabel the existing mapping writable.
                mapper::protect::<Fmt>(sp.root, va, PteFlags::WRITE, PteFlags::COW)?;
            } else {
                let new_pa = FRAME_ALLOCATOR
                    .lock()
                    .alloc_frame()
                    .ok_or(KernelError::NoMem {
                        requested: PAGE_SIZE,
                    })?;
                // SAFETY: Both frames are live and reachable through the
                // direct map; they never overlap.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        phys_to_virt(pa).as_ptr::<u8>(),
                        phys_to_virt(new_pa).as_ptr::<u8>(),
                        PAGE_SIZE,
                    );
                }
                mapper::unmap::<Fmt>(sp.root, va)?;
                let new_flags = (flags | PteFlags::WRITE) - PteFlags::COW;
                mapper::map::<Fmt>(sp.root, va, new_pa, new_flags)?;
                FRAME_ALLOCATOR.lock().ref_dec(pa);
            }
            flush_if_current(id, va);
            Ok(())
        }
        Some(_) => Err(KernelError::PermissionDenied {
            operation: "protection violation",
        }),
    }
}

fn read_backing(backing: u64, offset: u64, pa: PhysAddr) -> KernelResult<()> {
    BACKING_READER
        .with(|reader| {
            // SAFETY: The frame was just allocated for this mapping and the
            // direct map covers it; the slice never escapes the closure.
            let buf = unsafe {
                core::slice::from_raw_parts_mut(phys_to_virt(pa).as_ptr::<u8>(), PAGE_SIZE)
            };
            (reader)(backing, offset, buf).map(|_| ())
        })
        // No reader registered: the zero-filled frame stands.
        .unwrap_or(Ok(()))
}

// ---------------------------------------------------------------------------
// Boot-time bring-up
// ---------------------------------------------------------------------------

/// Establish the kernel address space and the direct map.
///
/// Maps `[0, phys_limit)` at `kernel_base` 1:1 using huge pages where the
/// architecture has them, installs the root, then moves the direct-map
/// offset so every later physical access goes through the high alias.
pub fn init(phys_limit: u64) -> KernelResult<()> {
    let caps = hal_capabilities();
    let root = FRAME_ALLOCATOR
        .lock()
        .alloc_frame()
        .ok_or(KernelError::NoMem {
            requested: PAGE_SIZE,
        })?;

    let block = if caps.huge_pages {
        caps.page_sizes[1]
    } else {
        PAGE_SIZE
    };
    let kflags = PteFlags::PRESENT | PteFlags::WRITE | PteFlags::GLOBAL | PteFlags::ACCESSED;

    let mut pa = 0u64;
    while pa < phys_limit {
        let va = VirtAddr::new((caps.kernel_base + pa) as usize);
        if caps.huge_pages {
            mapper::map_block::<Fmt>(root, va, PhysAddr::new(pa), kflags)?;
        } else {
            mapper::map::<Fmt>(root, va, PhysAddr::new(pa), kflags)?;
        }
        pa += block as u64;
    }

    with_table(|t| {
        if let Some(slot) = &t.slots[0] {
            slot.lock().root = root;
        }
    });
    mmu::switch_space(root);
    set_direct_map_offset(caps.kernel_base);
    CURRENT.store(KERNEL_AS.0, Ordering::Release);

    log::info!(
        target: "vmm",
        "kernel direct map: {} MiB at {:#x}",
        phys_limit / (1024 * 1024),
        caps.kernel_base
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testpool;

    const USER_VA: usize = 0x40_0000;
    const UPROT: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITE)
        .union(PteFlags::USER);

    fn write_fault(addr: usize) -> FaultInfo {
        FaultInfo {
            addr: VirtAddr::new(addr),
            write: true,
            exec: false,
            user: true,
            present: true,
            rsvd: false,
            ip: 0,
        }
    }

    fn read_fault(addr: usize) -> FaultInfo {
        FaultInfo {
            addr: VirtAddr::new(addr),
            write: false,
            exec: false,
            user: true,
            present: false,
            rsvd: false,
            ip: 0,
        }
    }

    fn poke(pa: PhysAddr, offset: usize, val: u8) {
        unsafe { *phys_to_virt(pa).as_ptr::<u8>().add(offset) = val }
    }

    fn peek(pa: PhysAddr, offset: usize) -> u8 {
        unsafe { *phys_to_virt(pa).as_ptr::<u8>().add(offset) }
    }

    #[test]
    fn cow_fork_shares_then_splits() {
        let _pool = testpool::lock_shared();

        let a = create_address_space().expect("space A");
        mmap(a, Region::new(USER_VA, PAGE_SIZE, UPROT, RegionKind::Anon)).expect("mmap");

        let f1 = FRAME_ALLOCATOR.lock().alloc_frame().expect("frame");
        poke(f1, 42, 0xAB);
        map_fixed(a, VirtAddr::new(USER_VA), f1, UPROT).expect("map");

        let b = fork_address_space(a).expect("fork");

        // Both sides now see a COW, non-writable, user mapping of F1.
        for id in [a, b] {
            let (pa, flags) = query_page(id, VirtAddr::new(USER_VA))
                .expect("space alive")
                .expect("page mapped");
            assert_eq!(pa, f1);
            assert!(flags.contains(PteFlags::PRESENT | PteFlags::USER | PteFlags::COW));
            assert!(!flags.contains(PteFlags::WRITE));
        }
        assert_eq!(FRAME_ALLOCATOR.lock().ref_get(f1), 2);

        // A writes: fault resolution gives A a private copy.
        handle_fault(a, &write_fault(USER_VA + 42)).expect("cow fault");
        let (f2, flags) = query_page(a, VirtAddr::new(USER_VA))
            .expect("space alive")
            .expect("page mapped");
        assert_ne!(f2, f1);
        assert!(flags.contains(PteFlags::WRITE));
        assert!(!flags.contains(PteFlags::COW));
        assert_eq!(peek(f2, 42), 0xAB, "contents must be copied");
        assert_eq!(FRAME_ALLOCATOR.lock().ref_get(f1), 1);
        assert_eq!(FRAME_ALLOCATOR.lock().ref_get(f2), 1);

        // B still maps the original frame.
        let (pb, _) = query_page(b, VirtAddr::new(USER_VA))
            .expect("space alive")
            .expect("page mapped");
        assert_eq!(pb, f1);

        // B's write relabels in place: it is the last reference.
        handle_fault(b, &write_fault(USER_VA)).expect("relabel fault");
        let (pb2, fb) = query_page(b, VirtAddr::new(USER_VA))
            .expect("space alive")
            .expect("page mapped");
        assert_eq!(pb2, f1);
        assert!(fb.contains(PteFlags::WRITE));
        assert!(!fb.contains(PteFlags::COW));

        destroy_address_space(b).expect("destroy B");
        destroy_address_space(a).expect("destroy A");
    }

    #[test]
    fn fault_outside_any_region_is_rejected_without_leaking() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        let before = FRAME_ALLOCATOR.lock().stats().free_frames;

        let err = handle_fault(a, &read_fault(0)).expect_err("no region at 0");
        assert_eq!(err, KernelError::NotMapped { vaddr: 0 });
        assert_eq!(FRAME_ALLOCATOR.lock().stats().free_frames, before);

        destroy_address_space(a).expect("destroy");
    }

    #[test]
    fn demand_paging_zero_fills() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        mmap(a, Region::new(USER_VA, 4 * PAGE_SIZE, UPROT, RegionKind::Anon)).expect("mmap");

        assert!(query_page(a, VirtAddr::new(USER_VA)).expect("alive").is_none());
        handle_fault(a, &read_fault(USER_VA + 2 * PAGE_SIZE + 17)).expect("demand fault");

        let (pa, flags) = query_page(a, VirtAddr::new(USER_VA + 2 * PAGE_SIZE))
            .expect("alive")
            .expect("mapped");
        assert!(flags.contains(PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITE));
        for off in [0, 17, PAGE_SIZE - 1] {
            assert_eq!(peek(pa, off), 0);
        }

        destroy_address_space(a).expect("destroy");
    }

    #[test]
    fn write_fault_on_readonly_region_is_a_violation() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        let ro = PteFlags::PRESENT | PteFlags::USER;
        mmap(a, Region::new(USER_VA, PAGE_SIZE, ro, RegionKind::Anon)).expect("mmap");

        let err = handle_fault(a, &write_fault(USER_VA)).expect_err("read-only");
        assert!(matches!(err, KernelError::PermissionDenied { .. }));

        destroy_address_space(a).expect("destroy");
    }

    #[test]
    fn destroy_returns_every_frame() {
        let _pool = testpool::lock_shared();
        let before = FRAME_ALLOCATOR.lock().stats().free_frames;

        let a = create_address_space().expect("space");
        mmap(a, Region::new(USER_VA, 8 * PAGE_SIZE, UPROT, RegionKind::Anon)).expect("mmap");
        for i in 0..8 {
            handle_fault(a, &read_fault(USER_VA + i * PAGE_SIZE)).expect("fault in");
        }
        assert!(FRAME_ALLOCATOR.lock().stats().free_frames < before);

        destroy_address_space(a).expect("destroy");
        assert_eq!(FRAME_ALLOCATOR.lock().stats().free_frames, before);
    }

    #[test]
    fn munmap_trims_and_splits_regions() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        mmap(a, Region::new(USER_VA, 4 * PAGE_SIZE, UPROT, RegionKind::Anon)).expect("mmap");
        handle_fault(a, &read_fault(USER_VA + PAGE_SIZE)).expect("fault in");

        // Punch a hole over the second page: the region splits in two and
        // the mapped page is released.
        munmap(a, VirtAddr::new(USER_VA + PAGE_SIZE), PAGE_SIZE).expect("munmap");
        assert_eq!(region_count(a).expect("alive"), 2);
        assert!(query_page(a, VirtAddr::new(USER_VA + PAGE_SIZE))
            .expect("alive")
            .is_none());

        // The hole no longer faults in.
        let err = handle_fault(a, &read_fault(USER_VA + PAGE_SIZE)).expect_err("hole");
        assert!(matches!(err, KernelError::NotMapped { .. }));

        destroy_address_space(a).expect("destroy");
    }

    #[test]
    fn mprotect_downgrades_and_cow_survives() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        mmap(a, Region::new(USER_VA, 2 * PAGE_SIZE, UPROT, RegionKind::Anon)).expect("mmap");
        handle_fault(a, &read_fault(USER_VA)).expect("fault in");

        mprotect(a, VirtAddr::new(USER_VA), 2 * PAGE_SIZE, PteFlags::empty()).expect("mprotect");
        let (_, flags) = query_page(a, VirtAddr::new(USER_VA))
            .expect("alive")
            .expect("mapped");
        assert!(!flags.contains(PteFlags::WRITE));
        // Writes now violate the region protection.
        let err = handle_fault(a, &write_fault(USER_VA)).expect_err("now read-only");
        assert!(matches!(err, KernelError::PermissionDenied { .. }));

        destroy_address_space(a).expect("destroy");
    }

    #[test]
    fn overlapping_mmap_is_rejected() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        mmap(a, Region::new(USER_VA, 2 * PAGE_SIZE, UPROT, RegionKind::Anon)).expect("mmap");
        let err = mmap(
            a,
            Region::new(USER_VA + PAGE_SIZE, 2 * PAGE_SIZE, UPROT, RegionKind::Anon),
        )
        .expect_err("overlap");
        assert!(matches!(err, KernelError::AlreadyMapped { .. }));
        destroy_address_space(a).expect("destroy");
    }

    #[test]
    fn shared_regions_fork_without_cow() {
        let _pool = testpool::lock_shared();
        let a = create_address_space().expect("space");
        mmap(a, Region::new(USER_VA, PAGE_SIZE, UPROT, RegionKind::Shared)).expect("mmap");
        handle_fault(a, &write_fault_not_present()).expect("fault in");

        let b = fork_address_space(a).expect("fork");
        let (pa_a, fa) = query_page(a, VirtAddr::new(USER_VA))
            .expect("alive")
            .expect("mapped");
        let (pa_b, fb) = query_page(b, VirtAddr::new(USER_VA))
            .expect("alive")
            .expect("mapped");
        assert_eq!(pa_a, pa_b);
        assert!(fa.contains(PteFlags::WRITE) && fb.contains(PteFlags::WRITE));
        assert!(!fa.contains(PteFlags::COW) && !fb.contains(PteFlags::COW));
        assert_eq!(FRAME_ALLOCATOR.lock().ref_get(pa_a), 2);

        destroy_address_space(b).expect("destroy");
        destroy_address_space(a).expect("destroy");
    }

    fn write_fault_not_present() -> FaultInfo {
        FaultInfo {
            addr: VirtAddr::new(USER_VA),
            write: true,
            exec: false,
            user: true,
            present: false,
            rsvd: false,
            ip: 0,
        }
    }

    #[test]
    fn file_backed_regions_read_through_the_hook() {
        let _pool = testpool::lock_shared();

        fn reader(backing: u64, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
            assert_eq!(backing, 7);
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (offset as usize + i) as u8;
            }
            Ok(buf.len())
        }
        register_backing_reader(reader);

        let a = create_address_space().expect("space");
        mmap(
            a,
            Region::new(
                USER_VA,
                PAGE_SIZE,
                PteFlags::PRESENT | PteFlags::USER,
                RegionKind::File {
                    backing: 7,
                    offset: 0x100,
                },
            ),
        )
        .expect("mmap");
        handle_fault(a, &read_fault(USER_VA)).expect("fault in");

        let (pa, _) = query_page(a, VirtAddr::new(USER_VA))
            .expect("alive")
            .expect("mapped");
        assert_eq!(peek(pa, 0), 0x00);
        assert_eq!(peek(pa, 1), 0x01);

        destroy_address_space(a).expect("destroy");
    }
}
