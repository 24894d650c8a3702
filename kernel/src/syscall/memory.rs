//! Memory-class syscalls (0x02xx)

use super::{errno_of, numbers::*, register, SyscallArgs};
use crate::{
    arch::pte::PteFlags,
    error::errno,
    mm::{
        addr::{align_up, VirtAddr, PAGE_SIZE},
        vmm::{self, Region, RegionKind},
    },
    sched,
};

/// User protection bits (mirrored by libc).
const PROT_READ: u64 = 0x1;
const PROT_WRITE: u64 = 0x2;
const PROT_EXEC: u64 = 0x4;

/// MAP_SHARED flag bit.
const MAP_SHARED: u64 = 0x1;

/// Lowest address handed out when mmap is asked to pick.
const MMAP_BASE: usize = 0x4000_0000;

/// Program break for tasks that never had one.
const BRK_BASE: usize = 0x1000_0000;

pub(super) fn install() {
    register(SYS_BRK, sys_brk).ok();
    register(SYS_MMAP, sys_mmap).ok();
    register(SYS_MUNMAP, sys_munmap).ok();
    register(SYS_MPROTECT, sys_mprotect).ok();
}

fn prot_to_flags(prot: u64) -> PteFlags {
    let mut flags = PteFlags::PRESENT | PteFlags::USER;
    if prot & PROT_WRITE != 0 {
        flags |= PteFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= PteFlags::EXEC;
    }
    flags
}

fn sys_brk(args: &SyscallArgs) -> i64 {
    let requested = args.args[0] as usize;
    let space = sched::current_address_space();

    sched::with_current_brk(|start, end| {
        if *start == 0 {
            *start = BRK_BASE;
            *end = BRK_BASE;
        }
        if requested == 0 {
            return *end as i64;
        }
        if requested < *start {
            return -errno::EINVAL;
        }

        let old_top = align_up(*end, PAGE_SIZE);
        let new_top = align_up(requested, PAGE_SIZE);
        if new_top > old_top {
            let region = Region::new(
                old_top,
                new_top - old_top,
                PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER,
                RegionKind::Anon,
            );
            if let Err(e) = vmm::mmap(space, region) {
                return errno_of(e);
            }
        } else if new_top < old_top {
            if let Err(e) = vmm::munmap(space, VirtAddr::new(new_top), old_top - new_top) {
                return errno_of(e);
            }
        }
        *end = requested;
        requested as i64
    })
}

fn sys_mmap(args: &SyscallArgs) -> i64 {
    let addr = args.args[0] as usize;
    let length = args.args[1] as usize;
    let prot = args.args[2];
    let flags = args.args[3];

    if length == 0 {
        return -errno::EINVAL;
    }
    let length = align_up(length, PAGE_SIZE);
    let space = sched::current_address_space();

    let base = if addr == 0 {
        match vmm::find_free_range(space, length, MMAP_BASE) {
            Ok(base) => base,
            Err(e) => return errno_of(e),
        }
    } else {
        VirtAddr::new(addr)
    };

    let kind = if flags & MAP_SHARED != 0 {
        RegionKind::Shared
    } else {
        RegionKind::Anon
    };
    let region = Region {
        base,
        end: base.offset(length),
        prot: prot_to_flags(prot),
        kind,
    };
    match vmm::mmap(space, region) {
        Ok(()) => base.as_usize() as i64,
        Err(e) => errno_of(e),
    }
}

fn sys_munmap(args: &SyscallArgs) -> i64 {
    let addr = args.args[0] as usize;
    let length = args.args[1] as usize;
    let space = sched::current_address_space();
    match vmm::munmap(space, VirtAddr::new(addr), align_up(length, PAGE_SIZE)) {
        Ok(()) => 0,
        Err(e) => errno_of(e),
    }
}

fn sys_mprotect(args: &SyscallArgs) -> i64 {
    let addr = args.args[0] as usize;
    let length = args.args[1] as usize;
    let prot = args.args[2];
    let space = sched::current_address_space();
    match vmm::mprotect(
        space,
        VirtAddr::new(addr),
        align_up(length, PAGE_SIZE),
        prot_to_flags(prot),
    ) {
        Ok(()) => 0,
        Err(e) => errno_of(e),
    }
}
