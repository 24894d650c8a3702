//! Sys-class syscalls (0x05xx)

use core::sync::atomic::{AtomicU64, Ordering};

use super::{copy_from_user, copy_to_user, numbers::*, register, SyscallArgs};
use crate::{arch, error::errno};

const UTS_FIELD: usize = 65;

#[repr(C)]
struct Utsname {
    sysname: [u8; UTS_FIELD],
    nodename: [u8; UTS_FIELD],
    release: [u8; UTS_FIELD],
    version: [u8; UTS_FIELD],
    machine: [u8; UTS_FIELD],
}

fn uts_field(text: &str) -> [u8; UTS_FIELD] {
    let mut field = [0u8; UTS_FIELD];
    let len = text.len().min(UTS_FIELD - 1);
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    field
}

pub(super) fn install() {
    register(SYS_UNAME, sys_uname).ok();
    register(SYS_GETRANDOM, sys_getrandom).ok();
    register(SYS_DEBUG_PRINT, sys_debug_print).ok();
    register(SYS_REBOOT, sys_reboot).ok();
    register(SYS_POWEROFF, sys_poweroff).ok();
}

fn sys_uname(args: &SyscallArgs) -> i64 {
    let ptr = args.args[0];
    let caps = arch::caps::hal_capabilities();
    let uts = Utsname {
        sysname: uts_field("CastorOS"),
        nodename: uts_field("castor"),
        release: uts_field(env!("CARGO_PKG_VERSION")),
        version: uts_field("CastorOS kernel"),
        machine: uts_field(caps.arch_name),
    };
    // SAFETY: Reading the object representation of a repr(C) POD struct.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &uts as *const Utsname as *const u8,
            core::mem::size_of::<Utsname>(),
        )
    };
    match copy_to_user(ptr, bytes) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

/// xorshift64* stream; good enough for user-land seeding, not for keys.
static RANDOM_STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

fn next_random() -> u64 {
    let mut x = RANDOM_STATE.load(Ordering::Relaxed) ^ crate::timer::ticks().wrapping_add(1);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    RANDOM_STATE.store(x, Ordering::Relaxed);
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

fn sys_getrandom(args: &SyscallArgs) -> i64 {
    let ptr = args.args[0];
    let len = (args.args[1] as usize).min(256);
    if len == 0 {
        return 0;
    }
    let mut buf = [0u8; 256];
    for chunk in buf[..len].chunks_mut(8) {
        let word = next_random().to_ne_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
    match copy_to_user(ptr, &buf[..len]) {
        Ok(()) => len as i64,
        Err(e) => e,
    }
}

fn sys_debug_print(args: &SyscallArgs) -> i64 {
    let ptr = args.args[0];
    let len = (args.args[1] as usize).min(512);
    if len == 0 {
        return 0;
    }
    let mut buf = [0u8; 512];
    if let Err(e) = copy_from_user(ptr, &mut buf[..len]) {
        return e;
    }
    match core::str::from_utf8(&buf[..len]) {
        Ok(text) => {
            log::info!(target: "user", "{}", text.trim_end_matches('\n'));
            len as i64
        }
        Err(_) => -errno::EINVAL,
    }
}

fn sys_reboot(_args: &SyscallArgs) -> i64 {
    log::warn!(target: "sys", "reboot requested by pid {}", crate::sched::current_pid());
    arch::reboot()
}

fn sys_poweroff(_args: &SyscallArgs) -> i64 {
    log::warn!(target: "sys", "poweroff requested by pid {}", crate::sched::current_pid());
    arch::poweroff()
}
