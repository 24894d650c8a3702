//! Time-class syscalls (0x03xx)
//!
//! Wall-clock time is tick-based from boot; an RTC consumer can layer an
//! epoch offset on top later.

use super::{copy_from_user, copy_to_user, numbers::*, register, SyscallArgs};
use crate::{error::errno, sched, timer};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Timespec {
    tv_sec: i64,
    tv_nsec: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Timeval {
    tv_sec: i64,
    tv_usec: i64,
}

fn as_bytes<T>(value: &T) -> &[u8] {
    // SAFETY: Reading the object representation of a repr(C) POD struct.
    unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    }
}

pub(super) fn install() {
    register(SYS_TIME, sys_time).ok();
    register(SYS_GETTIMEOFDAY, sys_gettimeofday).ok();
    register(SYS_NANOSLEEP, sys_nanosleep).ok();
    register(SYS_CLOCK_GETTIME, sys_clock_gettime).ok();
}

fn sys_time(args: &SyscallArgs) -> i64 {
    let secs = (timer::ticks() / timer::TICK_HZ as u64) as i64;
    let out_ptr = args.args[0];
    if out_ptr != 0 {
        if let Err(e) = copy_to_user(out_ptr, &secs.to_ne_bytes()) {
            return e;
        }
    }
    secs
}

fn sys_gettimeofday(args: &SyscallArgs) -> i64 {
    let tv_ptr = args.args[0];
    if tv_ptr == 0 {
        return -errno::EINVAL;
    }
    let ticks = timer::ticks();
    let hz = timer::TICK_HZ as u64;
    let tv = Timeval {
        tv_sec: (ticks / hz) as i64,
        tv_usec: ((ticks % hz) * 1_000_000 / hz) as i64,
    };
    match copy_to_user(tv_ptr, as_bytes(&tv)) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

fn sys_nanosleep(args: &SyscallArgs) -> i64 {
    let req_ptr = args.args[0];
    let rem_ptr = args.args[1];

    let mut buf = [0u8; core::mem::size_of::<Timespec>()];
    if let Err(e) = copy_from_user(req_ptr, &mut buf) {
        return e;
    }
    // SAFETY: Timespec is repr(C) POD; any bit pattern is valid.
    let req: Timespec = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Timespec) };
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        return -errno::EINVAL;
    }

    let hz = timer::TICK_HZ as u64;
    let mut ticks = req.tv_sec as u64 * hz + (req.tv_nsec as u64 * hz).div_ceil(1_000_000_000);
    if ticks == 0 && (req.tv_sec != 0 || req.tv_nsec != 0) {
        ticks = 1;
    }
    if ticks > 0 {
        sched::sleep_until(timer::ticks() + ticks);
    }

    // No interruptible sleeps in this design, so the remainder is zero.
    if rem_ptr != 0 {
        let rem = Timespec::default();
        if let Err(e) = copy_to_user(rem_ptr, as_bytes(&rem)) {
            return e;
        }
    }
    0
}

fn sys_clock_gettime(args: &SyscallArgs) -> i64 {
    let ts_ptr = args.args[1];
    if ts_ptr == 0 {
        return -errno::EINVAL;
    }
    let ticks = timer::ticks();
    let hz = timer::TICK_HZ as u64;
    let ts = Timespec {
        tv_sec: (ticks / hz) as i64,
        tv_nsec: ((ticks % hz) * 1_000_000_000 / hz) as i64,
    };
    match copy_to_user(ts_ptr, as_bytes(&ts)) {
        Ok(()) => 0,
        Err(e) => e,
    }
}
