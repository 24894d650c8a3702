//! System-call dispatch
//!
//! The HAL entry stubs extract [`SyscallArgs`] from the trap frame (the
//! dispatcher never reads registers itself), look the number up here, and
//! put the `i64` result back in the return register. Non-negative means
//! success; negative is `-errno`, surfaced to user land as-is.
//!
//! Core classes (process, memory, time, sys) install their handlers in
//! [`init`]; consumer subsystems (VFS, signals, sockets) claim their
//! reserved numbers through [`register`] at their own init time.

pub mod numbers;

mod info;
mod memory;
mod process;
mod time;

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::{errno, KernelError, KernelResult},
    sync::SpinLockIrq,
};

pub use numbers::*;

/// Arguments extracted from the trap frame by the HAL.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArgs {
    pub number: u64,
    pub args: [u64; 6],
    /// Pointer to the arch trap frame, when the entry path has one
    /// (fork and sigreturn need the full frame).
    pub extra: Option<usize>,
}

/// A syscall body: receives the extracted arguments, returns the value for
/// the return register.
pub type SyscallHandler = fn(&SyscallArgs) -> i64;

struct SyscallTable {
    entries: [Option<SyscallHandler>; SYS_LIMIT as usize],
}

static TABLE: SpinLockIrq<SyscallTable> = SpinLockIrq::new(SyscallTable {
    entries: [None; SYS_LIMIT as usize],
});

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install a handler for `number`. Consumer subsystems use this for their
/// reserved classes; double registration fails.
pub fn register(number: u64, handler: SyscallHandler) -> KernelResult<()> {
    if number >= SYS_LIMIT {
        return Err(KernelError::InvalidArg { name: "number" });
    }
    let mut table = TABLE.lock();
    let slot = &mut table.entries[number as usize];
    if slot.is_some() {
        return Err(KernelError::Busy {
            resource: "syscall number",
        });
    }
    *slot = Some(handler);
    Ok(())
}

/// Dispatch by number. Unknown numbers return `-ENOSYS`.
pub fn dispatch(args: &SyscallArgs) -> i64 {
    let handler = {
        if args.number >= SYS_LIMIT {
            None
        } else {
            TABLE.lock().entries[args.number as usize]
        }
    };
    match handler {
        Some(handler) => handler(args),
        None => -errno::ENOSYS,
    }
}

/// Install the core handler classes. Idempotent.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    process::install();
    memory::install();
    time::install();
    info::install();
    log::info!(target: "syscall", "dispatch table ready ({:#x} numbers)", SYS_LIMIT);
}

// ---------------------------------------------------------------------------
// User-memory access helpers shared by the handler modules
// ---------------------------------------------------------------------------

/// Validate that `[ptr, ptr+len)` lies entirely in the user half.
fn user_range_ok(ptr: u64, len: usize) -> bool {
    if ptr == 0 || len == 0 {
        return false;
    }
    let caps = crate::arch::caps::hal_capabilities();
    let end = match ptr.checked_add(len as u64 - 1) {
        Some(end) => end,
        None => return false,
    };
    caps.is_user_addr(ptr) && caps.is_user_addr(end)
}

/// Copy bytes into user memory. The current address space maps the user
/// half, so after range validation this is a plain store.
fn copy_to_user(ptr: u64, bytes: &[u8]) -> Result<(), i64> {
    if !user_range_ok(ptr, bytes.len()) {
        return Err(-errno::EFAULT);
    }
    // SAFETY: The destination range was validated as user-half; the caller
    // runs in syscall context with the user's space installed.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
    }
    Ok(())
}

/// Copy bytes out of user memory.
fn copy_from_user(ptr: u64, buf: &mut [u8]) -> Result<(), i64> {
    if !user_range_ok(ptr, buf.len()) {
        return Err(-errno::EFAULT);
    }
    // SAFETY: See copy_to_user.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), buf.len());
    }
    Ok(())
}

/// Shorthand for handlers converting kernel errors at the boundary.
fn errno_of(err: KernelError) -> i64 {
    err.to_errno()
}
