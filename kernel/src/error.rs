//! Kernel error types for CastorOS
//!
//! Leaf subsystems return tagged errors; higher layers either recover locally
//! (the fault handler turns `NotMapped` into lazy allocation) or convert to a
//! negative POSIX errno at the syscall boundary.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frames or heap exhausted
    NoMem {
        requested: usize,
    },
    /// Alignment, range, or null-pointer violation
    InvalidArg {
        name: &'static str,
    },
    /// Capability missing on this architecture
    NotSupported {
        operation: &'static str,
    },
    /// A leaf PTE is already present at the target address
    AlreadyMapped {
        vaddr: usize,
    },
    /// No leaf PTE present at the target address
    NotMapped {
        vaddr: usize,
    },
    /// Resource held by someone else
    Busy {
        resource: &'static str,
    },
    /// User attempted a kernel-only operation
    PermissionDenied {
        operation: &'static str,
    },
    /// Subsystem used before its init() ran
    NotInitialized {
        subsystem: &'static str,
    },
    /// No such task
    TaskNotFound {
        pid: u32,
    },
    /// Address-space handle does not resolve
    BadAddressSpace {
        id: u32,
    },
    /// Page-table walk errors
    Walk(WalkError),
    /// Bootloader handoff errors
    BootInfo(BootInfoError),
    /// Scheduler errors
    Sched(SchedError),
}

/// Page-table walk errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkError {
    /// A huge-page mapping sits above the requested leaf level
    HugeInPath,
    /// An intermediate table is missing and creation was not requested
    NotMapped,
    /// Could not allocate an intermediate table
    NoMem,
}

/// Boot-info adapter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootInfoError {
    /// Bootloader magic value missing or wrong
    MissingMagic,
    /// Structure extends past the bytes the bootloader handed over
    Truncated,
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Task table is full
    TooManyTasks,
    /// Operation requires a different task state
    InvalidState,
    /// Only the parent may reap a terminated child
    NotYourChild,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

// ---------------------------------------------------------------------------
// POSIX errno surface
// ---------------------------------------------------------------------------

/// POSIX errno values surfaced to user land as negative returns.
pub mod errno {
    pub const EPERM: i64 = 1;
    pub const ENOENT: i64 = 2;
    pub const ESRCH: i64 = 3;
    pub const EINTR: i64 = 4;
    pub const EIO: i64 = 5;
    pub const EBADF: i64 = 9;
    pub const ECHILD: i64 = 10;
    pub const EAGAIN: i64 = 11;
    pub const ENOMEM: i64 = 12;
    pub const EACCES: i64 = 13;
    pub const EFAULT: i64 = 14;
    pub const EBUSY: i64 = 16;
    pub const EEXIST: i64 = 17;
    pub const EINVAL: i64 = 22;
    pub const ENOSYS: i64 = 38;
}

impl KernelError {
    /// Convert to the negative errno surfaced at the syscall boundary.
    pub fn to_errno(self) -> i64 {
        use errno::*;
        let e = match self {
            Self::NoMem { .. } => ENOMEM,
            Self::InvalidArg { .. } => EINVAL,
            Self::NotSupported { .. } => ENOSYS,
            Self::AlreadyMapped { .. } => EEXIST,
            Self::NotMapped { .. } => EFAULT,
            Self::Busy { .. } => EBUSY,
            Self::PermissionDenied { .. } => EPERM,
            Self::NotInitialized { .. } => EAGAIN,
            Self::TaskNotFound { .. } => ESRCH,
            Self::BadAddressSpace { .. } => EINVAL,
            Self::Walk(WalkError::NoMem) => ENOMEM,
            Self::Walk(_) => EFAULT,
            Self::BootInfo(_) => EINVAL,
            Self::Sched(SchedError::TooManyTasks) => EAGAIN,
            Self::Sched(SchedError::NotYourChild) => ECHILD,
            Self::Sched(_) => EINVAL,
        };
        -e
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMem { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidArg { name } => write!(f, "Invalid argument '{}'", name),
            Self::NotSupported { operation } => {
                write!(f, "Operation not supported: {}", operation)
            }
            Self::AlreadyMapped { vaddr } => write!(f, "Already mapped at {:#x}", vaddr),
            Self::NotMapped { vaddr } => write!(f, "Nothing mapped at {:#x}", vaddr),
            Self::Busy { resource } => write!(f, "Resource busy: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied: {}", operation)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
            Self::TaskNotFound { pid } => write!(f, "Task {} not found", pid),
            Self::BadAddressSpace { id } => write!(f, "Bad address-space handle {}", id),
            Self::Walk(e) => write!(f, "Page-table walk failed: {:?}", e),
            Self::BootInfo(e) => write!(f, "Boot info rejected: {:?}", e),
            Self::Sched(e) => write!(f, "Scheduler error: {:?}", e),
        }
    }
}

impl From<WalkError> for KernelError {
    fn from(err: WalkError) -> Self {
        Self::Walk(err)
    }
}

impl From<BootInfoError> for KernelError {
    fn from(err: BootInfoError) -> Self {
        Self::BootInfo(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_follows_the_table() {
        assert_eq!(
            KernelError::NoMem { requested: 4096 }.to_errno(),
            -errno::ENOMEM
        );
        assert_eq!(
            KernelError::InvalidArg { name: "vaddr" }.to_errno(),
            -errno::EINVAL
        );
        assert_eq!(
            KernelError::NotSupported { operation: "iommu" }.to_errno(),
            -errno::ENOSYS
        );
        assert_eq!(
            KernelError::AlreadyMapped { vaddr: 0x1000 }.to_errno(),
            -errno::EEXIST
        );
        assert_eq!(
            KernelError::NotMapped { vaddr: 0x1000 }.to_errno(),
            -errno::EFAULT
        );
        assert_eq!(
            KernelError::Busy { resource: "hda" }.to_errno(),
            -errno::EBUSY
        );
        assert_eq!(
            KernelError::PermissionDenied { operation: "reboot" }.to_errno(),
            -errno::EPERM
        );
    }

    #[test]
    fn sub_errors_convert() {
        let e: KernelError = WalkError::HugeInPath.into();
        assert_eq!(e, KernelError::Walk(WalkError::HugeInPath));
        let e: KernelError = BootInfoError::MissingMagic.into();
        assert_eq!(e.to_errno(), -errno::EINVAL);
    }
}
