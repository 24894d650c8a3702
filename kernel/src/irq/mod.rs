//! Logical IRQ management
//!
//! Device classes register against [`LogicalIrq`] values; a per-ISA mapping
//! table resolves them to physical lines (8259 PIC lines on the x86 family,
//! GIC INTIDs on ARM64). One generic trampoline dispatches every line -- no
//! per-IRQ wrapper functions.
//!
//! The handler table is written only on the cold registration path (with
//! the table lock held and interrupts off) and read with a single brief
//! lock acquisition from interrupt context.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLockIrq,
};

/// Device-class interrupt names, independent of the wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalIrq {
    Timer,
    Keyboard,
    Serial0,
    Serial1,
    DiskPrimary,
    DiskSecondary,
    Network,
    Usb,
    Rtc,
    Mouse,
}

/// ARM64 generic timer PPI (INTID 30 on QEMU virt).
pub const ARM64_TIMER_PPI: u32 = 30;

impl LogicalIrq {
    /// Resolve to the physical line for this build's interrupt controller.
    ///
    /// `instance` distinguishes multiple devices of one class where the
    /// platform wires them contiguously (virtio slots on ARM64); the fixed
    /// ISA lines ignore it.
    pub fn physical(self, instance: u32) -> u32 {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            let _ = instance;
            match self {
                LogicalIrq::Timer => 0,
                LogicalIrq::Keyboard => 1,
                LogicalIrq::Serial1 => 3,
                LogicalIrq::Serial0 => 4,
                LogicalIrq::Rtc => 8,
                LogicalIrq::Network => 10,
                LogicalIrq::Usb => 11,
                LogicalIrq::Mouse => 12,
                LogicalIrq::DiskPrimary => 14,
                LogicalIrq::DiskSecondary => 15,
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            // QEMU virt: UART/RTC on low SPIs, virtio-mmio slots from
            // INTID 48. A DTB-driven consumer may refine these.
            match self {
                LogicalIrq::Timer => ARM64_TIMER_PPI,
                LogicalIrq::Serial0 => 33,
                LogicalIrq::Serial1 => 35,
                LogicalIrq::Rtc => 34,
                LogicalIrq::DiskPrimary => 48 + instance,
                LogicalIrq::DiskSecondary => 49 + instance,
                LogicalIrq::Network => 50 + instance,
                LogicalIrq::Usb => 52 + instance,
                LogicalIrq::Keyboard => 60 + instance,
                LogicalIrq::Mouse => 61 + instance,
            }
        }
    }
}

/// Registered handler: called with the logical IRQ and the registration
/// token (typically a driver-instance pointer squeezed into a usize).
pub type IrqHandler = fn(LogicalIrq, usize);

#[derive(Clone, Copy)]
struct IrqAction {
    logical: LogicalIrq,
    handler: IrqHandler,
    data: usize,
}

/// Physical lines tracked (covers the PIC and the GIC range we use).
const MAX_LINES: usize = 256;

static ACTIONS: SpinLockIrq<[Option<IrqAction>; MAX_LINES]> =
    SpinLockIrq::new([None; MAX_LINES]);

/// Interrupt nesting depth; nonzero while any handler runs.
static NESTING: AtomicUsize = AtomicUsize::new(0);

/// Set by the scheduler tick; consumed at the outermost interrupt exit.
static NEED_RESCHED: AtomicBool = AtomicBool::new(false);

/// True while executing in interrupt context.
pub fn in_interrupt() -> bool {
    NESTING.load(Ordering::Relaxed) != 0
}

/// Ask the outermost interrupt exit to run the scheduler.
pub fn request_resched() {
    NEED_RESCHED.store(true, Ordering::Release);
}

/// Register `handler` for a logical IRQ and unmask its line.
///
/// One handler per line; a second registration fails with `Busy`.
pub fn register(
    logical: LogicalIrq,
    instance: u32,
    handler: IrqHandler,
    data: usize,
) -> KernelResult<()> {
    let line = logical.physical(instance);
    if line as usize >= MAX_LINES {
        return Err(KernelError::InvalidArg { name: "irq line" });
    }
    {
        let mut table = ACTIONS.lock();
        if table[line as usize].is_some() {
            return Err(KernelError::Busy {
                resource: "irq line",
            });
        }
        table[line as usize] = Some(IrqAction {
            logical,
            handler,
            data,
        });
    }
    enable_line(logical, instance);
    log::debug!(target: "irq", "{:?} on line {}", logical, line);
    Ok(())
}

/// Drop the handler for a line and mask it again.
pub fn unregister(logical: LogicalIrq, instance: u32) -> KernelResult<()> {
    let line = logical.physical(instance);
    disable_line(logical, instance);
    let mut table = ACTIONS.lock();
    if table
        .get_mut(line as usize)
        .and_then(|slot| slot.take())
        .is_none()
    {
        return Err(KernelError::NotMapped {
            vaddr: line as usize,
        });
    }
    Ok(())
}

/// Unmask a logical IRQ's line at the interrupt controller.
pub fn enable_line(logical: LogicalIrq, instance: u32) {
    let line = logical.physical(instance);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::pic::unmask(line as u8);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::pic::unmask(line as u8);
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::gic::enable_irq(line);
    #[cfg(not(target_os = "none"))]
    let _ = line;
}

/// Mask a logical IRQ's line at the interrupt controller.
pub fn disable_line(logical: LogicalIrq, instance: u32) {
    let line = logical.physical(instance);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::pic::mask(line as u8);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::pic::mask(line as u8);
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::gic::disable_irq(line);
    #[cfg(not(target_os = "none"))]
    let _ = line;
}

/// Generic trampoline: the arch trap path lands here with the physical
/// line; the registered handler runs with interrupts disabled. At the
/// outermost exit a pending resched request is honored -- context switches
/// never happen inside a nested handler.
pub fn dispatch_physical(line: u32) {
    NESTING.fetch_add(1, Ordering::Acquire);

    let action = ACTIONS
        .lock()
        .get(line as usize)
        .copied()
        .flatten();
    match action {
        Some(action) => (action.handler)(action.logical, action.data),
        None => log::debug!(target: "irq", "spurious interrupt on line {}", line),
    }

    let depth = NESTING.fetch_sub(1, Ordering::Release);
    if depth == 1 && NEED_RESCHED.swap(false, Ordering::AcqRel) {
        crate::sched::schedule();
    }
}

/// Announce the subsystem; the controllers themselves come up in the arch
/// early-init path.
pub fn init() {
    log::info!(target: "irq", "logical IRQ table ready ({} lines)", MAX_LINES);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_irq: LogicalIrq, data: usize) {
        FIRED.fetch_add(data, Ordering::SeqCst);
    }

    #[test]
    fn register_dispatch_unregister() {
        let line = LogicalIrq::Rtc.physical(0);

        register(LogicalIrq::Rtc, 0, count_handler, 3).expect("register");
        // Double registration on the same line is refused.
        assert!(matches!(
            register(LogicalIrq::Rtc, 0, count_handler, 1),
            Err(KernelError::Busy { .. })
        ));

        let before = FIRED.load(Ordering::SeqCst);
        dispatch_physical(line);
        dispatch_physical(line);
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 6);

        unregister(LogicalIrq::Rtc, 0).expect("unregister");
        dispatch_physical(line); // now spurious; counter unchanged
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 6);
    }

    #[test]
    fn nesting_counter_tracks_dispatch() {
        fn probe(_irq: LogicalIrq, _data: usize) {
            assert!(in_interrupt());
        }
        register(LogicalIrq::Mouse, 0, probe, 0).expect("register");
        assert!(!in_interrupt());
        dispatch_physical(LogicalIrq::Mouse.physical(0));
        assert!(!in_interrupt());
        unregister(LogicalIrq::Mouse, 0).expect("unregister");
    }

    #[test]
    fn logical_to_physical_is_stable() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            assert_eq!(LogicalIrq::Timer.physical(0), 0);
            assert_eq!(LogicalIrq::Keyboard.physical(0), 1);
            assert_eq!(LogicalIrq::Serial0.physical(0), 4);
            assert_eq!(LogicalIrq::DiskPrimary.physical(0), 14);
            assert_eq!(LogicalIrq::DiskSecondary.physical(0), 15);
        }
        #[cfg(target_arch = "aarch64")]
        {
            assert_eq!(LogicalIrq::Timer.physical(0), ARM64_TIMER_PPI);
            assert_eq!(LogicalIrq::Network.physical(1), 51);
        }
    }
}
