//! ARM generic timer (EL1 physical timer, PPI 30)

use core::sync::atomic::{AtomicU64, Ordering};

/// Reload value programmed on every tick.
static TICK_INTERVAL: AtomicU64 = AtomicU64::new(0);

fn counter_freq() -> u64 {
    let freq: u64;
    // SAFETY: CNTFRQ_EL0 is a read-only frequency register.
    unsafe {
        core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
    }
    freq
}

fn set_timer(interval: u64) {
    // SAFETY: Programming the EL1 physical timer compare-down register and
    // enabling it; standard generic-timer sequence.
    unsafe {
        core::arch::asm!(
            "msr cntp_tval_el0, {0}",
            "mov {1}, #1",
            "msr cntp_ctl_el0, {1}",
            in(reg) interval,
            out(reg) _,
            options(nomem, nostack)
        );
    }
}

/// Program a periodic tick at `hz` and enable the timer PPI at the GIC.
pub fn init(hz: u32) {
    let interval = counter_freq() / hz as u64;
    TICK_INTERVAL.store(interval, Ordering::Relaxed);
    set_timer(interval);
    super::gic::enable_irq(crate::irq::ARM64_TIMER_PPI);
    log::debug!(target: "timer", "generic timer at {} Hz (interval {})", hz, interval);
}

/// Re-arm after a tick; called from the timer interrupt handler.
pub fn rearm() {
    set_timer(TICK_INTERVAL.load(Ordering::Relaxed));
}

/// Raw counter value (time-keeping fallback).
pub fn counter() -> u64 {
    let count: u64;
    // SAFETY: CNTPCT_EL0 is a read-only counter.
    unsafe {
        core::arch::asm!("mrs {}, cntpct_el0", out(reg) count, options(nomem, nostack));
    }
    count
}
