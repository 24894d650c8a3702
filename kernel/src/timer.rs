//! System tick
//!
//! One global tick counter driven by the per-arch timer (PIT / generic
//! timer) through the logical Timer IRQ. Scheduling quanta and sleeps are
//! measured in these ticks.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::irq::{self, LogicalIrq};

/// Scheduler tick rate.
pub const TICK_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TICK_HZ as u64
}

fn timer_tick(_irq: LogicalIrq, _data: usize) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::timer::rearm();
    crate::sched::on_tick(now);
}

/// Register the tick handler and start the hardware timer.
pub fn init() {
    irq::register(LogicalIrq::Timer, 0, timer_tick, 0).expect("timer line must be free at boot");
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::timer_init(TICK_HZ);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::timer_init(TICK_HZ);
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    crate::arch::aarch64::timer_init(TICK_HZ);
    log::info!(target: "timer", "tick source at {} Hz", TICK_HZ);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_through_the_irq_path() {
        crate::sched::init_for_tests();
        let line = LogicalIrq::Timer.physical(0);
        // Install the handler the way init() would (idempotent across
        // parallel tests: first registration wins).
        let _ = irq::register(LogicalIrq::Timer, 0, timer_tick, 0);

        let before = ticks();
        irq::dispatch_physical(line);
        irq::dispatch_physical(line);
        assert!(ticks() >= before + 2);
        assert!(uptime_ms() >= (before + 2) * 1000 / TICK_HZ as u64);
    }
}
