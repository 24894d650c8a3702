//! Programmable interval timer (8253/8254)

use super::outb;

const PIT_FREQUENCY: u32 = 1_193_182;

/// Program channel 0 for a periodic interrupt at `hz`.
pub fn init(hz: u32) {
    let divisor = (PIT_FREQUENCY / hz).clamp(1, 65535) as u16;
    // SAFETY: Standard PIT mode-3 programming sequence; channel 0 is ours.
    unsafe {
        outb(0x43, 0x36);
        outb(0x40, (divisor & 0xFF) as u8);
        outb(0x40, (divisor >> 8) as u8);
    }
    log::debug!(target: "timer", "PIT at {} Hz (divisor {})", hz, divisor);
}
