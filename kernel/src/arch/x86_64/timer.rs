//! Programmable interval timer (8253/8254)

use x86_64::instructions::port::Port;

const PIT_FREQUENCY: u32 = 1_193_182;

/// Program channel 0 for a periodic interrupt at `hz`.
pub fn init(hz: u32) {
    let divisor = (PIT_FREQUENCY / hz).clamp(1, 65535) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);
    // SAFETY: Standard PIT mode-3 programming sequence; channel 0 is ours.
    unsafe {
        command.write(0x36); // channel 0, lobyte/hibyte, square wave
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    log::debug!(target: "timer", "PIT at {} Hz (divisor {})", hz, divisor);
}
