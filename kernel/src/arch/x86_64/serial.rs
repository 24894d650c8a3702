//! COM1 serial console (16550 UART)

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; nothing else in the
        // kernel drives these ports.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    // Interrupt handlers log too; keep the lock IRQ-free to avoid
    // self-deadlock on the console.
    let flags = crate::arch::irq_save();
    COM1.lock().write_fmt(args).ok();
    crate::arch::irq_restore(flags);
}
