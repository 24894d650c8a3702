//! PL011 UART console (QEMU virt base address)

use core::{fmt, ptr};

use spin::Mutex;

const UART0_BASE: usize = 0x0900_0000;
const UARTDR: usize = 0x00;
const UARTFR: usize = 0x18;
const FR_TXFF: u32 = 1 << 5;

struct Pl011;

static UART: Mutex<Pl011> = Mutex::new(Pl011);

impl Pl011 {
    fn write_byte(&mut self, byte: u8) {
        // SAFETY: MMIO to the PL011 data/flag registers; the flag poll
        // guards against FIFO overrun.
        unsafe {
            while ptr::read_volatile((UART0_BASE + UARTFR) as *const u32) & FR_TXFF != 0 {
                core::hint::spin_loop();
            }
            ptr::write_volatile((UART0_BASE + UARTDR) as *mut u32, byte as u32);
        }
    }
}

impl fmt::Write for Pl011 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    let flags = crate::arch::irq_save();
    UART.lock().write_fmt(args).ok();
    crate::arch::irq_restore(flags);
}
