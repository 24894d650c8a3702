//! Legacy 8259 PIC pair
//!
//! Remapped so the 16 ISA lines land on vectors 0x20-0x2F, clear of the CPU
//! exception range.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the remapped primary PIC.
pub const PIC_VECTOR_BASE: u8 = 0x20;

// SAFETY: 0x20/0x28 do not collide with CPU exception vectors.
static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(0x20, 0x28) });

/// Remap and unmask the cascade; individual lines stay masked until a
/// handler is registered.
pub fn init() {
    let mut pics = PICS.lock();
    // SAFETY: Standard PIC initialization sequence during early boot with
    // interrupts disabled.
    unsafe {
        pics.initialize();
        pics.write_masks(0xFB, 0xFF); // only the cascade line open
    }
}

/// Acknowledge an interrupt on line `irq` (0-15).
pub fn eoi(irq: u8) {
    // SAFETY: Notifying EOI for a vector we actually received.
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(PIC_VECTOR_BASE + irq)
    }
}

/// Unmask line `irq` (0-15).
pub fn unmask(irq: u8) {
    let mut pics = PICS.lock();
    // SAFETY: Mask registers only gate delivery; no other state changes.
    unsafe {
        let [a, b] = pics.read_masks();
        let (mut a, mut b) = (a, b);
        if irq < 8 {
            a &= !(1 << irq);
        } else {
            b &= !(1 << (irq - 8));
            a &= !(1 << 2); // cascade
        }
        pics.write_masks(a, b);
    }
}

/// Mask line `irq` (0-15).
pub fn mask(irq: u8) {
    let mut pics = PICS.lock();
    // SAFETY: See unmask.
    unsafe {
        let [a, b] = pics.read_masks();
        let (mut a, mut b) = (a, b);
        if irq < 8 {
            a |= 1 << irq;
        } else {
            b |= 1 << (irq - 8);
        }
        pics.write_masks(a, b);
    }
}
