//! Kernel spinlocks
//!
//! [`SpinLock`] is a single-word lock acquired with an atomic exchange and
//! released with a store-release, so the primitives stay correct if SMP ever
//! arrives. [`SpinLockIrq`] additionally disables interrupts for the lifetime
//! of the guard; every lock shared with interrupt context must use it.

use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Busy-waiting mutual exclusion lock.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The lock serializes all access to the inner value, so sharing a
// SpinLock between threads is safe whenever the value itself may be sent.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
// SAFETY: Ownership transfer of the whole lock moves the value with it.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock, spinning with a pause/yield hint while contended.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Returns the guard on success, `None` if someone else holds the lock.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinGuard { lock: self })
        }
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Guard for [`SpinLock`]; releases on drop.
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means the exchange in lock() succeeded,
        // so no other reference to the inner value exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Same exclusivity argument as Deref.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Spinlock whose guard also keeps interrupts disabled.
///
/// The interrupt flag is saved on acquire and restored on release, so nested
/// acquisitions compose (the inner release leaves interrupts off).
pub struct SpinLockIrq<T: ?Sized> {
    inner: SpinLock<T>,
}

impl<T> SpinLockIrq<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: SpinLock::new(data),
        }
    }
}

impl<T: ?Sized> SpinLockIrq<T> {
    /// Disable interrupts, then acquire the lock.
    pub fn lock(&self) -> SpinIrqGuard<'_, T> {
        let flags = crate::arch::irq_save();
        let guard = self.inner.lock();
        SpinIrqGuard {
            guard: core::mem::ManuallyDrop::new(guard),
            flags,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard for [`SpinLockIrq`]; restores the saved interrupt flag after
/// releasing the lock.
pub struct SpinIrqGuard<'a, T: ?Sized> {
    guard: core::mem::ManuallyDrop<SpinGuard<'a, T>>,
    flags: usize,
}

impl<T: ?Sized> Deref for SpinIrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for SpinIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for SpinIrqGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: The guard is dropped exactly once, here, before the
        // interrupt flag is restored. Release order matters: dropping the
        // inner guard first keeps the lock protocol IRQ-safe.
        unsafe { core::mem::ManuallyDrop::drop(&mut self.guard) };
        crate::arch::irq_restore(self.flags);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = SpinLock::new(7u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn irq_variant_nests() {
        let lock = SpinLockIrq::new(0u64);
        *lock.lock() = 5;
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        use std::sync::Arc;

        const THREADS: usize = 8;
        const ITERS: usize = 10_000;

        let lock = Arc::new(SpinLock::new(0usize));
        let mut handles = std::vec::Vec::new();
        for _ in 0..THREADS {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ITERS {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().expect("worker thread panicked");
        }
        assert_eq!(*lock.lock(), THREADS * ITERS);
    }
}
