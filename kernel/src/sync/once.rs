//! Init-once subsystem singletons
//!
//! [`InitCell`] holds global state that is constructed exactly once during
//! early boot (PMM, IRQ table, scheduler) and accessed through closures
//! afterwards. Heap-free on purpose: several of these exist before the
//! allocator does.

use spin::Mutex;

/// A cell initialized once and accessed under a lock thereafter.
pub struct InitCell<T> {
    inner: Mutex<Option<T>>,
}

impl<T> InitCell<T> {
    /// Create a new, empty cell.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Store the value. Fails (returning it) if already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut slot = self.inner.lock();
        if slot.is_some() {
            Err(value)
        } else {
            *slot = Some(value);
            Ok(())
        }
    }

    /// Whether `init` has run.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Run `f` with a shared reference to the value, if initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let slot = self.inner.lock();
        slot.as_ref().map(f)
    }

    /// Run `f` with a mutable reference to the value, if initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut slot = self.inner.lock();
        slot.as_mut().map(f)
    }
}

impl<T> Default for InitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The inner spin::Mutex serializes all access; T: Send suffices
// because no caller ever holds a reference outside the closure.
unsafe impl<T: Send> Send for InitCell<T> {}
// SAFETY: Same argument as Send; the Mutex prevents concurrent access.
unsafe impl<T: Send> Sync for InitCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        let cell = InitCell::new();
        assert!(cell.init(1u32).is_ok());
        assert_eq!(cell.init(2u32), Err(2));
        assert_eq!(cell.with(|v| *v), Some(1));
    }

    #[test]
    fn with_mut_updates_in_place() {
        let cell = InitCell::new();
        assert!(!cell.is_initialized());
        cell.init(10i32).ok();
        cell.with_mut(|v| *v += 5);
        assert_eq!(cell.with(|v| *v), Some(15));
    }
}
