//! Counting semaphore
//!
//! `wait` decrements a positive count or blocks on the semaphore's address;
//! `signal` increments (saturating) and wakes the channel. The same
//! block-while-locked discipline as [`crate::sync::Mutex`] rules out the
//! lost-wakeup race.

use crate::{sched, sync::spinlock::SpinLock};

/// Counting semaphore.
pub struct Semaphore {
    count: SpinLock<i32>,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub const fn new(initial: i32) -> Self {
        Self {
            count: SpinLock::new(initial),
        }
    }

    fn channel(&self) -> usize {
        self as *const Self as usize
    }

    /// Decrement the count, blocking while it is zero.
    pub fn wait(&self) {
        loop {
            let mut count = self.count.lock();
            if *count > 0 {
                *count -= 1;
                return;
            }
            sched::prepare_block(self.channel());
            drop(count);
            sched::schedule();
        }
    }

    /// Decrement the count if positive; never blocks.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Increment the count (saturating at `i32::MAX`) and wake one round of
    /// waiters on the channel.
    pub fn signal(&self) {
        {
            let mut count = self.count.lock();
            *count = count.saturating_add(1);
        }
        sched::wakeup(self.channel());
    }

    /// Current count. Snapshot only; stale by the time the caller looks.
    pub fn value(&self) -> i32 {
        *self.count.lock()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn wait_consumes_available_count() {
        crate::sched::init_for_tests();
        let sem = Semaphore::new(1);
        sem.wait();
        assert_eq!(sem.value(), 0);
        assert!(!sem.try_wait());
        sem.signal();
        assert_eq!(sem.value(), 1);
        assert!(sem.try_wait());
    }

    #[test]
    fn signal_saturates() {
        let sem = Semaphore::new(i32::MAX);
        sem.signal();
        assert_eq!(sem.value(), i32::MAX);
    }

    #[test]
    fn signal_wakes_a_parked_task() {
        crate::sched::init_for_tests();
        let sem = Semaphore::new(0);

        // Park a synthetic task on the semaphore's channel the same way
        // wait() would, then check signal() moves it back to Ready.
        let pid = sched::spawn_kernel_for_tests("sem-waiter");
        sched::block_task(pid, &sem as *const Semaphore as usize)
            .expect("freshly spawned task should be blockable");
        assert_eq!(sched::task_state(pid), Some(sched::TaskState::Blocked));

        sem.signal();
        assert_eq!(sched::task_state(pid), Some(sched::TaskState::Ready));
        assert_eq!(sem.value(), 1);
    }
}
