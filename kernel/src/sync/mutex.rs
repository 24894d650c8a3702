//! Blocking recursive mutex
//!
//! Ownership is tracked by PID and re-entry from the owning task just bumps a
//! recursion count. Contended lockers mark themselves Blocked *while still
//! holding the internal spinlock*, then release it and yield -- the wakeup in
//! `unlock` can therefore never slip between the check and the block.

use crate::{
    sched,
    sync::spinlock::SpinLock,
};

struct MutexState {
    owner: Option<u32>,
    recursion: u32,
}

/// Recursive sleeping mutex.
pub struct Mutex {
    state: SpinLock<MutexState>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(MutexState {
                owner: None,
                recursion: 0,
            }),
        }
    }

    /// The wait channel for this mutex is its own address.
    fn channel(&self) -> usize {
        self as *const Self as usize
    }

    /// Acquire the mutex, blocking the current task while contended.
    pub fn lock(&self) {
        let me = sched::current_pid();
        loop {
            let mut st = self.state.lock();
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.recursion = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    st.recursion += 1;
                    return;
                }
                Some(_) => {
                    // Transition to Blocked before dropping the spinlock so a
                    // concurrent unlock cannot lose the wakeup.
                    sched::prepare_block(self.channel());
                    drop(st);
                    sched::schedule();
                }
            }
        }
    }

    /// Acquire without blocking. Returns false if another task owns it.
    pub fn try_lock(&self) -> bool {
        let me = sched::current_pid();
        let mut st = self.state.lock();
        match st.owner {
            None => {
                st.owner = Some(me);
                st.recursion = 1;
                true
            }
            Some(owner) if owner == me => {
                st.recursion += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one level of ownership; wakes waiters at the outermost drop.
    pub fn unlock(&self) {
        let me = sched::current_pid();
        let release = {
            let mut st = self.state.lock();
            match st.owner {
                Some(owner) if owner == me => {
                    st.recursion -= 1;
                    if st.recursion == 0 {
                        st.owner = None;
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    log::warn!("mutex: unlock by non-owner pid {}", me);
                    false
                }
            }
        };
        if release {
            sched::wakeup(self.channel());
        }
    }

    /// PID of the current owner, if any.
    pub fn owner(&self) -> Option<u32> {
        self.state.lock().owner
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
