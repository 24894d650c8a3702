// Synchronization primitives

pub mod mutex;
pub mod once;
pub mod semaphore;
pub mod spinlock;

pub use mutex::Mutex;
pub use once::InitCell;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockIrq};
