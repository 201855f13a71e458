pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::{SleepGuard, SleepLock};
pub use spinlock::{pop_off, push_off, RawSpinLock, SpinLock, SpinLockGuard};
