//! Sleeplocks: long-term locks held across disk I/O and voluntary
//! yields. Acquisition blocks in `proc_sleep` on the lock's own address
//! when contended; release wakes all waiters.

use super::spinlock::SpinLock;
use crate::Kernel;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

struct SleepInner {
    locked: bool,
    /// pid of the holder, for diagnostics.
    pid: i32,
}

pub struct SleepLock<T> {
    inner: SpinLock<SleepInner>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        SleepLock {
            inner: SpinLock::new(name, SleepInner {
                locked: false,
                pid: 0,
            }),
            data: UnsafeCell::new(data),
        }
    }

    fn chan(&self) -> usize {
        self as *const _ as usize
    }

    /// Acquire, sleeping while another process holds the lock. Requires
    /// process context.
    pub fn lock<'a>(&'a self, kern: &'a Kernel) -> SleepGuard<'a, T> {
        let mut inner = self.inner.lock();
        while inner.locked {
            inner = kern.sleep_guard(self.chan(), inner);
        }
        inner.locked = true;
        inner.pid = kern.current_pid();
        drop(inner);
        SleepGuard { lock: self, kern }
    }

    pub fn holding(&self, kern: &Kernel) -> bool {
        let inner = self.inner.lock();
        inner.locked && inner.pid == kern.current_pid()
    }

    /// Direct access without taking the lock.
    ///
    /// # Safety
    /// Only sound when no other holder can exist, e.g. while claiming a
    /// cache slot whose reference count is zero.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct SleepGuard<'a, T> {
    lock: &'a SleepLock<T>,
    kern: &'a Kernel,
}

impl<'a, T> Deref for SleepGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SleepGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SleepGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        inner.locked = false;
        inner.pid = 0;
        drop(inner);
        self.kern.wakeup(self.lock.chan());
    }
}
