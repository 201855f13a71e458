//! Spinlocks with the interrupt push/pop discipline.
//!
//! Acquiring any spinlock first disables interrupts on the hart
//! (`push_off`); releasing restores the saved enable state once the
//! nesting depth returns to zero. Holding a spinlock across a voluntary
//! switch is forbidden (the scheduler asserts the depth); re-acquiring a
//! lock the hart already holds is fatal.

use crate::proc::cpu::{intr_get, intr_off, mycpu};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use hematite_machine::hart::{hart_id, NOHART};

/// Disable interrupts, remembering the previous enable state at depth 0.
pub fn push_off() {
    let old = intr_get();
    intr_off();
    let c = mycpu();
    if c.noff() == 0 {
        c.set_intena(old);
    }
    c.set_noff(c.noff() + 1);
}

/// Undo one `push_off`; re-enable interrupts only at depth 0 and only if
/// they were enabled before the outermost `push_off`.
pub fn pop_off() {
    let c = mycpu();
    assert!(!intr_get(), "pop_off: interruptible");
    assert!(c.noff() >= 1, "pop_off: mismatched");
    c.set_noff(c.noff() - 1);
    if c.noff() == 0 && c.intena() {
        c.set_ints_on(true);
    }
}

/// A bare test-and-set spinlock recording its holder hart.
pub struct RawSpinLock {
    locked: AtomicBool,
    cpu: AtomicUsize,
    name: &'static str,
}

impl RawSpinLock {
    pub fn new(name: &'static str) -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NOHART),
            name,
        }
    }

    pub fn acquire(&self) {
        push_off();
        assert!(!self.holding(), "spinlock {}: already holding", self.name);
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        self.cpu.store(hart_id(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        assert!(self.holding(), "spinlock {}: not holding", self.name);
        self.cpu.store(NOHART, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// Is the lock held by this hart? Must be called with interrupts off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == hart_id()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A spinlock guarding a value, in the usual guard style.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.raw.holding()
    }

    /// Stable token for sleep/wakeup rendezvous on this lock's data.
    pub fn chan(&self) -> usize {
        self as *const _ as usize
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard holds; used by `sleep` to release and
    /// re-acquire around a context switch.
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::cpu::{bind_cpus, mycpu, Cpu};
    use hematite_machine::hart::set_hart_id;
    use hematite_machine::{Machine, MachineConfig};

    fn two_cpus() -> (std::sync::Arc<Machine>, Box<[Cpu]>) {
        let machine = Machine::new(MachineConfig {
            dram_bytes: 0x10000,
            disk: vec![0; 512],
        })
        .unwrap();
        let cpus: Box<[Cpu]> = (0..2).map(|_| Cpu::new(machine.new_context(None))).collect();
        (machine, cpus)
    }

    #[test]
    fn push_pop_track_depth_and_enable_state() {
        let (_m, cpus) = two_cpus();
        set_hart_id(0);
        bind_cpus(&cpus);
        crate::proc::cpu::intr_on();

        push_off();
        push_off();
        assert_eq!(mycpu().noff(), 2);
        assert!(!crate::proc::cpu::intr_get());
        pop_off();
        assert!(!crate::proc::cpu::intr_get());
        pop_off();
        // Restored only at depth zero.
        assert!(crate::proc::cpu::intr_get());
        crate::proc::cpu::intr_off();
    }

    #[test]
    fn mutual_exclusion_across_harts() {
        let (_m, cpus) = two_cpus();
        let lock = SpinLock::new("test", 0u64);
        const ROUNDS: u64 = 20_000;

        std::thread::scope(|s| {
            for hart in 0..2usize {
                let cpus = &cpus;
                let lock = &lock;
                s.spawn(move || {
                    set_hart_id(hart);
                    bind_cpus(cpus);
                    for _ in 0..ROUNDS {
                        let mut g = lock.lock();
                        let v = *g;
                        std::hint::spin_loop();
                        *g = v + 1;
                    }
                });
            }
        });

        set_hart_id(0);
        bind_cpus(&cpus);
        assert_eq!(*lock.lock(), 2 * ROUNDS);
    }

    #[test]
    #[should_panic(expected = "already holding")]
    fn reacquire_by_holder_is_fatal() {
        let (_m, cpus) = two_cpus();
        set_hart_id(0);
        bind_cpus(&cpus);
        let lock = RawSpinLock::new("dup");
        lock.acquire();
        lock.acquire();
    }
}
