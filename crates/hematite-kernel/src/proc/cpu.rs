//! Per-CPU state.
//!
//! Each hart owns one `Cpu` record: the process it is running, the
//! scheduler context it switches back to, and the interrupt-discipline
//! counters used by `push_off`/`pop_off`. A record is only ever touched
//! from its own hart (the context-switch handoff is the synchronization
//! point when the hart moves between threads), which is what justifies
//! the `Cell` fields and the `Sync` impl.

use hematite_machine::hart::{hart_id, Context, NOHART};
use std::cell::Cell;

pub struct Cpu {
    /// Scheduler context; `sched` switches here.
    pub context: Context,
    /// Index of the process running on this cpu, if any.
    proc_idx: Cell<Option<usize>>,
    /// Depth of `push_off` nesting.
    noff: Cell<i32>,
    /// Were interrupts enabled before the first `push_off`?
    intena: Cell<bool>,
    /// Current device-interrupt enable state of this hart.
    ints_on: Cell<bool>,
}

unsafe impl Sync for Cpu {}

impl Cpu {
    pub fn new(context: Context) -> Self {
        Cpu {
            context,
            proc_idx: Cell::new(None),
            noff: Cell::new(0),
            intena: Cell::new(false),
            ints_on: Cell::new(false),
        }
    }

    pub fn proc_idx(&self) -> Option<usize> {
        self.proc_idx.get()
    }

    pub fn set_proc_idx(&self, idx: Option<usize>) {
        self.proc_idx.set(idx);
    }

    pub fn noff(&self) -> i32 {
        self.noff.get()
    }

    pub fn set_noff(&self, n: i32) {
        self.noff.set(n);
    }

    pub fn intena(&self) -> bool {
        self.intena.get()
    }

    pub fn set_intena(&self, v: bool) {
        self.intena.set(v);
    }

    pub fn ints_on(&self) -> bool {
        self.ints_on.get()
    }

    pub fn set_ints_on(&self, v: bool) {
        self.ints_on.set(v);
    }
}

thread_local! {
    static CPU_BASE: Cell<*const Cpu> = const { Cell::new(core::ptr::null()) };
}

/// Bind this thread to a kernel's cpu array. Every kernel thread (hart
/// schedulers and process tasks) does this before touching a lock.
pub fn bind_cpus(cpus: &[Cpu]) {
    CPU_BASE.with(|c| c.set(cpus.as_ptr()));
}

/// The calling hart's cpu record.
///
/// The returned reference points into the kernel singleton, which every
/// kernel thread keeps alive; the `'static` lifetime is a convenience.
pub fn mycpu() -> &'static Cpu {
    let base = CPU_BASE.with(|c| c.get());
    let id = hart_id();
    assert!(
        !base.is_null() && id != NOHART,
        "mycpu: thread is not a bound hart"
    );
    unsafe { &*base.add(id) }
}

/// Enable device interrupts on this hart (bookkeeping only in the hosted
/// machine; the discipline checks are what matter).
pub fn intr_on() {
    mycpu().set_ints_on(true);
}

pub fn intr_off() {
    mycpu().set_ints_on(false);
}

pub fn intr_get() -> bool {
    mycpu().ints_on()
}
