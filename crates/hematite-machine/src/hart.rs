//! Harts and the context-switch primitive.
//!
//! A hart is a host thread with a thread-local hart id. Kernel tasks are
//! also host threads; `swtch` suspends the caller into `old` and hands the
//! hart to whichever thread is parked in `new` (spawning it on first use).
//! This is the hosted stand-in for the architecture's context-switch
//! assembly: it transfers control and hart identity, and touches no
//! interrupt state.
//!
//! Contract for callers (the scheduler and `sched`): the switching thread
//! performs no per-hart accesses between handing off and suspending; the
//! park/unpark handoff is the synchronization point between the two
//! threads sharing a hart.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

/// Hart id of a thread that is not currently a hart.
pub const NOHART: usize = usize::MAX;

thread_local! {
    static HART_ID: Cell<usize> = const { Cell::new(NOHART) };
}

/// Hart id of the calling thread.
pub fn hart_id() -> usize {
    HART_ID.with(|h| h.get())
}

pub fn set_hart_id(id: usize) {
    HART_ID.with(|h| h.set(id));
}

/// Unwind payload used to release parked kernel tasks at power-off.
/// Raised with `resume_unwind`, so no panic hook fires for it.
pub struct HaltUnwind;

/// Shared halt state: once set, every parked context is released and
/// unwinds out of the kernel so the host process can tear down.
pub(crate) struct HaltHub {
    halted: AtomicBool,
    contexts: Mutex<Vec<Weak<CtxShared>>>,
}

impl HaltHub {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(HaltHub {
            halted: AtomicBool::new(false),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        let contexts = self.contexts.lock().unwrap();
        for weak in contexts.iter() {
            if let Some(ctx) = weak.upgrade() {
                let mut token = ctx.token.lock().unwrap();
                *token = true;
                ctx.cv.notify_all();
            }
        }
    }

    fn register(self: &Arc<Self>, ctx: &Arc<CtxShared>) {
        self.contexts.lock().unwrap().push(Arc::downgrade(ctx));
    }
}

pub(crate) struct CtxShared {
    /// Hand-off token: true while this context owns a pending resume.
    token: Mutex<bool>,
    cv: Condvar,
    /// Hart granted to this context by the last switch towards it.
    hart: AtomicUsize,
    started: AtomicBool,
    /// Set when the context's owner is recycled; whoever parks here next
    /// unwinds instead of resuming.
    dead: AtomicBool,
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    hub: Arc<HaltHub>,
}

/// A suspendable kernel execution. One thread may be parked in a context
/// at a time; `swtch` moves the hart between two of them. A `Context` is
/// a cheap handle: clones share the same parking spot, so callers can
/// hold one across a switch while the owning structure is torn down.
pub struct Context {
    shared: Arc<CtxShared>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Context {
            shared: self.shared.clone(),
        }
    }
}

impl Context {
    pub(crate) fn new(hub: Arc<HaltHub>, entry: Option<Box<dyn FnOnce() + Send>>) -> Self {
        let shared = Arc::new(CtxShared {
            token: Mutex::new(false),
            cv: Condvar::new(),
            hart: AtomicUsize::new(NOHART),
            // A context without an entry belongs to an already-running
            // thread that will park in it.
            started: AtomicBool::new(entry.is_none()),
            dead: AtomicBool::new(false),
            entry: Mutex::new(entry),
            hub: hub.clone(),
        });
        hub.register(&shared);
        Context { shared }
    }

    fn resume(&self) {
        if !self.shared.started.swap(true, Ordering::SeqCst) {
            let sh = self.shared.clone();
            std::thread::Builder::new()
                .name("kernel-task".into())
                .spawn(move || {
                    set_hart_id(sh.hart.load(Ordering::SeqCst));
                    let entry = sh
                        .entry
                        .lock()
                        .unwrap()
                        .take()
                        .expect("context entry already consumed");
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
                    if let Err(payload) = result {
                        if !payload.is::<HaltUnwind>() {
                            // A kernel invariant blew up on this task. The
                            // panic hook already printed the diagnostic;
                            // halt the machine so nothing waits forever.
                            log::error!("kernel task panicked, halting machine");
                            sh.hub.halt();
                        }
                    }
                })
                .expect("failed to spawn kernel task");
        } else {
            let mut token = self.shared.token.lock().unwrap();
            *token = true;
            self.shared.cv.notify_one();
        }
    }

    fn suspend(&self) {
        let mut token = self.shared.token.lock().unwrap();
        while !*token {
            token = self.shared.cv.wait(token).unwrap();
        }
        *token = false;
        drop(token);
        if self.shared.hub.is_halted() || self.shared.dead.load(Ordering::SeqCst) {
            std::panic::resume_unwind(Box::new(HaltUnwind));
        }
        set_hart_id(self.shared.hart.load(Ordering::SeqCst));
    }

    /// Release whatever is (or will next be) parked in this context,
    /// unwinding it out of the kernel. Used when a process slot is
    /// recycled: the exited task's thread ends instead of waiting for a
    /// switch that will never come.
    pub fn retire(&self) {
        self.shared.dead.store(true, Ordering::SeqCst);
        let mut token = self.shared.token.lock().unwrap();
        *token = true;
        self.shared.cv.notify_all();
    }
}

/// Suspend the calling thread into `old` and grant its hart to `new`.
/// Returns when some other execution switches back into `old`.
pub fn swtch(old: &Context, new: &Context) {
    new.shared.hart.store(hart_id(), Ordering::SeqCst);
    new.resume();
    old.suspend();
}
