//! Process table, scheduler, sleep/wakeup, fork/wait/exit.
//!
//! Locking discipline, outermost first: the global wait-lock (parent
//! links), then a single process-slot lock, then subsystem locks. Slot
//! locks are taken one at a time during table sweeps, never two at once.
//! State transitions happen only under the owning slot's lock; `Running`
//! means exactly one cpu has switched to the process; a `Zombie` stays
//! put until its parent consumes it in `wait`.

pub mod cpu;

use crate::memlayout::{kstack, FINISHER, TRAPFRAME};
use crate::param::{NOFILE, NPROC, ROOTDEV, TICK_MS};
use crate::pmem::Pool;
use crate::riscv::{PteFlags, PGSIZE};
use crate::sync::{RawSpinLock, SpinLockGuard};
use crate::uland::{Trapframe, UserEnv};
use crate::vm::{self, mmap, uvm};
use crate::Kernel;
use cpu::mycpu;
use hematite_fs::ROOTINO;
use hematite_machine::devices::power::FINISHER_PASS;
use hematite_machine::hart::{swtch, Context};
use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;
use zerocopy::{AsBytes, FromZeroes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

/// A user program: the hosted stand-in for the process's user image.
pub type UserMain = Box<dyn FnOnce(&mut UserEnv) -> i32 + Send + 'static>;

/// Fields private to the running process. The slot lock guards them
/// only during setup (alloc/fork) and teardown (free); in between they
/// belong to the process itself.
pub struct ProcData {
    pub kstack: u64,
    pub pgtbl: u64,
    pub tf_pa: u64,
    pub heap_top: u64,
    pub ustack_pages: u32,
    /// Head of the sorted mapped-region list, `RNONE` if empty.
    pub mmap_head: u32,
    pub context: Option<Context>,
    pub name: String,
    pub user_entry: Option<UserMain>,
    /// Continuation staged by the user runtime for the next fork.
    pub pending_child: Option<UserMain>,
    pub cwd: Option<crate::fs::Iref>,
    /// Per-process descriptor table: indices into the file table.
    pub ofile: [Option<usize>; NOFILE],
}

impl ProcData {
    fn new() -> Self {
        ProcData {
            kstack: 0,
            pgtbl: 0,
            tf_pa: 0,
            heap_top: 0,
            ustack_pages: 0,
            mmap_head: mmap::RNONE,
            context: None,
            name: String::new(),
            user_entry: None,
            pending_child: None,
            cwd: None,
            ofile: [None; NOFILE],
        }
    }
}

pub struct Proc {
    pub lock: RawSpinLock,
    // Guarded by `lock`:
    state: Cell<ProcState>,
    chan: Cell<usize>,
    killed: Cell<bool>,
    xstate: Cell<i32>,
    pid: Cell<i32>,
    // Guarded by the global wait-lock:
    parent: Cell<Option<usize>>,
    data: UnsafeCell<ProcData>,
}

// Slot fields follow the locking discipline above.
unsafe impl Sync for Proc {}

impl Proc {
    pub(crate) fn new() -> Self {
        Proc {
            lock: RawSpinLock::new("proc"),
            state: Cell::new(ProcState::Unused),
            chan: Cell::new(0),
            killed: Cell::new(false),
            xstate: Cell::new(0),
            pid: Cell::new(0),
            parent: Cell::new(None),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn state(&self) -> ProcState {
        self.state.get()
    }

    pub fn pid(&self) -> i32 {
        self.pid.get()
    }

    pub fn killed(&self) -> bool {
        self.killed.get()
    }

    /// # Safety
    /// Caller must be the owning process, or hold the slot lock during
    /// setup/teardown.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut ProcData {
        &mut *self.data.get()
    }
}

impl Kernel {
    /// Index of the process running on this hart, if any.
    pub fn myproc_idx(&self) -> Option<usize> {
        crate::sync::push_off();
        let idx = mycpu().proc_idx();
        crate::sync::pop_off();
        idx
    }

    pub fn myproc(&self) -> &Proc {
        &self.procs[self.myproc_idx().expect("no current process")]
    }

    pub fn current_pid(&self) -> i32 {
        self.myproc().pid()
    }

    /// Private data of the current process.
    ///
    /// # Safety
    /// Must run in process context; see [`Proc::data`].
    pub(crate) unsafe fn cur_data(&self) -> &mut ProcData {
        self.myproc().data()
    }

    /// Stable sleep channel for a process slot.
    pub fn proc_chan(&self, idx: usize) -> usize {
        &self.procs[idx] as *const Proc as usize
    }

    pub fn init_slot(&self) -> usize {
        self.init_slot.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn alloc_pid(&self) -> i32 {
        let mut next = self.next_pid.lock();
        let pid = *next;
        assert!(pid > 0, "alloc_pid: overflow");
        *next += 1;
        pid
    }

    /// Claim an unused slot: assign a pid, allocate the trapframe frame
    /// and a fresh page table, and arm a new kernel task for the slot.
    /// Returns with the slot lock held. No free slot is fatal.
    fn proc_alloc(self: &Arc<Self>) -> usize {
        for i in 0..NPROC {
            let p = &self.procs[i];
            p.lock.acquire();
            if p.state.get() != ProcState::Unused {
                p.lock.release();
                continue;
            }

            p.pid.set(self.alloc_pid());
            let mem = self.mem();
            let data = unsafe { p.data() };
            data.tf_pa = self.pmem.alloc(mem, Pool::Kernel);
            mem.fill(data.tf_pa, PGSIZE as usize, 0);
            data.pgtbl = uvm::create_pgtbl(mem, &self.pmem, data.tf_pa);
            data.kstack = kstack(i);
            data.mmap_head = mmap::RNONE;
            let kern = self.clone();
            data.context = Some(
                self.machine
                    .new_context(Some(Box::new(move || task_entry(kern, i)))),
            );
            return i;
        }
        panic!("proc_alloc: out of process slots");
    }

    /// Release everything a slot owns and mark it unused. Caller holds
    /// the slot lock; open files and cwd must already be gone (exit
    /// drops them in its own context).
    pub(crate) fn proc_free(&self, idx: usize) {
        let p = &self.procs[idx];
        assert!(p.lock.holding(), "proc_free: lock");
        let mem = self.mem();
        let data = unsafe { p.data() };

        if data.tf_pa != 0 {
            self.pmem.free(mem, data.tf_pa, Pool::Kernel);
            data.tf_pa = 0;
        }
        if data.pgtbl != 0 {
            uvm::destroy_pgtbl(mem, &self.pmem, data.pgtbl);
            data.pgtbl = 0;
        }
        mmap::release_list(&self.mmap_pool, data.mmap_head);
        data.mmap_head = mmap::RNONE;
        if let Some(ctx) = data.context.take() {
            ctx.retire();
        }
        data.user_entry = None;
        data.pending_child = None;
        data.heap_top = 0;
        data.ustack_pages = 0;
        data.kstack = 0;
        data.name.clear();
        debug_assert!(data.cwd.is_none() && data.ofile.iter().all(|f| f.is_none()));

        p.pid.set(0);
        p.parent.set(None);
        p.chan.set(0);
        p.killed.set(false);
        p.xstate.set(0);
        p.state.set(ProcState::Unused);
    }

    /// Build the first user process: one code page at `PGSIZE` standing
    /// in for the embedded init image, one stack page below the
    /// trapframe, and the init continuation as its program.
    pub(crate) fn proc_make_first(self: &Arc<Self>, main: UserMain) {
        let idx = self.proc_alloc();
        let p = &self.procs[idx];
        let mem = self.mem();
        let data = unsafe { p.data() };

        let code_pa = self.pmem.alloc(mem, Pool::User);
        mem.fill(code_pa, PGSIZE as usize, 0);
        vm::map_pages(
            mem,
            &self.pmem,
            data.pgtbl,
            PGSIZE,
            code_pa,
            PGSIZE,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
        );

        let stack_pa = self.pmem.alloc(mem, Pool::User);
        vm::map_pages(
            mem,
            &self.pmem,
            data.pgtbl,
            TRAPFRAME - PGSIZE,
            stack_pa,
            PGSIZE,
            PteFlags::R | PteFlags::W | PteFlags::U,
        );

        data.ustack_pages = 1;
        data.heap_top = 2 * PGSIZE;
        data.name = "init".into();
        data.user_entry = Some(main);
        data.cwd = Some(self.itable.iget(ROOTDEV, ROOTINO));

        let mut tf = Trapframe::new_zeroed();
        tf.epc = PGSIZE;
        tf.sp = TRAPFRAME;
        mem.write_bytes(data.tf_pa, tf.as_bytes());

        self.init_slot
            .store(idx, std::sync::atomic::Ordering::SeqCst);
        p.state.set(ProcState::Runnable);
        p.lock.release();
        log::info!("proc: first process created (pid={})", p.pid.get());
    }

    /// Duplicate the current process. The child's address space, mapped
    /// regions, trapframe (with a zero return value), open files and cwd
    /// all mirror the parent's; its user continuation is whatever the
    /// runtime staged for this fork.
    pub fn fork(self: &Arc<Self>) -> i64 {
        let pidx = self.myproc_idx().expect("fork: no process");
        let pdata = unsafe { self.cur_data() };
        let Some(entry) = pdata.pending_child.take() else {
            return -1;
        };

        let cidx = self.proc_alloc();
        let cp = &self.procs[cidx];
        let mem = self.mem();
        let cdata = unsafe { cp.data() };

        let regions = mmap::collect(&self.mmap_pool, pdata.mmap_head);
        uvm::copy_pgtbl(
            mem,
            &self.pmem,
            pdata.pgtbl,
            cdata.pgtbl,
            pdata.heap_top,
            pdata.ustack_pages,
            &regions,
        );
        cdata.heap_top = pdata.heap_top;
        cdata.ustack_pages = pdata.ustack_pages;
        cdata.mmap_head = mmap::clone_list(&self.mmap_pool, pdata.mmap_head);

        mem.copy_within(cdata.tf_pa, pdata.tf_pa, PGSIZE as usize);
        let mut tf = self.read_trapframe(cdata.tf_pa);
        tf.a0 = 0; // fork returns 0 in the child
        mem.write_bytes(cdata.tf_pa, tf.as_bytes());

        for fd in 0..NOFILE {
            if let Some(fi) = pdata.ofile[fd] {
                self.file_dup(fi);
                cdata.ofile[fd] = Some(fi);
            }
        }
        cdata.cwd = pdata.cwd.as_ref().map(|ip| self.idup(ip));
        cdata.name = pdata.name.clone();
        cdata.user_entry = Some(entry);

        let pid = cp.pid.get();
        cp.lock.release();

        self.wait_lock.acquire();
        cp.parent.set(Some(pidx));
        self.wait_lock.release();

        cp.lock.acquire();
        cp.state.set(ProcState::Runnable);
        cp.lock.release();

        pid as i64
    }

    // Pass this process's abandoned children to init, waking it for any
    // zombie among them. Caller holds the wait-lock.
    fn reparent(&self, parent_idx: usize) {
        let init = self.init_slot();
        for i in 0..NPROC {
            if self.procs[i].parent.get() == Some(parent_idx) {
                self.procs[i].parent.set(Some(init));
                self.wakeup(self.proc_chan(init));
            }
        }
    }

    /// Terminate the current process: release its files and cwd, hand
    /// children to init, wake the parent, and yield into the scheduler
    /// as a zombie, never to return. The initial process may not exit.
    pub fn proc_exit(&self, status: i32) -> ! {
        let idx = self.myproc_idx().expect("exit: no process");
        assert!(idx != self.init_slot(), "init exiting");
        let data = unsafe { self.cur_data() };

        for fd in 0..NOFILE {
            if let Some(fi) = data.ofile[fd].take() {
                self.file_close(fi);
            }
        }
        if let Some(cwd) = data.cwd.take() {
            self.begin_op();
            self.iput(cwd);
            self.end_op();
        }

        self.wait_lock.acquire();
        self.reparent(idx);
        if let Some(parent) = self.procs[idx].parent.get() {
            self.wakeup(self.proc_chan(parent));
        }

        let p = &self.procs[idx];
        p.lock.acquire();
        p.xstate.set(status);
        p.state.set(ProcState::Zombie);
        self.wait_lock.release();

        self.sched();
        unreachable!("zombie resumed");
    }

    /// Wait for a child to exit. Copies the exit status to `addr` (when
    /// nonzero), frees the child's slot, and returns its pid; returns -1
    /// if the caller has no children.
    pub fn wait(&self, addr: u64) -> i64 {
        let idx = self.myproc_idx().expect("wait: no process");
        let my_chan = self.proc_chan(idx);
        self.wait_lock.acquire();
        loop {
            let mut have_kids = false;
            for i in 0..NPROC {
                if self.procs[i].parent.get() != Some(idx) {
                    continue;
                }
                let pp = &self.procs[i];
                pp.lock.acquire();
                have_kids = true;
                if pp.state.get() == ProcState::Zombie {
                    let pid = pp.pid.get();
                    if addr != 0 {
                        let status = pp.xstate.get();
                        let pgtbl = unsafe { self.cur_data() }.pgtbl;
                        if uvm::copyout(
                            self.mem(),
                            &self.pmem,
                            pgtbl,
                            addr,
                            &status.to_le_bytes(),
                        )
                        .is_err()
                        {
                            pp.lock.release();
                            self.wait_lock.release();
                            return -1;
                        }
                    }
                    self.proc_free(i);
                    pp.lock.release();
                    self.wait_lock.release();
                    return pid as i64;
                }
                pp.lock.release();
            }

            if !have_kids || self.current_killed() {
                self.wait_lock.release();
                return -1;
            }
            // Sleep on our own slot; exit wakes us here.
            self.sleep_raw(my_chan, &self.wait_lock);
        }
    }

    /// Give up the cpu for one scheduling round.
    pub fn proc_yield(&self) {
        let p = self.myproc();
        p.lock.acquire();
        p.state.set(ProcState::Runnable);
        self.sched();
        p.lock.release();
    }

    /// Switch to this hart's scheduler. Caller holds exactly the
    /// current slot's lock, with interrupts pushed off.
    fn sched(&self) {
        let p = self.myproc();
        assert!(p.lock.holding(), "sched: proc lock not held");
        assert_eq!(mycpu().noff(), 1, "sched: holding locks");
        assert!(p.state.get() != ProcState::Running, "sched: running");
        assert!(!cpu::intr_get(), "sched: interruptible");

        let intena = mycpu().intena();
        let pctx = unsafe { p.data() }
            .context
            .as_ref()
            .expect("sched: no context")
            .clone();
        swtch(&pctx, &mycpu().context);
        mycpu().set_intena(intena);
    }

    /// Sleep on `chan`, releasing `lk` for the duration. The slot lock
    /// is taken before `lk` is dropped, so a concurrent `wakeup(chan)`
    /// cannot slip between release and sleep.
    pub fn sleep_raw(&self, chan: usize, lk: &RawSpinLock) {
        let p = self.myproc();
        assert!(
            !std::ptr::eq(lk, &p.lock),
            "sleep: would sleep on the lock being released"
        );
        p.lock.acquire();
        lk.release();

        p.chan.set(chan);
        p.state.set(ProcState::Sleeping);
        self.sched();
        p.chan.set(0);

        p.lock.release();
        lk.acquire();
    }

    /// Guard-based flavor of [`Kernel::sleep_raw`]: releases the guard,
    /// sleeps, and hands back a re-acquired guard.
    pub fn sleep_guard<'a, T>(
        &self,
        chan: usize,
        guard: SpinLockGuard<'a, T>,
    ) -> SpinLockGuard<'a, T> {
        let lk = guard.spinlock();
        let p = self.myproc();
        p.lock.acquire();
        drop(guard);

        p.chan.set(chan);
        p.state.set(ProcState::Sleeping);
        self.sched();
        p.chan.set(0);

        p.lock.release();
        lk.lock()
    }

    /// Make every process sleeping on `chan` runnable (except the
    /// caller itself).
    pub fn wakeup(&self, chan: usize) {
        let me = self.myproc_idx();
        for i in 0..NPROC {
            if Some(i) == me {
                continue;
            }
            let p = &self.procs[i];
            p.lock.acquire();
            if p.state.get() == ProcState::Sleeping && p.chan.get() == chan {
                p.state.set(ProcState::Runnable);
            }
            p.lock.release();
        }
    }

    /// Flag `pid` for termination, kicking it out of any sleep. The
    /// victim notices at its next syscall boundary.
    pub fn kill(&self, pid: i32) -> i64 {
        for i in 0..NPROC {
            let p = &self.procs[i];
            p.lock.acquire();
            if p.state.get() != ProcState::Unused && p.pid.get() == pid {
                p.killed.set(true);
                if p.state.get() == ProcState::Sleeping {
                    p.state.set(ProcState::Runnable);
                }
                p.lock.release();
                return 0;
            }
            p.lock.release();
        }
        -1
    }

    pub fn current_killed(&self) -> bool {
        let p = self.myproc();
        p.lock.acquire();
        let k = p.killed.get();
        p.lock.release();
        k
    }

    /// Per-hart scheduler loop: sweep the table, run the first runnable
    /// process found, repeat until power-off. The switched-to task
    /// inherits the slot lock and releases it; it is held again here
    /// when the task switches back.
    pub(crate) fn scheduler(&self, hart: usize) {
        let c = &self.cpus[hart];
        c.set_proc_idx(None);
        loop {
            if self.machine.halted() {
                return;
            }
            // Let devices preempt between sweeps.
            cpu::intr_on();
            self.clock_tick();

            let mut ran = false;
            for i in 0..NPROC {
                let p = &self.procs[i];
                p.lock.acquire();
                if p.state.get() == ProcState::Runnable {
                    p.state.set(ProcState::Running);
                    c.set_proc_idx(Some(i));
                    let pctx = unsafe { p.data() }
                        .context
                        .as_ref()
                        .expect("runnable without context")
                        .clone();
                    swtch(&c.context, &pctx);
                    c.set_proc_idx(None);
                    ran = true;
                }
                p.lock.release();
                if self.machine.halted() {
                    return;
                }
            }
            if !ran {
                std::thread::yield_now();
            }
        }
    }

    // Advance the tick counter to match wall-clock time and wake
    // sleepers; the hosted stand-in for the timer interrupt, taken from
    // the scheduler loop.
    fn clock_tick(&self) {
        let now = self.boot_instant.elapsed().as_millis() as u64 / TICK_MS;
        let mut t = self.ticks.lock();
        if *t < now {
            *t = now;
            let chan = self.ticks.chan();
            drop(t);
            self.wakeup(chan);
        }
    }

    /// Sleep for `n` ticks; returns -1 early if killed.
    pub fn sleep_ticks(&self, n: u64) -> i64 {
        let mut t = self.ticks.lock();
        let t0 = *t;
        while *t < t0 + n {
            if self.current_killed() {
                return -1;
            }
            t = self.sleep_guard(self.ticks.chan(), t);
        }
        0
    }

    pub fn getticks(&self) -> u64 {
        *self.ticks.lock()
    }

    pub fn read_trapframe(&self, tf_pa: u64) -> Trapframe {
        let mut raw = [0u8; core::mem::size_of::<Trapframe>()];
        self.mem().read_bytes(tf_pa, &mut raw);
        zerocopy::FromBytes::read_from(&raw[..]).unwrap()
    }

    /// Power the machine off with an exit code; used when init's user
    /// program finishes.
    pub fn shutdown(&self, code: i32) {
        log::info!("machine shutdown requested (code {})", code);
        self.machine
            .mmio_write_u32(FINISHER, FINISHER_PASS | ((code as u32 & 0xffff) << 16));
    }
}

// First code run by a fresh process's kernel task: the scheduler still
// holds our slot lock from the switch. Mirrors a fork-return path: drop
// the lock, make sure the filesystem is up (first process only, in
// process context because the log sleeps), then enter the user program.
fn task_entry(kern: Arc<Kernel>, idx: usize) {
    cpu::bind_cpus(&kern.cpus);
    kern.procs[idx].lock.release();

    kern.fs_once.call_once(|| kern.fs_init(ROOTDEV));

    let main = unsafe { kern.procs[idx].data() }
        .user_entry
        .take()
        .expect("process has no user program");
    let mut env = UserEnv::new(kern.clone());
    let code = main(&mut env);

    if idx == kern.init_slot() {
        kern.shutdown(code);
    } else {
        kern.proc_exit(code);
    }
}
