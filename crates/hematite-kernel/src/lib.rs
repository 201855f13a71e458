//! The Hematite kernel: a teaching-grade SV39 kernel core running
//! against the machine model in `hematite-machine`.
//!
//! One [`Kernel`] value owns every subsystem: frame pools, the kernel
//! page table, the process table and per-cpu records, the block cache,
//! the log, the inode and file tables. [`Kernel::boot`] starts one
//! scheduler thread per hart: hart 0 initializes the disk driver and
//! builds the first process around the supplied init program, then
//! releases the secondary harts through the `started` flag. The
//! filesystem mounts from the first process, because the log needs a
//! process context to sleep in.

pub mod bio;
pub mod error;
pub mod file;
pub mod fs;
pub mod memlayout;
pub mod param;
pub mod pmem;
pub mod proc;
pub mod riscv;
pub mod sync;
pub mod syscall;
pub mod uland;
pub mod virtio;
pub mod vm;
pub mod wal;

use bio::BufCache;
use file::FileTable;
use fs::InodeTable;
use hematite_fs::Superblock;
use hematite_machine::hart::{hart_id, set_hart_id, HaltUnwind};
use hematite_machine::memory::PhysMemory;
use hematite_machine::Machine;
use pmem::Pmem;
use proc::cpu::{bind_cpus, Cpu};
use proc::{Proc, UserMain};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Instant;
use sync::{RawSpinLock, SpinLock};
use virtio::VirtioDisk;
use vm::mmap::MmapPool;
use wal::Wal;

pub use uland::UserEnv;

pub struct Kernel {
    pub machine: Arc<Machine>,
    pub pmem: Pmem,
    /// Root of the kernel page table.
    pub kpgtbl: u64,
    pub mmap_pool: MmapPool,
    pub cpus: Box<[Cpu]>,
    pub procs: Box<[Proc]>,
    /// Guards parent links during wait/exit/reparenting.
    pub wait_lock: RawSpinLock,
    next_pid: SpinLock<i32>,
    pub ticks: SpinLock<u64>,
    boot_instant: Instant,
    pub vdisk: VirtioDisk,
    pub bcache: BufCache,
    pub log: Wal,
    pub itable: InodeTable,
    pub ftable: FileTable,
    pub(crate) sb: OnceLock<Superblock>,
    started: AtomicBool,
    pub(crate) fs_once: Once,
    init_slot: AtomicUsize,
    init_main: Mutex<Option<UserMain>>,
}

impl Kernel {
    /// Build a kernel over a machine: seed the frame pools, construct
    /// the kernel page table (including per-slot kernel stacks), and
    /// lay out every table. Nothing runs yet.
    pub fn new(machine: Arc<Machine>) -> Arc<Kernel> {
        let cpus: Box<[Cpu]> = (0..param::NCPU)
            .map(|_| Cpu::new(machine.new_context(None)))
            .collect();

        // Construction takes spinlocks (pool seeding, kvm build), so
        // temporarily stand in as hart 0.
        let prev = hart_id();
        set_hart_id(0);
        bind_cpus(&cpus);

        let pmem = Pmem::new(machine.mem(), memlayout::ALLOC_BEGIN);
        let kpgtbl = vm::kvm_make(machine.mem(), &pmem);
        let bcache = BufCache::new(machine.mem(), &pmem);

        let kernel = Arc::new(Kernel {
            machine,
            pmem,
            kpgtbl,
            mmap_pool: MmapPool::new(),
            cpus,
            procs: (0..param::NPROC).map(|_| Proc::new()).collect(),
            wait_lock: RawSpinLock::new("wait"),
            next_pid: SpinLock::new("nextpid", 1),
            ticks: SpinLock::new("time", 0),
            boot_instant: Instant::now(),
            vdisk: VirtioDisk::new(),
            bcache,
            log: Wal::new(),
            itable: InodeTable::new(),
            ftable: FileTable::new(),
            sb: OnceLock::new(),
            started: AtomicBool::new(false),
            fs_once: Once::new(),
            init_slot: AtomicUsize::new(0),
            init_main: Mutex::new(None),
        });

        set_hart_id(prev);
        kernel
    }

    /// Guest DRAM shortcut.
    pub fn mem(&self) -> &PhysMemory {
        self.machine.mem()
    }

    /// Start the machine: one scheduler thread per hart, with `init` as
    /// the first process's user program. Init returning `r` powers the
    /// machine off with code `r`.
    pub fn boot(self: &Arc<Self>, init: UserMain) -> BootHandle {
        *self.init_main.lock().unwrap() = Some(init);
        let mut harts = Vec::with_capacity(param::NCPU);
        for hart in 0..param::NCPU {
            let kern = self.clone();
            harts.push(
                std::thread::Builder::new()
                    .name(format!("hart{}", hart))
                    .spawn(move || {
                        set_hart_id(hart);
                        bind_cpus(&kern.cpus);
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            kern.kmain(hart)
                        }));
                        if let Err(payload) = result {
                            if !payload.is::<HaltUnwind>() {
                                log::error!("hart {}: kernel panic, halting machine", hart);
                                kern.machine.power_off();
                            }
                        }
                    })
                    .expect("failed to spawn hart"),
            );
        }
        BootHandle {
            kernel: self.clone(),
            harts,
        }
    }

    fn kmain(self: &Arc<Self>, hart: usize) {
        if hart == 0 {
            log::info!("hematite kernel booting");
            self.virtio_disk_init();
            let init = self
                .init_main
                .lock()
                .unwrap()
                .take()
                .expect("boot: no init program");
            self.proc_make_first(init);
            fence(Ordering::SeqCst);
            self.started.store(true, Ordering::SeqCst);
            log::info!("hart 0 is booting");
        } else {
            while !self.started.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            fence(Ordering::SeqCst);
            log::info!("hart {} is booting", hart);
        }
        self.scheduler(hart);
    }
}

/// Handle on a booted kernel; joining it waits for power-off.
pub struct BootHandle {
    kernel: Arc<Kernel>,
    harts: Vec<std::thread::JoinHandle<()>>,
}

impl BootHandle {
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.kernel.machine
    }

    /// Wait for the machine to power off; returns the captured console
    /// and the exit code init handed to the finisher.
    pub fn wait(self) -> RunResult {
        for h in self.harts {
            let _ = h.join();
        }
        RunResult {
            console: self.kernel.machine.console(),
            code: self.kernel.machine.finisher_code(),
            clean: self.kernel.machine.finisher_requested(),
        }
    }
}

pub struct RunResult {
    pub console: String,
    pub code: u32,
    /// True when init powered the machine off itself; false when a
    /// kernel panic halted it.
    pub clean: bool,
}

/// Support for exercising subsystems directly in tests.
pub mod testing {
    use super::*;
    use hematite_machine::MachineConfig;

    /// A machine plus seeded frame pools, with the calling thread bound
    /// as hart 0 so lock discipline works outside a booted kernel.
    pub struct TestBench {
        pub machine: Arc<Machine>,
        pub pmem: Pmem,
        _cpus: Box<[Cpu]>,
    }

    impl TestBench {
        pub fn new() -> TestBench {
            let machine = Machine::new(MachineConfig {
                dram_bytes: 16 * 1024 * 1024,
                disk: vec![0; 64 * 512],
            })
            .expect("test machine");
            let cpus: Box<[Cpu]> = (0..1).map(|_| Cpu::new(machine.new_context(None))).collect();
            set_hart_id(0);
            bind_cpus(&cpus);
            let pmem = Pmem::new(machine.mem(), memlayout::ALLOC_BEGIN);
            TestBench {
                machine,
                pmem,
                _cpus: cpus,
            }
        }

        pub fn mem(&self) -> &PhysMemory {
            self.machine.mem()
        }
    }

    impl Default for TestBench {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Boot a fresh kernel on `disk`, run `main` as the init program,
    /// and hand back the run result plus the machine for inspection.
    pub fn boot_with_disk(
        disk: Vec<u8>,
        main: impl FnOnce(&mut UserEnv) -> i32 + Send + 'static,
    ) -> (RunResult, Arc<Machine>) {
        let machine = Machine::new(MachineConfig {
            dram_bytes: 32 * 1024 * 1024,
            disk,
        })
        .expect("boot machine");
        let kernel = Kernel::new(machine.clone());
        let result = kernel.boot(Box::new(main)).wait();
        (result, machine)
    }

    /// Boot on an unformatted disk (the kernel formats it).
    pub fn boot_fresh(
        main: impl FnOnce(&mut UserEnv) -> i32 + Send + 'static,
    ) -> (RunResult, Arc<Machine>) {
        boot_with_disk(vec![0; hematite_machine::DEFAULT_DISK_BYTES], main)
    }
}
