//! The user-runtime contract: the hosted stand-in for the user-space
//! side of the trap boundary.
//!
//! A user program is a host closure driving [`UserEnv`]. Every call
//! stages its arguments in real user memory (strings and buffers are
//! pushed through `copyout` onto the user stack or a heap scratch area
//! grown with `brk`), places the call number and arguments in the
//! trapframe registers, and enters the kernel dispatcher. That is the
//! syscall ABI minus the instruction stream. Loads and stores
//! (`peek`/`poke`) go through the process page table with the same
//! permission checks the MMU would apply.

use crate::file::OpenFlags;
use crate::riscv::PteFlags;
use crate::syscall::*;
use crate::vm::uvm;
use crate::Kernel;
use hematite_fs::Stat;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Saved user registers, stored in the per-process trapframe page. Only
/// the fields the syscall convention touches are modeled.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct Trapframe {
    /// User program counter (the continuation, in this hosted model).
    pub epc: u64,
    /// User stack pointer.
    pub sp: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
}

pub struct UserEnv {
    kern: Arc<Kernel>,
    scratch_va: u64,
    scratch_len: usize,
}

impl UserEnv {
    pub(crate) fn new(kern: Arc<Kernel>) -> Self {
        UserEnv {
            kern,
            scratch_va: 0,
            scratch_len: 0,
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kern
    }

    fn tf_pa(&self) -> u64 {
        unsafe { self.kern.cur_data() }.tf_pa
    }

    fn read_tf(&self) -> Trapframe {
        self.kern.read_trapframe(self.tf_pa())
    }

    fn write_tf(&self, tf: &Trapframe) {
        self.kern.mem().write_bytes(self.tf_pa(), tf.as_bytes());
    }

    fn pgtbl(&self) -> u64 {
        unsafe { self.kern.cur_data() }.pgtbl
    }

    /// Issue a raw system call: number in `a7`, arguments in `a0..a5`,
    /// result read back from `a0`. A process found killed at the trap
    /// boundary exits here instead of returning.
    pub fn syscall(&mut self, num: u64, args: &[u64]) -> i64 {
        assert!(args.len() <= 6, "syscall takes at most six arguments");
        let mut tf = self.read_tf();
        tf.a7 = num;
        let mut regs = [0u64; 6];
        regs[..args.len()].copy_from_slice(args);
        tf.a0 = regs[0];
        tf.a1 = regs[1];
        tf.a2 = regs[2];
        tf.a3 = regs[3];
        tf.a4 = regs[4];
        tf.a5 = regs[5];
        self.write_tf(&tf);

        self.kern.syscall();

        let ret = self.read_tf().a0 as i64;
        if num != SYS_EXIT && self.kern.current_killed() {
            self.kern.proc_exit(-1);
        }
        ret
    }

    // --- user-memory staging --------------------------------------

    fn sp(&self) -> u64 {
        self.read_tf().sp
    }

    fn set_sp(&self, sp: u64) {
        let mut tf = self.read_tf();
        tf.sp = sp;
        self.write_tf(&tf);
    }

    // Push bytes onto the user stack; caller restores sp afterwards.
    fn push_bytes(&mut self, data: &[u8]) -> u64 {
        let mut sp = self.sp();
        sp -= data.len() as u64;
        sp &= !7;
        uvm::copyout(self.kern.mem(), &self.kern.pmem, self.pgtbl(), sp, data)
            .expect("user stack overflow");
        self.set_sp(sp);
        sp
    }

    fn push_str(&mut self, s: &str) -> u64 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.push_bytes(&bytes)
    }

    /// Copy out of user memory (no permission override: the page must
    /// be user-accessible).
    pub fn read_user(&self, va: u64, buf: &mut [u8]) -> bool {
        uvm::copyin(self.kern.mem(), &self.kern.pmem, self.pgtbl(), buf, va).is_ok()
    }

    pub fn write_user(&mut self, va: u64, data: &[u8]) -> bool {
        uvm::copyout(self.kern.mem(), &self.kern.pmem, self.pgtbl(), va, data).is_ok()
    }

    /// Load one byte through the page table, demanding `V|U|R` like the
    /// hardware would; `None` is a fault.
    pub fn peek(&self, va: u64) -> Option<u8> {
        let pa = uvm::translate_user(
            self.kern.mem(),
            &self.kern.pmem,
            self.pgtbl(),
            va,
            PteFlags::R,
        )?;
        Some(self.kern.mem().read_u8(pa))
    }

    /// Store one byte through the page table, demanding `V|U|W`.
    pub fn poke(&mut self, va: u64, val: u8) -> bool {
        match uvm::translate_user(
            self.kern.mem(),
            &self.kern.pmem,
            self.pgtbl(),
            va,
            PteFlags::W,
        ) {
            Some(pa) => {
                self.kern.mem().write_u8(pa, val);
                true
            }
            None => false,
        }
    }

    // Heap scratch area for staging file-I/O buffers, grown with brk.
    fn ensure_scratch(&mut self, len: usize) -> u64 {
        if self.scratch_len >= len && self.scratch_va != 0 {
            return self.scratch_va;
        }
        let want = (len.max(1) + (4096 - 1)) & !(4096 - 1);
        let cur = self.syscall(SYS_BRK, &[0]) as u64;
        let new = self.syscall(SYS_BRK, &[cur + want as u64]);
        assert!(new as u64 == cur + want as u64, "brk for scratch failed");
        self.scratch_va = cur;
        self.scratch_len = want;
        cur
    }

    // --- system-call wrappers -------------------------------------

    pub fn print(&mut self, s: &str) -> i64 {
        let saved = self.sp();
        let va = self.push_str(s);
        let r = self.syscall(SYS_PRINT, &[va]);
        self.set_sp(saved);
        r
    }

    pub fn brk(&mut self, new_top: u64) -> i64 {
        self.syscall(SYS_BRK, &[new_top])
    }

    pub fn mmap(&mut self, start: u64, len: u64) -> i64 {
        self.syscall(SYS_MMAP, &[start, len])
    }

    pub fn munmap(&mut self, start: u64, len: u64) -> i64 {
        self.syscall(SYS_MUNMAP, &[start, len])
    }

    /// Fork. The closure is the child's continuation, standing in for
    /// its saved user program counter; the kernel side
    /// duplicates the address space and returns 0 to the child through
    /// its trapframe.
    pub fn fork(&mut self, child: impl FnOnce(&mut UserEnv) -> i32 + Send + 'static) -> i64 {
        unsafe { self.kern.cur_data() }.pending_child = Some(Box::new(child));
        self.syscall(SYS_FORK, &[])
    }

    /// Wait for any child; returns `(pid, exit_status)`. `pid` is -1 if
    /// the caller has no children.
    pub fn wait(&mut self) -> (i64, i32) {
        let saved = self.sp();
        let va = self.push_bytes(&[0u8; 8]);
        let pid = self.syscall(SYS_WAIT, &[va]);
        let mut raw = [0u8; 4];
        let ok = self.read_user(va, &mut raw);
        self.set_sp(saved);
        let status = if pid >= 0 && ok {
            i32::from_le_bytes(raw)
        } else {
            0
        };
        (pid, status)
    }

    pub fn exit(&mut self, code: i32) -> ! {
        self.syscall(SYS_EXIT, &[code as u32 as u64]);
        unreachable!("exit returned");
    }

    pub fn sleep(&mut self, ticks: u64) -> i64 {
        self.syscall(SYS_SLEEP, &[ticks])
    }

    pub fn kill(&mut self, pid: i64) -> i64 {
        self.syscall(SYS_KILL, &[pid as u64])
    }

    pub fn getpid(&mut self) -> i64 {
        self.syscall(SYS_GETPID, &[])
    }

    pub fn yield_now(&mut self) -> i64 {
        self.syscall(SYS_YIELD, &[])
    }

    pub fn getticks(&mut self) -> i64 {
        self.syscall(SYS_GETTICKS, &[])
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> i64 {
        let saved = self.sp();
        let va = self.push_str(path);
        let r = self.syscall(SYS_OPEN, &[va, flags.bits() as u64]);
        self.set_sp(saved);
        r
    }

    pub fn close(&mut self, fd: i64) -> i64 {
        self.syscall(SYS_CLOSE, &[fd as u64])
    }

    pub fn read(&mut self, fd: i64, buf: &mut [u8]) -> i64 {
        if buf.is_empty() {
            return self.syscall(SYS_READ, &[fd as u64, 0, 0]);
        }
        let va = self.ensure_scratch(buf.len());
        let r = self.syscall(SYS_READ, &[fd as u64, va, buf.len() as u64]);
        if r > 0 {
            let n = r as usize;
            assert!(self.read_user(va, &mut buf[..n]), "read-back failed");
        }
        r
    }

    pub fn write(&mut self, fd: i64, data: &[u8]) -> i64 {
        if data.is_empty() {
            return self.syscall(SYS_WRITE, &[fd as u64, 0, 0]);
        }
        let va = self.ensure_scratch(data.len());
        assert!(self.write_user(va, data), "write staging failed");
        self.syscall(SYS_WRITE, &[fd as u64, va, data.len() as u64])
    }

    pub fn mkdir(&mut self, path: &str) -> i64 {
        let saved = self.sp();
        let va = self.push_str(path);
        let r = self.syscall(SYS_MKDIR, &[va]);
        self.set_sp(saved);
        r
    }

    pub fn link(&mut self, old: &str, new: &str) -> i64 {
        let saved = self.sp();
        let old_va = self.push_str(old);
        let new_va = self.push_str(new);
        let r = self.syscall(SYS_LINK, &[old_va, new_va]);
        self.set_sp(saved);
        r
    }

    pub fn unlink(&mut self, path: &str) -> i64 {
        let saved = self.sp();
        let va = self.push_str(path);
        let r = self.syscall(SYS_UNLINK, &[va]);
        self.set_sp(saved);
        r
    }

    pub fn dup(&mut self, fd: i64) -> i64 {
        self.syscall(SYS_DUP, &[fd as u64])
    }

    pub fn fstat(&mut self, fd: i64) -> Option<Stat> {
        let saved = self.sp();
        let va = self.push_bytes(&[0u8; core::mem::size_of::<Stat>()]);
        let r = self.syscall(SYS_FSTAT, &[fd as u64, va]);
        let mut raw = [0u8; core::mem::size_of::<Stat>()];
        let ok = self.read_user(va, &mut raw);
        self.set_sp(saved);
        if r == 0 && ok {
            Stat::read_from(&raw[..])
        } else {
            None
        }
    }
}
