//! System-call dispatch.
//!
//! The call number arrives in `a7`, up to six integer arguments in
//! `a0..a5`, and the result goes back in `a0`, all through the
//! process's trapframe. Pointer arguments are fetched with the copy
//! primitives; bad pointers and other user mistakes come back as -1
//! with kernel state untouched.

use crate::error::{KernelError, Result};
use crate::file::OpenFlags;
use crate::fs::{IoSrc, Iref};
use crate::memlayout::{TRAPFRAME, UART0};
use crate::param::{MAXPATH, MAXPRINT, NOFILE};
use crate::riscv::{pg_round_up, PteFlags, PGSIZE};
use crate::uland::Trapframe;
use crate::vm::{mmap, uvm};
use crate::Kernel;
use hematite_fs::{Dirent, T_DIR, T_FILE};
use std::sync::Arc;
use zerocopy::{AsBytes, FromZeroes};

pub const SYS_PRINT: u64 = 1;
pub const SYS_BRK: u64 = 2;
pub const SYS_MMAP: u64 = 3;
pub const SYS_MUNMAP: u64 = 4;
pub const SYS_FORK: u64 = 5;
pub const SYS_WAIT: u64 = 6;
pub const SYS_EXIT: u64 = 7;
pub const SYS_SLEEP: u64 = 8;
pub const SYS_KILL: u64 = 9;
pub const SYS_GETPID: u64 = 10;
pub const SYS_YIELD: u64 = 11;
pub const SYS_OPEN: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_READ: u64 = 14;
pub const SYS_WRITE: u64 = 15;
pub const SYS_MKDIR: u64 = 16;
pub const SYS_LINK: u64 = 17;
pub const SYS_UNLINK: u64 = 18;
pub const SYS_FSTAT: u64 = 19;
pub const SYS_DUP: u64 = 20;
pub const SYS_GETTICKS: u64 = 21;

const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

impl Kernel {
    /// Dispatch the system call described by the current trapframe and
    /// store the result in `a0`.
    pub fn syscall(self: &Arc<Self>) {
        let tf_pa = unsafe { self.cur_data() }.tf_pa;
        let tf = self.read_trapframe(tf_pa);
        let num = tf.a7;

        let ret: i64 = match num {
            SYS_PRINT => self.sys_print(&tf),
            SYS_BRK => self.sys_brk(&tf),
            SYS_MMAP => self.sys_mmap(&tf),
            SYS_MUNMAP => self.sys_munmap(&tf),
            SYS_FORK => self.fork(),
            SYS_WAIT => self.wait(tf.a0),
            SYS_EXIT => self.proc_exit(tf.a0 as i32),
            SYS_SLEEP => self.sleep_ticks(tf.a0),
            SYS_KILL => self.kill(tf.a0 as i32),
            SYS_GETPID => self.current_pid() as i64,
            SYS_YIELD => {
                self.proc_yield();
                0
            }
            SYS_OPEN => self.sys_open(&tf),
            SYS_CLOSE => self.sys_close(&tf),
            SYS_READ => self.sys_read(&tf),
            SYS_WRITE => self.sys_write(&tf),
            SYS_MKDIR => self.sys_mkdir(&tf),
            SYS_LINK => self.sys_link(&tf),
            SYS_UNLINK => self.sys_unlink(&tf),
            SYS_FSTAT => self.sys_fstat(&tf),
            SYS_DUP => self.sys_dup(&tf),
            SYS_GETTICKS => self.getticks() as i64,
            _ => {
                log::warn!(
                    "syscall: unknown number {} from pid {}",
                    num,
                    self.current_pid()
                );
                -1
            }
        };

        let mut tf = self.read_trapframe(tf_pa);
        tf.a0 = ret as u64;
        self.mem().write_bytes(tf_pa, tf.as_bytes());
    }

    fn cur_pgtbl(&self) -> u64 {
        unsafe { self.cur_data() }.pgtbl
    }

    // Fetch a NUL-terminated string argument from user space.
    fn arg_str(&self, addr: u64, max: usize) -> Result<Vec<u8>> {
        uvm::copyin_str(self.mem(), &self.pmem, self.cur_pgtbl(), addr, max)
    }

    pub(crate) fn console_write(&self, bytes: &[u8]) {
        for &b in bytes {
            self.machine.mmio_write_u8(UART0, b);
        }
    }

    fn sys_print(&self, tf: &Trapframe) -> i64 {
        match self.arg_str(tf.a0, MAXPRINT) {
            Ok(bytes) => {
                self.console_write(&bytes);
                0
            }
            Err(_) => -1,
        }
    }

    fn sys_brk(&self, tf: &Trapframe) -> i64 {
        let new_top = tf.a0;
        let data = unsafe { self.cur_data() };
        let old = data.heap_top;
        if new_top == 0 {
            return old as i64;
        }
        if new_top >= crate::riscv::VA_MAX {
            return -1;
        }
        if new_top > old {
            match uvm::heap_grow(self.mem(), &self.pmem, data.pgtbl, old, new_top - old) {
                Ok(top) => {
                    data.heap_top = top;
                    top as i64
                }
                Err(_) => -1,
            }
        } else {
            let top = uvm::heap_ungrow(self.mem(), &self.pmem, data.pgtbl, old, old - new_top);
            data.heap_top = top;
            top as i64
        }
    }

    fn sys_mmap(&self, tf: &Trapframe) -> i64 {
        let (start, len) = (tf.a0, tf.a1);
        if len == 0 || len % PGSIZE != 0 {
            return -1;
        }
        let npages = (len / PGSIZE) as u32;
        let data = unsafe { self.cur_data() };
        let lo = pg_round_up(data.heap_top) + PGSIZE;
        let hi = TRAPFRAME - data.ustack_pages as u64 * PGSIZE - PGSIZE;

        let begin = if start == 0 {
            match mmap::find_gap(&self.mmap_pool, data.mmap_head, lo, hi, npages) {
                Some(b) => b,
                None => return -1,
            }
        } else {
            if start % PGSIZE != 0 || start < lo || start.saturating_add(len) > hi {
                return -1;
            }
            if mmap::overlaps(&self.mmap_pool, data.mmap_head, start, start + len) {
                return -1;
            }
            start
        };

        self.uvm_mmap(begin, npages, PteFlags::R | PteFlags::W | PteFlags::U);
        begin as i64
    }

    fn sys_munmap(&self, tf: &Trapframe) -> i64 {
        let (start, len) = (tf.a0, tf.a1);
        if len == 0 || len % PGSIZE != 0 || start % PGSIZE != 0 {
            return -1;
        }
        self.uvm_munmap(start, (len / PGSIZE) as u32);
        0
    }

    // Descriptor-table helpers.

    fn arg_fd(&self, raw: u64) -> Result<(usize, usize)> {
        let fd = raw as usize;
        let data = unsafe { self.cur_data() };
        if fd >= NOFILE {
            return Err(KernelError::BadFd);
        }
        match data.ofile[fd] {
            Some(fi) => Ok((fd, fi)),
            None => Err(KernelError::BadFd),
        }
    }

    fn fd_alloc(&self, fi: usize) -> Result<usize> {
        let data = unsafe { self.cur_data() };
        for (fd, slot) in data.ofile.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(fi);
                return Ok(fd);
            }
        }
        Err(KernelError::NoFile)
    }

    // Create a filesystem object at `path`. Must run inside a
    // transaction. Opening an existing regular file with CREATE is
    // allowed; any other collision fails.
    fn create(&self, path: &[u8], typ: i16, major: i16, minor: i16) -> Option<Iref> {
        let (dp, name) = self.nameiparent(path)?;
        let mut dg = self.ilock(&dp);

        if let Some((ip, _)) = self.dirlookup(&mut dg, &name) {
            drop(dg);
            self.iput(dp);
            let g = self.ilock(&ip);
            if typ == T_FILE && g.typ == T_FILE {
                drop(g);
                return Some(ip);
            }
            drop(g);
            self.iput(ip);
            return None;
        }

        let ip = self.ialloc(dp.dev, typ);
        let mut g = self.ilock(&ip);
        g.major = major;
        g.minor = minor;
        g.nlink = 1;
        self.iupdate(&g);

        if typ == T_DIR {
            // A fresh directory cannot collide on these.
            self.dirlink(&mut g, b".", ip.inum).expect("create: '.'");
            self.dirlink(&mut g, b"..", dp.inum).expect("create: '..'");
        }
        self.dirlink(&mut dg, &name, ip.inum).expect("create: dirlink");
        if typ == T_DIR {
            dg.nlink += 1; // the new child's ".."
            self.iupdate(&dg);
        }

        drop(dg);
        self.iput(dp);
        drop(g);
        Some(ip)
    }

    fn sys_open(&self, tf: &Trapframe) -> i64 {
        let Ok(path) = self.arg_str(tf.a0, MAXPATH) else {
            return -1;
        };
        let flags = OpenFlags::from_bits_truncate(tf.a1 as u32);
        let readable = !flags.contains(OpenFlags::WRONLY);
        let writable = flags.contains(OpenFlags::WRONLY) || flags.contains(OpenFlags::RDWR);

        self.begin_op();
        let ip = if flags.contains(OpenFlags::CREATE) {
            self.create(&path, T_FILE, 0, 0)
        } else {
            self.namei(&path)
        };
        let Some(ip) = ip else {
            self.end_op();
            return -1;
        };

        {
            let mut g = self.ilock(&ip);
            if g.typ == T_DIR && writable {
                drop(g);
                self.iput(ip);
                self.end_op();
                return -1;
            }
            if flags.contains(OpenFlags::TRUNC) && g.typ == T_FILE {
                self.itrunc(&mut g);
            }
        }

        let Some(fi) = self.file_alloc(ip, readable, writable, flags.contains(OpenFlags::APPEND))
        else {
            self.end_op();
            return -1;
        };
        let fd = match self.fd_alloc(fi) {
            Ok(fd) => fd,
            Err(_) => {
                self.file_close(fi);
                self.end_op();
                return -1;
            }
        };
        self.end_op();
        fd as i64
    }

    fn sys_close(&self, tf: &Trapframe) -> i64 {
        let Ok((fd, fi)) = self.arg_fd(tf.a0) else {
            return -1;
        };
        unsafe { self.cur_data() }.ofile[fd] = None;
        self.file_close(fi);
        0
    }

    fn sys_read(&self, tf: &Trapframe) -> i64 {
        let Ok((_, fi)) = self.arg_fd(tf.a0) else {
            return -1;
        };
        match self.file_read(fi, tf.a1, tf.a2 as usize) {
            Ok(n) => n as i64,
            Err(_) => -1,
        }
    }

    fn sys_write(&self, tf: &Trapframe) -> i64 {
        let Ok((_, fi)) = self.arg_fd(tf.a0) else {
            return -1;
        };
        match self.file_write(fi, tf.a1, tf.a2 as usize) {
            Ok(n) => n as i64,
            Err(_) => -1,
        }
    }

    fn sys_dup(&self, tf: &Trapframe) -> i64 {
        let Ok((_, fi)) = self.arg_fd(tf.a0) else {
            return -1;
        };
        match self.fd_alloc(fi) {
            Ok(fd) => {
                self.file_dup(fi);
                fd as i64
            }
            Err(_) => -1,
        }
    }

    fn sys_fstat(&self, tf: &Trapframe) -> i64 {
        let Ok((_, fi)) = self.arg_fd(tf.a0) else {
            return -1;
        };
        match self.file_stat(fi, tf.a1) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }

    fn sys_mkdir(&self, tf: &Trapframe) -> i64 {
        let Ok(path) = self.arg_str(tf.a0, MAXPATH) else {
            return -1;
        };
        self.begin_op();
        match self.create(&path, T_DIR, 0, 0) {
            Some(ip) => {
                self.iput(ip);
                self.end_op();
                0
            }
            None => {
                self.end_op();
                -1
            }
        }
    }

    fn sys_link(&self, tf: &Trapframe) -> i64 {
        let (Ok(old), Ok(new)) = (
            self.arg_str(tf.a0, MAXPATH),
            self.arg_str(tf.a1, MAXPATH),
        ) else {
            return -1;
        };

        self.begin_op();
        let Some(ip) = self.namei(&old) else {
            self.end_op();
            return -1;
        };

        {
            let mut g = self.ilock(&ip);
            if g.typ == T_DIR {
                drop(g);
                self.iput(ip);
                self.end_op();
                return -1;
            }
            g.nlink += 1;
            self.iupdate(&g);
        }

        if let Some((dp, name)) = self.nameiparent(&new) {
            let mut dg = self.ilock(&dp);
            let same_dev = dp.dev == ip.dev;
            if same_dev && self.dirlink(&mut dg, &name, ip.inum).is_ok() {
                drop(dg);
                self.iput(dp);
                self.iput(ip);
                self.end_op();
                return 0;
            }
            drop(dg);
            self.iput(dp);
        }

        // Undo the link count on failure.
        {
            let mut g = self.ilock(&ip);
            g.nlink -= 1;
            self.iupdate(&g);
        }
        self.iput(ip);
        self.end_op();
        -1
    }

    fn sys_unlink(&self, tf: &Trapframe) -> i64 {
        let Ok(path) = self.arg_str(tf.a0, MAXPATH) else {
            return -1;
        };

        self.begin_op();
        let Some((dp, name)) = self.nameiparent(&path) else {
            self.end_op();
            return -1;
        };
        let mut dg = self.ilock(&dp);

        if name == b"." || name == b".." {
            drop(dg);
            self.iput(dp);
            self.end_op();
            return -1;
        }
        let lookup = self.dirlookup(&mut dg, &name);
        let Some((ip, off)) = lookup else {
            drop(dg);
            self.iput(dp);
            self.end_op();
            return -1;
        };

        let mut g = self.ilock(&ip);
        assert!(g.nlink >= 1, "unlink: nlink < 1");
        if g.typ == T_DIR && !self.dir_is_empty(&mut g) {
            drop(g);
            self.iput(ip);
            drop(dg);
            self.iput(dp);
            self.end_op();
            return -1;
        }

        let zero = Dirent::new_zeroed();
        let n = self
            .writei(&mut dg, IoSrc::Kernel(zero.as_bytes()), off)
            .expect("unlink: dirent write");
        assert!(n == DIRENT_SIZE, "unlink: short dirent write");
        if g.typ == T_DIR {
            dg.nlink -= 1;
            self.iupdate(&dg);
        }
        drop(dg);
        self.iput(dp);

        g.nlink -= 1;
        self.iupdate(&g);
        drop(g);
        self.iput(ip);

        self.end_op();
        0
    }
}
