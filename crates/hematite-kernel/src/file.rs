//! Open-file layer: the system-wide file table and the operations
//! behind read/write/dup/close/fstat.
//!
//! A file table entry carries its own spinlock for the reference count
//! and offset; content I/O happens with the inode sleeplock held and
//! the slot lock released. Writes are split into sub-transactions small
//! enough that each one fits the log, so every chunk commits
//! atomically.

use crate::error::{KernelError, Result};
use crate::fs::{IoDst, IoSrc, Iref};
use crate::param::{MAXOPBLOCKS, NFILE};
use crate::sync::SpinLock;
use crate::vm::uvm;
use crate::Kernel;
use bitflags::bitflags;
use hematite_fs::BSIZE;
use zerocopy::AsBytes;

bitflags! {
    /// Flags accepted by `open`. Read-only is the absence of the write
    /// bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR   = 0x002;
        const CREATE = 0x200;
        const TRUNC  = 0x400;
        const APPEND = 0x800;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    None,
    Inode,
}

pub(crate) struct FileInner {
    refcnt: u32,
    kind: FileKind,
    readable: bool,
    writable: bool,
    append: bool,
    ip: Option<Iref>,
    off: u32,
}

pub struct FileTable {
    slots: Vec<SpinLock<FileInner>>,
}

impl FileTable {
    pub(crate) fn new() -> Self {
        FileTable {
            slots: (0..NFILE)
                .map(|_| {
                    SpinLock::new("file", FileInner {
                        refcnt: 0,
                        kind: FileKind::None,
                        readable: false,
                        writable: false,
                        append: false,
                        ip: None,
                        off: 0,
                    })
                })
                .collect(),
        }
    }
}

impl Kernel {
    /// Claim a free file-table entry for an inode-backed file.
    pub fn file_alloc(
        &self,
        ip: Iref,
        readable: bool,
        writable: bool,
        append: bool,
    ) -> Option<usize> {
        for (i, slot) in self.ftable.slots.iter().enumerate() {
            let mut f = slot.lock();
            if f.refcnt == 0 {
                *f = FileInner {
                    refcnt: 1,
                    kind: FileKind::Inode,
                    readable,
                    writable,
                    append,
                    ip: Some(ip),
                    off: 0,
                };
                return Some(i);
            }
        }
        // Table full; give the inode reference back.
        self.iput_in_op(ip);
        None
    }

    // iput must run inside a transaction.
    fn iput_in_op(&self, ip: Iref) {
        self.begin_op();
        self.iput(ip);
        self.end_op();
    }

    pub fn file_dup(&self, idx: usize) {
        let mut f = self.ftable.slots[idx].lock();
        assert!(f.refcnt >= 1, "file_dup: closed file");
        f.refcnt += 1;
    }

    /// Drop one reference; the last one releases the inode.
    pub fn file_close(&self, idx: usize) {
        let ip = {
            let mut f = self.ftable.slots[idx].lock();
            assert!(f.refcnt >= 1, "file_close: closed file");
            f.refcnt -= 1;
            if f.refcnt > 0 {
                return;
            }
            f.kind = FileKind::None;
            f.readable = false;
            f.writable = false;
            f.append = false;
            f.off = 0;
            f.ip.take()
        };
        if let Some(ip) = ip {
            self.iput_in_op(ip);
        }
    }

    /// Copy the file's metadata out to `addr` in the caller's address
    /// space.
    pub fn file_stat(&self, idx: usize, addr: u64) -> Result<()> {
        let ip = {
            let f = self.ftable.slots[idx].lock();
            match &f.ip {
                Some(ip) => ip.alias(),
                None => return Err(KernelError::BadFd),
            }
        };
        let g = self.ilock(&ip);
        let st = self.stati(&g);
        drop(g);
        let pgtbl = unsafe { self.cur_data() }.pgtbl;
        uvm::copyout(self.mem(), &self.pmem, pgtbl, addr, st.as_bytes())
            .map_err(|_| KernelError::BadAddress)
    }

    /// Read from the file into user memory at `addr`, advancing the
    /// offset.
    pub fn file_read(&self, idx: usize, addr: u64, n: usize) -> Result<usize> {
        let (ip, off) = {
            let f = self.ftable.slots[idx].lock();
            if !f.readable || f.kind != FileKind::Inode {
                return Err(KernelError::BadFd);
            }
            (f.ip.as_ref().unwrap().alias(), f.off)
        };

        let mut g = self.ilock(&ip);
        let r = self.readi(&mut g, IoDst::User(addr, n), off)?;
        if r > 0 {
            // Offset update stays under the inode lock so concurrent
            // readers advance consistently.
            let mut f = self.ftable.slots[idx].lock();
            f.off += r as u32;
        }
        drop(g);
        Ok(r)
    }

    /// Write user memory at `addr` to the file. Large writes are broken
    /// into chunks that each fit one log transaction; every chunk is
    /// atomic on disk.
    pub fn file_write(&self, idx: usize, addr: u64, n: usize) -> Result<usize> {
        {
            let f = self.ftable.slots[idx].lock();
            if !f.writable || f.kind != FileKind::Inode {
                return Err(KernelError::BadFd);
            }
        }

        // Room for data blocks once the inode, indirect block and a
        // bitmap block are accounted for.
        let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
        let mut written = 0usize;
        while written < n {
            let chunk = (n - written).min(max);

            self.begin_op();
            let (ip, append) = {
                let f = self.ftable.slots[idx].lock();
                (f.ip.as_ref().unwrap().alias(), f.append)
            };
            let mut g = self.ilock(&ip);
            let off = {
                let mut f = self.ftable.slots[idx].lock();
                if append {
                    f.off = g.size;
                }
                f.off
            };
            let r = self.writei(&mut g, IoSrc::User(addr + written as u64, chunk), off);
            if let Ok(r) = r {
                let mut f = self.ftable.slots[idx].lock();
                f.off += r as u32;
            }
            drop(g);
            self.end_op();

            match r {
                Ok(r) if r == chunk => written += r,
                Ok(r) => {
                    written += r;
                    break;
                }
                Err(e) => {
                    if written == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        if written == n {
            Ok(n)
        } else {
            Err(KernelError::BadAddress)
        }
    }
}
