//! Buffer cache: an LRU pool of block-sized buffers over the disk.
//!
//! Structural state (identity, reference counts, LRU links) sits behind
//! one spinlock; each buffer's contents are guarded by a sleeplock held
//! across disk I/O. Buffer data lives in kernel-pool frames so the
//! device can address it directly. A buffer with a nonzero reference
//! count is pinned against reuse; `valid` flips from unset to set once
//! per cache residency.

use crate::param::NBUF;
use crate::pmem::{Pmem, Pool};
use crate::riscv::PGSIZE;
use crate::sync::{SleepGuard, SleepLock, SpinLock};
use crate::Kernel;
use hematite_fs::{BSIZE, FSSIZE};
use hematite_machine::memory::PhysMemory;
use std::sync::atomic::{AtomicBool, Ordering};
use zerocopy::{AsBytes, FromBytes};

/// Sentinel index for the LRU list head.
const LRU_HEAD: usize = NBUF;

pub struct BufData {
    pub valid: bool,
    /// Frame holding this buffer's block contents.
    pub data_pa: u64,
}

pub struct BufSlot {
    lock: SleepLock<BufData>,
    /// Set while the device owns the buffer for a request.
    inflight: AtomicBool,
}

#[derive(Clone, Copy)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
}

struct CacheCtl {
    meta: [BufMeta; NBUF],
    /// Doubly-linked LRU list over slot indices, with `LRU_HEAD` as the
    /// sentinel; most-recently-released buffers sit at the front.
    next: [usize; NBUF + 1],
    prev: [usize; NBUF + 1],
}

pub struct BufCache {
    ctl: SpinLock<CacheCtl>,
    slots: Vec<BufSlot>,
}

impl BufCache {
    pub(crate) fn new(mem: &PhysMemory, pmem: &Pmem) -> Self {
        assert!(BSIZE as u64 == PGSIZE);
        let slots: Vec<BufSlot> = (0..NBUF)
            .map(|_| BufSlot {
                lock: SleepLock::new("buffer", BufData {
                    valid: false,
                    data_pa: pmem.alloc(mem, Pool::Kernel),
                }),
                inflight: AtomicBool::new(false),
            })
            .collect();

        let mut next = [0usize; NBUF + 1];
        let mut prev = [0usize; NBUF + 1];
        // Chain head -> 0 -> 1 -> ... -> head.
        next[LRU_HEAD] = 0;
        prev[LRU_HEAD] = NBUF - 1;
        for i in 0..NBUF {
            next[i] = if i + 1 < NBUF { i + 1 } else { LRU_HEAD };
            prev[i] = if i > 0 { i - 1 } else { LRU_HEAD };
        }

        BufCache {
            ctl: SpinLock::new("bcache", CacheCtl {
                meta: [BufMeta {
                    dev: 0,
                    blockno: 0,
                    refcnt: 0,
                }; NBUF],
                next,
                prev,
            }),
            slots,
        }
    }

    pub(crate) fn inflight(&self, idx: usize) -> bool {
        self.slots[idx].inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn set_inflight(&self, idx: usize, v: bool) {
        self.slots[idx].inflight.store(v, Ordering::SeqCst);
    }
}

/// A referenced, content-locked buffer. Dropping it is `brelse`: the
/// sleeplock is released and, once unreferenced, the buffer moves to
/// the most-recently-used end of the list.
pub struct BufGuard<'a> {
    kern: &'a Kernel,
    idx: usize,
    dev: u32,
    blockno: u32,
    guard: Option<SleepGuard<'a, BufData>>,
}

impl<'a> BufGuard<'a> {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn data_pa(&self) -> u64 {
        self.guard.as_ref().unwrap().data_pa
    }

    pub fn read_at(&self, off: usize, buf: &mut [u8]) {
        assert!(off + buf.len() <= BSIZE);
        self.kern.mem().read_bytes(self.data_pa() + off as u64, buf);
    }

    pub fn write_at(&mut self, off: usize, buf: &[u8]) {
        assert!(off + buf.len() <= BSIZE);
        self.kern.mem().write_bytes(self.data_pa() + off as u64, buf);
    }

    pub fn read_obj<T: FromBytes>(&self, off: usize) -> T {
        let mut raw = vec![0u8; core::mem::size_of::<T>()];
        self.read_at(off, &mut raw);
        T::read_from(&raw[..]).unwrap()
    }

    pub fn write_obj<T: AsBytes>(&mut self, off: usize, val: &T) {
        self.write_at(off, val.as_bytes());
    }

    pub fn fill(&mut self, byte: u8) {
        self.kern.mem().fill(self.data_pa(), BSIZE, byte);
    }
}

impl<'a> Drop for BufGuard<'a> {
    fn drop(&mut self) {
        // Release the content lock before touching the LRU structure.
        self.guard.take();
        let mut ctl = self.kern.bcache.ctl.lock();
        assert!(ctl.meta[self.idx].refcnt >= 1, "brelse: unreferenced");
        ctl.meta[self.idx].refcnt -= 1;
        if ctl.meta[self.idx].refcnt == 0 {
            lru_unlink(&mut ctl, self.idx);
            lru_push_front(&mut ctl, self.idx);
        }
    }
}

fn lru_unlink(ctl: &mut CacheCtl, i: usize) {
    let (p, n) = (ctl.prev[i], ctl.next[i]);
    ctl.next[p] = n;
    ctl.prev[n] = p;
}

fn lru_push_front(ctl: &mut CacheCtl, i: usize) {
    let first = ctl.next[LRU_HEAD];
    ctl.next[i] = first;
    ctl.prev[i] = LRU_HEAD;
    ctl.prev[first] = i;
    ctl.next[LRU_HEAD] = i;
}

impl Kernel {
    // Look up or claim a buffer for `(dev, blockno)`: forward scan for
    // a hit, else reverse scan for an unreferenced victim to recycle.
    // Cache exhaustion is fatal.
    fn bget(&self, dev: u32, blockno: u32) -> usize {
        assert!(blockno < FSSIZE, "bget: block {} out of range", blockno);
        let mut ctl = self.bcache.ctl.lock();

        let mut i = ctl.next[LRU_HEAD];
        while i != LRU_HEAD {
            if ctl.meta[i].dev == dev && ctl.meta[i].blockno == blockno {
                ctl.meta[i].refcnt += 1;
                return i;
            }
            i = ctl.next[i];
        }

        let mut i = ctl.prev[LRU_HEAD];
        while i != LRU_HEAD {
            if ctl.meta[i].refcnt == 0 {
                ctl.meta[i] = BufMeta {
                    dev,
                    blockno,
                    refcnt: 1,
                };
                // refcnt was zero, so nobody holds the content lock.
                unsafe {
                    self.bcache.slots[i].lock.get_mut_unchecked().valid = false;
                }
                return i;
            }
            i = ctl.prev[i];
        }
        panic!("bget: no buffers");
    }

    /// Return a locked, referenced buffer holding block `blockno`,
    /// reading it from disk if the cached copy is not valid.
    pub fn bread(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let idx = self.bget(dev, blockno);
        let mut guard = self.bcache.slots[idx].lock.lock(self);
        if !guard.valid {
            self.virtio_disk_rw(idx, blockno, guard.data_pa, false);
            guard.valid = true;
        }
        BufGuard {
            kern: self,
            idx,
            dev,
            blockno,
            guard: Some(guard),
        }
    }

    /// Write the buffer's contents to disk. The caller holds the buffer
    /// (refcnt pinned by the guard).
    pub fn bwrite(&self, buf: &BufGuard<'_>) {
        self.virtio_disk_rw(buf.idx, buf.blockno, buf.data_pa(), true);
    }

    /// Extra reference keeping a buffer resident without holding it
    /// locked (the log pins dirty blocks until commit).
    pub fn bpin(&self, idx: usize) {
        let mut ctl = self.bcache.ctl.lock();
        ctl.meta[idx].refcnt += 1;
    }

    pub fn bunpin(&self, idx: usize) {
        let mut ctl = self.bcache.ctl.lock();
        assert!(ctl.meta[idx].refcnt >= 1, "bunpin: unreferenced");
        ctl.meta[idx].refcnt -= 1;
    }
}
