//! Write-ahead log giving multi-block filesystem updates all-or-nothing
//! semantics.
//!
//! The log occupies `nlog` blocks starting at `logstart`: a header
//! block followed by shadow copies of the blocks a transaction dirtied.
//! Commit is the four-step sequence: copy cached blocks to their shadow
//! slots, write the header with a nonzero count (the commit point),
//! install the shadows at their destinations, clear the header. Boot
//! recovery re-runs the install step when it finds a committed header.
//!
//! `begin_op`/`end_op` frame transactions; callers block (sleeping on
//! the log) while a commit runs or while the log is too full for one
//! more worst-case operation. The last `end_op` commits.

use crate::param::MAXOPBLOCKS;
use crate::sync::SpinLock;
use crate::Kernel;
use hematite_fs::{Superblock, BSIZE, LOGSIZE};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Shadow slots available after the header block.
const LOG_SLOTS: usize = (LOGSIZE - 1) as usize;

/// On-disk log header: a count and the destination block numbers of the
/// shadow blocks.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct LogHeader {
    pub n: u32,
    pub block: [u32; LOG_SLOTS],
}

pub(crate) struct WalInner {
    start: u32,
    size: u32,
    dev: u32,
    /// Operations inside `begin_op`/`end_op`.
    outstanding: u32,
    committing: bool,
    head: LogHeader,
}

pub struct Wal {
    pub(crate) inner: SpinLock<WalInner>,
}

impl Wal {
    pub(crate) fn new() -> Self {
        Wal {
            inner: SpinLock::new("log", WalInner {
                start: 0,
                size: 0,
                dev: 0,
                outstanding: 0,
                committing: false,
                head: LogHeader::new_zeroed(),
            }),
        }
    }

    fn chan(&self) -> usize {
        &self.inner as *const _ as usize
    }
}

impl Kernel {
    /// Wire the log to its on-disk area and run crash recovery. Called
    /// once during filesystem initialization, in process context.
    pub(crate) fn log_init(&self, dev: u32, sb: &Superblock) {
        assert!(
            core::mem::size_of::<LogHeader>() < BSIZE,
            "log_init: header too big"
        );
        {
            let mut log = self.log.inner.lock();
            log.start = sb.logstart;
            log.size = sb.nlog;
            log.dev = dev;
        }
        self.log_recover();
    }

    // Read the header block into memory.
    fn log_read_head(&self) -> LogHeader {
        let (dev, start) = {
            let log = self.log.inner.lock();
            (log.dev, log.start)
        };
        let buf = self.bread(dev, start);
        buf.read_obj::<LogHeader>(0)
    }

    // Write the in-memory header to disk; with a nonzero count this is
    // the commit point.
    fn log_write_head(&self, head: &LogHeader) {
        let (dev, start) = {
            let log = self.log.inner.lock();
            (log.dev, log.start)
        };
        let mut buf = self.bread(dev, start);
        buf.write_obj(0, head);
        self.bwrite(&buf);
    }

    // Copy committed shadow blocks to their destinations. During normal
    // commit the cached destination was pinned by log_write; recovery
    // has nothing pinned.
    fn log_install(&self, head: &LogHeader, recovering: bool) {
        let (dev, start) = {
            let log = self.log.inner.lock();
            (log.dev, log.start)
        };
        for i in 0..head.n as usize {
            let shadow = self.bread(dev, start + 1 + i as u32);
            let dst = self.bread(dev, head.block[i]);
            self.mem()
                .copy_within(dst.data_pa(), shadow.data_pa(), BSIZE);
            self.bwrite(&dst);
            if !recovering {
                self.bunpin(dst.idx());
            }
        }
    }

    fn log_recover(&self) {
        let mut head = self.log_read_head();
        if head.n > 0 {
            log::info!("log: recovering {} blocks", head.n);
            self.log_install(&head, true);
        }
        head = LogHeader::new_zeroed();
        self.log_write_head(&head);
    }

    /// Open a filesystem transaction, waiting until the log can absorb
    /// one more worst-case operation and no commit is in progress.
    pub fn begin_op(&self) {
        let mut log = self.log.inner.lock();
        loop {
            if log.committing {
                log = self.sleep_guard(self.log.chan(), log);
            } else if log.head.n as usize + (log.outstanding as usize + 1) * MAXOPBLOCKS
                > LOG_SLOTS
            {
                log = self.sleep_guard(self.log.chan(), log);
            } else {
                log.outstanding += 1;
                return;
            }
        }
    }

    /// Close a transaction; the last one out commits.
    pub fn end_op(&self) {
        let mut do_commit = false;
        {
            let mut log = self.log.inner.lock();
            assert!(log.outstanding >= 1, "end_op: not in a transaction");
            log.outstanding -= 1;
            assert!(!log.committing, "end_op: commit already running");
            if log.outstanding == 0 {
                do_commit = true;
                log.committing = true;
            } else {
                // Freed log headroom may unblock a begin_op.
                self.wakeup(self.log.chan());
            }
        }

        if do_commit {
            self.log_commit();
            let mut log = self.log.inner.lock();
            log.committing = false;
            self.wakeup(self.log.chan());
        }
    }

    fn log_commit(&self) {
        let head = {
            let log = self.log.inner.lock();
            log.head
        };
        if head.n == 0 {
            return;
        }
        // 1: cache -> shadow blocks on disk.
        let (dev, start) = {
            let log = self.log.inner.lock();
            (log.dev, log.start)
        };
        for i in 0..head.n as usize {
            let shadow = self.bread(dev, start + 1 + i as u32);
            let src = self.bread(dev, head.block[i]);
            self.mem()
                .copy_within(shadow.data_pa(), src.data_pa(), BSIZE);
            self.bwrite(&shadow);
        }
        // 2: commit point.
        self.log_write_head(&head);
        // 3: shadows -> destinations, unpinning the cached copies.
        self.log_install(&head, false);
        // 4: clear the header.
        let zero = LogHeader::new_zeroed();
        {
            let mut log = self.log.inner.lock();
            log.head = zero;
        }
        self.log_write_head(&zero);
    }

    /// Blocks queued in the current transaction (diagnostic).
    pub fn log_pending(&self) -> u32 {
        self.log.inner.lock().head.n
    }

    /// Record a dirtied buffer in the current transaction. The first
    /// mention pins the buffer and claims a log slot; re-logging the
    /// same block is absorbed. Overflowing a transaction is fatal.
    pub fn log_write(&self, buf: &crate::bio::BufGuard<'_>) {
        let mut log = self.log.inner.lock();
        assert!(
            (log.head.n as usize) < LOG_SLOTS && log.head.n < log.size - 1,
            "log_write: transaction too big"
        );
        assert!(log.outstanding >= 1, "log_write: outside of a transaction");

        let n = log.head.n as usize;
        let mut i = 0;
        while i < n {
            if log.head.block[i] == buf.blockno() {
                break; // absorption
            }
            i += 1;
        }
        log.head.block[i] = buf.blockno();
        if i == n {
            self.bpin(buf.idx());
            log.head.n += 1;
        }
    }
}
