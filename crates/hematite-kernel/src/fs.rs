//! Inode layer: on-disk allocation, the in-memory inode cache,
//! file-content I/O, directories and path resolution.
//!
//! Every mutation goes through the log: callers bracket filesystem
//! operations with `begin_op`/`end_op` and all block writes here use
//! `log_write`. Inode cache identity (device, inode number, reference
//! count) lives under one spinlock; each inode's cached fields sit
//! behind a sleeplock and load lazily on first lock.

use crate::error::{KernelError, Result};
use crate::sync::{SleepGuard, SleepLock, SpinLock};
use crate::vm::uvm;
use crate::Kernel;
use hematite_fs::{
    Dinode, Dirent, Stat, Superblock, BPB, BSIZE, DIRSIZ, FSMAGIC, FSSIZE, IPB, MAXFILE, NDIRECT,
    NINDIRECT, ROOTINO, T_DIR,
};
use crate::param::NINODE;
use zerocopy::{AsBytes, FromZeroes};

const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

/// Cached copy of an on-disk inode, guarded by the slot's sleeplock.
pub struct InodeBody {
    pub valid: bool,
    pub typ: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

impl InodeBody {
    fn empty() -> Self {
        InodeBody {
            valid: false,
            typ: 0,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }
}

#[derive(Clone, Copy)]
struct IMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

struct InodeSlot {
    body: SleepLock<InodeBody>,
}

pub struct InodeTable {
    meta: SpinLock<Vec<IMeta>>,
    slots: Vec<InodeSlot>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        InodeTable {
            meta: SpinLock::new(
                "itable",
                vec![
                    IMeta {
                        dev: 0,
                        inum: 0,
                        refcnt: 0
                    };
                    NINODE
                ],
            ),
            slots: (0..NINODE)
                .map(|_| InodeSlot {
                    body: SleepLock::new("inode", InodeBody::empty()),
                })
                .collect(),
        }
    }

    /// Find or claim a cache slot for `(dev, inum)` and take a
    /// reference. The body stays unloaded until the first lock.
    pub fn iget(&self, dev: u32, inum: u32) -> Iref {
        let mut meta = self.meta.lock();
        let mut free = None;
        for (i, m) in meta.iter_mut().enumerate() {
            if m.refcnt > 0 && m.dev == dev && m.inum == inum {
                m.refcnt += 1;
                return Iref { idx: i, dev, inum };
            }
            if free.is_none() && m.refcnt == 0 {
                free = Some(i);
            }
        }
        let idx = free.unwrap_or_else(|| panic!("iget: inode cache full"));
        meta[idx] = IMeta {
            dev,
            inum,
            refcnt: 1,
        };
        // refcnt was zero, so no one holds the body lock.
        unsafe {
            self.slots[idx].body.get_mut_unchecked().valid = false;
        }
        Iref { idx, dev, inum }
    }
}

/// A counted reference to a cached inode. Not `Clone`: references are
/// taken with `idup` and surrendered with `iput`.
pub struct Iref {
    pub idx: usize,
    pub dev: u32,
    pub inum: u32,
}

impl Iref {
    /// A second handle to the same slot without adjusting the count.
    /// The alias must not outlive the reference backing `self`.
    pub(crate) fn alias(&self) -> Iref {
        Iref {
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }
}

/// A locked inode; dereferences to the cached fields.
pub struct InodeGuard<'a> {
    pub dev: u32,
    pub inum: u32,
    pub idx: usize,
    body: SleepGuard<'a, InodeBody>,
}

impl<'a> core::ops::Deref for InodeGuard<'a> {
    type Target = InodeBody;
    fn deref(&self) -> &InodeBody {
        &self.body
    }
}

impl<'a> core::ops::DerefMut for InodeGuard<'a> {
    fn deref_mut(&mut self) -> &mut InodeBody {
        &mut self.body
    }
}

/// Destination of a file read.
pub enum IoDst<'a> {
    Kernel(&'a mut [u8]),
    /// User virtual address and length in the current address space.
    User(u64, usize),
}

impl IoDst<'_> {
    fn len(&self) -> usize {
        match self {
            IoDst::Kernel(b) => b.len(),
            IoDst::User(_, n) => *n,
        }
    }
}

/// Source of a file write.
pub enum IoSrc<'a> {
    Kernel(&'a [u8]),
    User(u64, usize),
}

impl IoSrc<'_> {
    fn len(&self) -> usize {
        match self {
            IoSrc::Kernel(b) => b.len(),
            IoSrc::User(_, n) => *n,
        }
    }
}

impl Kernel {
    pub fn sb(&self) -> &Superblock {
        self.sb.get().expect("filesystem not initialized")
    }

    /// Mount the filesystem: read the superblock from block 1 and run
    /// log recovery, or format the disk first when the magic number
    /// says it never held a filesystem. Runs in the first process.
    pub(crate) fn fs_init(&self, dev: u32) {
        let disk_sb: Superblock = {
            let b = self.bread(dev, 1);
            b.read_obj(0)
        };

        if disk_sb.magic == FSMAGIC {
            log::info!(
                "fs: mounting (size={} inodes={} log={})",
                disk_sb.size,
                disk_sb.ninodes,
                disk_sb.nlog
            );
            self.sb.set(disk_sb).ok();
            self.log_init(dev, &disk_sb);
            return;
        }

        log::info!("fs: no filesystem on disk, formatting");
        let sb = Superblock::fresh(FSSIZE);
        {
            let mut b = self.bread(dev, 1);
            b.fill(0);
            b.write_obj(0, &sb);
            self.bwrite(&b);
        }
        self.sb.set(sb).ok();
        self.log_init(dev, &sb);

        // Everything up to and including the bitmap is metadata; mark
        // it allocated, through the log.
        self.begin_op();
        {
            let mut b = self.bread(dev, sb.bblock(0));
            let mut bits = vec![0u8; BSIZE];
            b.read_at(0, &mut bits);
            for blk in 0..=sb.bmapstart {
                bits[(blk / 8) as usize] |= 1 << (blk % 8);
            }
            b.write_at(0, &bits);
            self.log_write(&b);
        }
        self.end_op();

        // Root directory.
        self.begin_op();
        let root = self.ialloc(dev, T_DIR);
        assert!(root.inum == ROOTINO, "fs: root inode is not ROOTINO");
        let mut g = self.ilock(&root);
        g.nlink = 2; // "." and the parent slot it fills itself
        g.size = 0;
        self.iupdate(&g);
        self.dirlink(&mut g, b".", ROOTINO).expect("fs: root '.'");
        self.dirlink(&mut g, b"..", ROOTINO).expect("fs: root '..'");
        drop(g);
        self.iput(root);
        self.end_op();
        log::info!("fs: formatted, root directory ready");
    }

    // Allocate a zeroed data block, marking it in the bitmap.
    fn balloc(&self, dev: u32) -> u32 {
        let sb = *self.sb();
        let mut base = 0u32;
        while base < sb.size {
            let mut bp = self.bread(dev, sb.bblock(base));
            let mut bits = vec![0u8; BSIZE];
            bp.read_at(0, &mut bits);
            let mut bi = 0u32;
            while bi < BPB && base + bi < sb.size {
                let mask = 1u8 << (bi % 8);
                if bits[(bi / 8) as usize] & mask == 0 {
                    bits[(bi / 8) as usize] |= mask;
                    bp.write_at((bi / 8) as usize, &bits[(bi / 8) as usize..][..1]);
                    self.log_write(&bp);
                    drop(bp);
                    let mut zb = self.bread(dev, base + bi);
                    zb.fill(0);
                    self.log_write(&zb);
                    return base + bi;
                }
                bi += 1;
            }
            base += BPB;
        }
        panic!("balloc: out of blocks");
    }

    // Release a data block in the bitmap.
    fn bfree(&self, dev: u32, b: u32) {
        let sb = *self.sb();
        let mut bp = self.bread(dev, sb.bblock(b));
        let bi = b % BPB;
        let mask = 1u8 << (bi % 8);
        let mut byte = [0u8; 1];
        bp.read_at((bi / 8) as usize, &mut byte);
        assert!(byte[0] & mask != 0, "bfree: freeing free block {}", b);
        byte[0] &= !mask;
        bp.write_at((bi / 8) as usize, &byte);
        self.log_write(&bp);
    }

    /// Allocate an on-disk inode of the given type and return a cached
    /// reference to it.
    pub fn ialloc(&self, dev: u32, typ: i16) -> Iref {
        let sb = *self.sb();
        for inum in 1..sb.ninodes {
            let mut bp = self.bread(dev, sb.iblock(inum));
            let off = (inum % IPB) as usize * core::mem::size_of::<Dinode>();
            let din: Dinode = bp.read_obj(off);
            if din.typ == 0 {
                let mut fresh = Dinode::new_zeroed();
                fresh.typ = typ;
                bp.write_obj(off, &fresh);
                self.log_write(&bp);
                drop(bp);
                return self.itable.iget(dev, inum);
            }
        }
        panic!("ialloc: no free inodes");
    }

    pub fn iget(&self, dev: u32, inum: u32) -> Iref {
        self.itable.iget(dev, inum)
    }

    /// Take another reference to a cached inode.
    pub fn idup(&self, ip: &Iref) -> Iref {
        let mut meta = self.itable.meta.lock();
        meta[ip.idx].refcnt += 1;
        ip.alias()
    }

    /// Lock the inode, loading its on-disk fields on first access.
    pub fn ilock(&self, ip: &Iref) -> InodeGuard<'_> {
        let mut body = self.itable.slots[ip.idx].body.lock(self);
        if !body.valid {
            let bp = self.bread(ip.dev, self.sb().iblock(ip.inum));
            let off = (ip.inum % IPB) as usize * core::mem::size_of::<Dinode>();
            let din: Dinode = bp.read_obj(off);
            body.typ = din.typ;
            body.major = din.major;
            body.minor = din.minor;
            body.nlink = din.nlink;
            body.size = din.size;
            body.addrs = din.addrs;
            body.valid = true;
            assert!(body.typ != 0, "ilock: unallocated inode {}", ip.inum);
        }
        InodeGuard {
            dev: ip.dev,
            inum: ip.inum,
            idx: ip.idx,
            body,
        }
    }

    /// Write the cached inode fields back to its dinode, through the
    /// log.
    pub fn iupdate(&self, g: &InodeGuard<'_>) {
        let mut bp = self.bread(g.dev, self.sb().iblock(g.inum));
        let off = (g.inum % IPB) as usize * core::mem::size_of::<Dinode>();
        let din = Dinode {
            typ: g.typ,
            major: g.major,
            minor: g.minor,
            nlink: g.nlink,
            size: g.size,
            addrs: g.addrs,
        };
        bp.write_obj(off, &din);
        self.log_write(&bp);
    }

    /// Surrender a reference. The last reference to an unlinked inode
    /// truncates it and clears its on-disk type; the caller must be
    /// inside a transaction for that reason.
    pub fn iput(&self, ip: Iref) {
        let mut meta = self.itable.meta.lock();
        assert!(meta[ip.idx].refcnt >= 1, "iput: unreferenced inode");
        if meta[ip.idx].refcnt == 1 {
            // Sole reference and unlocked, so peeking is safe and the
            // lock below cannot block.
            let (valid, nlink) = {
                let body = unsafe { self.itable.slots[ip.idx].body.get_mut_unchecked() };
                (body.valid, body.nlink)
            };
            if valid && nlink == 0 {
                drop(meta);
                let mut g = self.ilock(&ip);
                self.itrunc(&mut g);
                g.typ = 0;
                self.iupdate(&g);
                g.valid = false;
                drop(g);
                meta = self.itable.meta.lock();
            }
        }
        meta[ip.idx].refcnt -= 1;
    }

    /// Unlock and release in one step.
    pub fn iunlockput(&self, g: InodeGuard<'_>, ip: Iref) {
        drop(g);
        self.iput(ip);
    }

    // Map a logical block index to a disk block, allocating direct or
    // indirect backing on demand. Newly touched allocator metadata is
    // logged here; the inode itself is written back by the caller.
    fn block_map(&self, g: &mut InodeGuard<'_>, bn: u32) -> u32 {
        if (bn as usize) < NDIRECT {
            let mut addr = g.addrs[bn as usize];
            if addr == 0 {
                addr = self.balloc(g.dev);
                g.addrs[bn as usize] = addr;
            }
            return addr;
        }

        let bn = bn as usize - NDIRECT;
        assert!(bn < NINDIRECT, "block_map: block index out of range");
        let mut ind = g.addrs[NDIRECT];
        if ind == 0 {
            ind = self.balloc(g.dev);
            g.addrs[NDIRECT] = ind;
        }
        let mut bp = self.bread(g.dev, ind);
        let mut addr: u32 = bp.read_obj(bn * 4);
        if addr == 0 {
            addr = self.balloc(g.dev);
            bp.write_obj(bn * 4, &addr);
            self.log_write(&bp);
        }
        addr
    }

    /// Free every data block and reset the size to zero.
    pub fn itrunc(&self, g: &mut InodeGuard<'_>) {
        for i in 0..NDIRECT {
            if g.addrs[i] != 0 {
                self.bfree(g.dev, g.addrs[i]);
                g.addrs[i] = 0;
            }
        }
        if g.addrs[NDIRECT] != 0 {
            let bp = self.bread(g.dev, g.addrs[NDIRECT]);
            for j in 0..NINDIRECT {
                let addr: u32 = bp.read_obj(j * 4);
                if addr != 0 {
                    self.bfree(g.dev, addr);
                }
            }
            drop(bp);
            self.bfree(g.dev, g.addrs[NDIRECT]);
            g.addrs[NDIRECT] = 0;
        }
        g.size = 0;
        self.iupdate(g);
    }

    /// Read file content, honoring the file size; short reads at EOF
    /// return the available bytes.
    pub fn readi(&self, g: &mut InodeGuard<'_>, dst: IoDst<'_>, off: u32) -> Result<usize> {
        let want = dst.len();
        if off > g.size || off.checked_add(want as u32).is_none() {
            return Ok(0);
        }
        let n = want.min((g.size - off) as usize);

        let mut done = 0usize;
        let mut dst = dst;
        while done < n {
            let pos = off as usize + done;
            let addr = self.block_map(g, (pos / BSIZE) as u32);
            let bp = self.bread(g.dev, addr);
            let boff = pos % BSIZE;
            let m = (n - done).min(BSIZE - boff);
            match &mut dst {
                IoDst::Kernel(buf) => {
                    bp.read_at(boff, &mut buf[done..done + m]);
                }
                IoDst::User(va, _) => {
                    let mut tmp = vec![0u8; m];
                    bp.read_at(boff, &mut tmp);
                    let pgtbl = unsafe { self.cur_data() }.pgtbl;
                    uvm::copyout(self.mem(), &self.pmem, pgtbl, *va + done as u64, &tmp)
                        .map_err(|_| KernelError::BadAddress)?;
                }
            }
            done += m;
        }
        Ok(n)
    }

    /// Write file content, extending the file (up to `MAXFILE` blocks)
    /// and logging every touched block.
    pub fn writei(&self, g: &mut InodeGuard<'_>, src: IoSrc<'_>, off: u32) -> Result<usize> {
        let n = src.len();
        if off > g.size {
            return Err(KernelError::BadArg);
        }
        if off as usize + n > MAXFILE * BSIZE {
            return Err(KernelError::FileTooLarge);
        }

        let mut done = 0usize;
        let src = src;
        while done < n {
            let pos = off as usize + done;
            let addr = self.block_map(g, (pos / BSIZE) as u32);
            let mut bp = self.bread(g.dev, addr);
            let boff = pos % BSIZE;
            let m = (n - done).min(BSIZE - boff);
            match &src {
                IoSrc::Kernel(buf) => {
                    bp.write_at(boff, &buf[done..done + m]);
                }
                IoSrc::User(va, _) => {
                    let mut tmp = vec![0u8; m];
                    let pgtbl = unsafe { self.cur_data() }.pgtbl;
                    if uvm::copyin(self.mem(), &self.pmem, pgtbl, &mut tmp, *va + done as u64)
                        .is_err()
                    {
                        break;
                    }
                    bp.write_at(boff, &tmp);
                }
            }
            self.log_write(&bp);
            done += m;
        }

        let end = off as usize + done;
        if end as u32 > g.size {
            g.size = end as u32;
        }
        self.iupdate(g);
        Ok(done)
    }

    pub fn stati(&self, g: &InodeGuard<'_>) -> Stat {
        Stat {
            dev: g.dev,
            ino: g.inum,
            typ: g.typ,
            nlink: g.nlink,
            size: g.size,
        }
    }

    /// Look `name` up in a directory; returns the entry's inode and its
    /// byte offset within the directory.
    pub fn dirlookup(&self, g: &mut InodeGuard<'_>, name: &[u8]) -> Option<(Iref, u32)> {
        assert!(g.typ == T_DIR, "dirlookup: not a directory");
        let mut off = 0u32;
        while off < g.size {
            let mut raw = [0u8; DIRENT_SIZE];
            let n = self
                .readi(g, IoDst::Kernel(&mut raw), off)
                .expect("dirlookup: read");
            assert!(n == DIRENT_SIZE, "dirlookup: short directory read");
            let ent: Dirent = zerocopy::FromBytes::read_from(&raw[..]).unwrap();
            if ent.inum != 0 && ent.name_is(name) {
                return Some((self.itable.iget(g.dev, ent.inum as u32), off));
            }
            off += DIRENT_SIZE as u32;
        }
        None
    }

    /// Add a directory entry; names must be unique per directory.
    pub fn dirlink(&self, g: &mut InodeGuard<'_>, name: &[u8], inum: u32) -> Result<()> {
        if let Some((ip, _)) = self.dirlookup(g, name) {
            self.iput(ip);
            return Err(KernelError::Exists);
        }

        // First free slot, or the end of the directory.
        let mut off = 0u32;
        while off < g.size {
            let mut raw = [0u8; DIRENT_SIZE];
            let n = self
                .readi(g, IoDst::Kernel(&mut raw), off)
                .expect("dirlink: read");
            assert!(n == DIRENT_SIZE, "dirlink: short directory read");
            let ent: Dirent = zerocopy::FromBytes::read_from(&raw[..]).unwrap();
            if ent.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let mut ent = Dirent::new(inum as u16, "");
        ent.set_name(name);
        let n = self.writei(g, IoSrc::Kernel(ent.as_bytes()), off)?;
        assert!(n == DIRENT_SIZE, "dirlink: short directory write");
        Ok(())
    }

    /// True when a directory holds nothing but "." and "..".
    pub fn dir_is_empty(&self, g: &mut InodeGuard<'_>) -> bool {
        let mut off = (2 * DIRENT_SIZE) as u32;
        while off < g.size {
            let mut raw = [0u8; DIRENT_SIZE];
            let n = self
                .readi(g, IoDst::Kernel(&mut raw), off)
                .expect("dir_is_empty: read");
            assert!(n == DIRENT_SIZE, "dir_is_empty: short read");
            let ent: Dirent = zerocopy::FromBytes::read_from(&raw[..]).unwrap();
            if ent.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }

    // Split a path into its components; repeated and trailing slashes
    // carry no meaning.
    fn path_components(path: &[u8]) -> Vec<&[u8]> {
        path.split(|&b| b == b'/')
            .filter(|c| !c.is_empty())
            .collect()
    }

    // Walk a path from the root (absolute) or the current working
    // inode. With `parent` set, stops one component early and hands
    // back the final name.
    fn namex(&self, path: &[u8], parent: bool) -> Option<(Iref, Vec<u8>)> {
        let mut ip = if path.first() == Some(&b'/') {
            self.itable.iget(crate::param::ROOTDEV, ROOTINO)
        } else {
            let data = unsafe { self.cur_data() };
            let cwd = data.cwd.as_ref().expect("namex: no cwd");
            self.idup(cwd)
        };

        let comps = Self::path_components(path);
        for (i, name) in comps.iter().enumerate() {
            let mut g = self.ilock(&ip);
            if g.typ != T_DIR {
                drop(g);
                self.iput(ip);
                return None;
            }
            if parent && i == comps.len() - 1 {
                drop(g);
                let mut last = name.to_vec();
                last.truncate(DIRSIZ);
                return Some((ip, last));
            }
            let next = self.dirlookup(&mut g, name);
            drop(g);
            self.iput(ip);
            match next {
                Some((n, _)) => ip = n,
                None => return None,
            }
        }

        if parent {
            // Path had no final component to name (e.g. "/").
            self.iput(ip);
            return None;
        }
        Some((ip, Vec::new()))
    }

    /// Resolve a path to an inode reference.
    pub fn namei(&self, path: &[u8]) -> Option<Iref> {
        self.namex(path, false).map(|(ip, _)| ip)
    }

    /// Resolve a path to its parent directory plus the final name.
    pub fn nameiparent(&self, path: &[u8]) -> Option<(Iref, Vec<u8>)> {
        self.namex(path, true)
    }
}
