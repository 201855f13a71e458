//! System-wide tunables.

/// Maximum number of processes.
pub const NPROC: usize = 64;
/// Number of harts running the scheduler.
pub const NCPU: usize = 2;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Open files per system.
pub const NFILE: usize = 100;
/// Maximum number of active in-memory inodes.
pub const NINODE: usize = 100;
/// Buffers in the disk block cache.
pub const NBUF: usize = 30;
/// Pooled mapped-region records shared by all processes.
pub const NMMAP: usize = 256;
/// Maximum blocks one transaction may dirty.
pub const MAXOPBLOCKS: usize = 10;
/// Maximum path length accepted from user space.
pub const MAXPATH: usize = 128;
/// Buffer for strings passed to `print`.
pub const MAXPRINT: usize = 256;
/// Device number of the root filesystem.
pub const ROOTDEV: u32 = 1;
/// Frames owned by the kernel pool; the rest of DRAM is the user pool.
pub const KERN_POOL_PAGES: u64 = 1024;
/// Milliseconds per clock tick.
pub const TICK_MS: u64 = 1;
