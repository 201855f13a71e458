//! Physical frame allocator.
//!
//! DRAM above the kernel image is split into two pools: a fixed-size
//! kernel pool (page tables, trapframes, kernel stacks, disk buffers)
//! and a user pool (everything mapped into user address spaces). Each
//! pool keeps an intrusive freelist threaded through the freed frames
//! themselves: the first eight bytes of a free frame hold the physical
//! address of the next free frame.
//!
//! A frame handed out is filled with a sentinel byte so stale contents
//! are never mistaken for valid data; callers that need zeroed memory
//! clear it themselves.

use crate::param::KERN_POOL_PAGES;
use crate::riscv::PGSIZE;
use crate::sync::SpinLock;
use hematite_machine::memory::PhysMemory;

/// Byte pattern written over every freshly allocated frame.
pub const FRAME_SENTINEL: u8 = 0xa5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Kernel,
    User,
}

struct RegionInner {
    free_count: u64,
    /// Physical address of the first free frame, or 0.
    head: u64,
}

pub struct AllocRegion {
    begin: u64,
    end: u64,
    inner: SpinLock<RegionInner>,
}

impl AllocRegion {
    fn new(name: &'static str, begin: u64, end: u64) -> Self {
        AllocRegion {
            begin,
            end,
            inner: SpinLock::new(name, RegionInner {
                free_count: 0,
                head: 0,
            }),
        }
    }

    /// Thread every frame of the region onto the freelist.
    fn seed(&self, mem: &PhysMemory) {
        let mut inner = self.inner.lock();
        let mut head = 0u64;
        let mut count = 0u64;
        let mut pa = self.end - PGSIZE;
        loop {
            mem.write_u64(pa, head);
            head = pa;
            count += 1;
            if pa == self.begin {
                break;
            }
            pa -= PGSIZE;
        }
        inner.head = head;
        inner.free_count = count;
    }

    fn contains(&self, pa: u64) -> bool {
        pa >= self.begin && pa < self.end
    }

    fn alloc(&self, mem: &PhysMemory) -> u64 {
        let mut inner = self.inner.lock();
        let pa = inner.head;
        if pa == 0 {
            panic!("pmem: out of memory in [{:#x},{:#x})", self.begin, self.end);
        }
        inner.head = mem.read_u64(pa);
        inner.free_count -= 1;
        drop(inner);
        mem.fill(pa, PGSIZE as usize, FRAME_SENTINEL);
        pa
    }

    fn free(&self, mem: &PhysMemory, pa: u64) {
        assert!(pa % PGSIZE == 0, "pmem: freeing unaligned frame {:#x}", pa);
        assert!(
            self.contains(pa),
            "pmem: frame {:#x} outside [{:#x},{:#x})",
            pa,
            self.begin,
            self.end
        );
        let mut inner = self.inner.lock();
        if cfg!(debug_assertions) {
            // Freelist membership scan; a duplicate free is fatal.
            let mut cur = inner.head;
            while cur != 0 {
                assert!(cur != pa, "pmem: double free of frame {:#x}", pa);
                cur = mem.read_u64(cur);
            }
        }
        mem.write_u64(pa, inner.head);
        inner.head = pa;
        inner.free_count += 1;
    }

    fn free_count(&self) -> u64 {
        self.inner.lock().free_count
    }
}

pub struct Pmem {
    kern: AllocRegion,
    user: AllocRegion,
}

impl Pmem {
    /// Partition `[alloc_begin, dram end)` into the two pools and thread
    /// their freelists.
    pub fn new(mem: &PhysMemory, alloc_begin: u64) -> Pmem {
        assert!(alloc_begin % PGSIZE == 0);
        let kern_end = alloc_begin + KERN_POOL_PAGES * PGSIZE;
        assert!(kern_end < mem.end(), "pmem: dram too small for kernel pool");
        let pmem = Pmem {
            kern: AllocRegion::new("kern_region", alloc_begin, kern_end),
            user: AllocRegion::new("user_region", kern_end, mem.end()),
        };
        pmem.kern.seed(mem);
        pmem.user.seed(mem);
        log::info!(
            "pmem: kernel pool [{:#x},{:#x}) {} pages, user pool [{:#x},{:#x}) {} pages",
            pmem.kern.begin,
            pmem.kern.end,
            pmem.kern.free_count(),
            pmem.user.begin,
            pmem.user.end,
            pmem.user.free_count()
        );
        pmem
    }

    fn region(&self, pool: Pool) -> &AllocRegion {
        match pool {
            Pool::Kernel => &self.kern,
            Pool::User => &self.user,
        }
    }

    /// Take a frame from the pool. Exhaustion is fatal.
    pub fn alloc(&self, mem: &PhysMemory, pool: Pool) -> u64 {
        self.region(pool).alloc(mem)
    }

    /// Return `pa` to the pool it must belong to.
    pub fn free(&self, mem: &PhysMemory, pa: u64, pool: Pool) {
        self.region(pool).free(mem, pa)
    }

    /// Return `pa` to whichever pool covers it.
    pub fn free_auto(&self, mem: &PhysMemory, pa: u64) {
        if self.kern.contains(pa) {
            self.kern.free(mem, pa);
        } else {
            self.user.free(mem, pa);
        }
    }

    pub fn free_count(&self, pool: Pool) -> u64 {
        self.region(pool).free_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBench;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn balanced_alloc_free_restores_counts() {
        let bench = TestBench::new();
        let (mem, pmem) = (bench.mem(), &bench.pmem);
        for pool in [Pool::Kernel, Pool::User] {
            let before = pmem.free_count(pool);
            let mut frames = Vec::new();
            for _ in 0..16 {
                let pa = pmem.alloc(mem, pool);
                assert_eq!(pa % PGSIZE, 0);
                frames.push(pa);
            }
            let unique: HashSet<u64> = frames.iter().copied().collect();
            assert_eq!(unique.len(), frames.len(), "frame handed out twice");
            assert_eq!(pmem.free_count(pool), before - 16);
            for pa in frames {
                pmem.free(mem, pa, pool);
            }
            assert_eq!(pmem.free_count(pool), before);
        }
    }

    #[test]
    fn alloc_fills_the_sentinel() {
        let bench = TestBench::new();
        let pa = bench.pmem.alloc(bench.mem(), Pool::User);
        let mut buf = [0u8; 64];
        bench.mem().read_bytes(pa + 1000, &mut buf);
        assert!(buf.iter().all(|&b| b == FRAME_SENTINEL));
        bench.pmem.free(bench.mem(), pa, Pool::User);
    }

    #[test]
    fn random_churn_balances() {
        let bench = TestBench::new();
        let (mem, pmem) = (bench.mem(), &bench.pmem);
        let before = pmem.free_count(Pool::User);
        let mut rng = StdRng::seed_from_u64(0x4852_4d54);
        let mut live: Vec<u64> = Vec::new();
        for _ in 0..400 {
            if live.is_empty() || rng.gen_bool(0.6) {
                live.push(pmem.alloc(mem, Pool::User));
            } else {
                let i = rng.gen_range(0..live.len());
                pmem.free(mem, live.swap_remove(i), Pool::User);
            }
        }
        for pa in live {
            pmem.free(mem, pa, Pool::User);
        }
        assert_eq!(pmem.free_count(Pool::User), before);
    }

    #[test]
    fn free_auto_routes_by_range() {
        let bench = TestBench::new();
        let (mem, pmem) = (bench.mem(), &bench.pmem);
        let kb = pmem.free_count(Pool::Kernel);
        let ub = pmem.free_count(Pool::User);
        let k = pmem.alloc(mem, Pool::Kernel);
        let u = pmem.alloc(mem, Pool::User);
        pmem.free_auto(mem, k);
        pmem.free_auto(mem, u);
        assert_eq!(pmem.free_count(Pool::Kernel), kb);
        assert_eq!(pmem.free_count(Pool::User), ub);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_free_is_fatal() {
        let bench = TestBench::new();
        let pa = bench.pmem.alloc(bench.mem(), Pool::User);
        bench.pmem.free(bench.mem(), pa + 8, Pool::User);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn cross_pool_free_is_fatal() {
        let bench = TestBench::new();
        let pa = bench.pmem.alloc(bench.mem(), Pool::Kernel);
        bench.pmem.free(bench.mem(), pa, Pool::User);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let bench = TestBench::new();
        let pa = bench.pmem.alloc(bench.mem(), Pool::User);
        bench.pmem.free(bench.mem(), pa, Pool::User);
        bench.pmem.free(bench.mem(), pa, Pool::User);
    }
}
