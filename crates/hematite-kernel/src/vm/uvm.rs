//! User address spaces: creation, destruction, duplication, heap
//! growth, anonymous mappings, and the user/kernel copy primitives.

use super::{map_pages, peek_pte, unmap_pages, walk};
use crate::error::{KernelError, Result};
use crate::memlayout::{TRAMPOLINE, TRAMPOLINE_PA, TRAPFRAME};
use crate::pmem::{Pmem, Pool};
use crate::riscv::*;
use crate::vm::mmap;
use crate::Kernel;
use hematite_machine::memory::PhysMemory;

/// A fresh user page table with the two shared mappings installed: the
/// trampoline page (read/execute, no U) and the process trapframe
/// (read/write, no U).
pub fn create_pgtbl(mem: &PhysMemory, pmem: &Pmem, trapframe_pa: u64) -> u64 {
    let pgtbl = pmem.alloc(mem, Pool::Kernel);
    mem.fill(pgtbl, PGSIZE as usize, 0);
    map_pages(
        mem,
        pmem,
        pgtbl,
        TRAMPOLINE,
        TRAMPOLINE_PA,
        PGSIZE,
        PteFlags::R | PteFlags::X,
    );
    map_pages(
        mem,
        pmem,
        pgtbl,
        TRAPFRAME,
        trapframe_pa,
        PGSIZE,
        PteFlags::R | PteFlags::W,
    );
    pgtbl
}

// Recursively free a page-table subtree. `level` is the number of table
// levels at and below `table`; at level 1 the entries are leaves and the
// frames they map go back to the user pool.
fn destroy_level(mem: &PhysMemory, pmem: &Pmem, table: u64, level: u32) {
    for i in 0..NPTE as u64 {
        let pte = mem.read_u64(table + i * 8);
        if !pte_valid(pte) {
            continue;
        }
        if level > 1 {
            let child = pte_to_pa(pte);
            destroy_level(mem, pmem, child, level - 1);
            pmem.free(mem, child, Pool::Kernel);
        } else {
            pmem.free(mem, pte_to_pa(pte), Pool::User);
        }
    }
}

/// Tear down a user address space. Trampoline and trapframe are unmapped
/// without freeing (they are shared or owned elsewhere); every other
/// user leaf frame and all page-table frames are returned to their
/// pools, the top-level frame last.
pub fn destroy_pgtbl(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64) {
    unmap_pages(mem, pmem, pgtbl, TRAPFRAME, PGSIZE, false);
    unmap_pages(mem, pmem, pgtbl, TRAMPOLINE, PGSIZE, false);
    destroy_level(mem, pmem, pgtbl, 3);
    pmem.free(mem, pgtbl, Pool::Kernel);
}

// Duplicate every mapped page of `[begin, end)` from `old` into `new`,
// allocating fresh user frames and copying contents.
fn copy_range(mem: &PhysMemory, pmem: &Pmem, old: u64, new: u64, begin: u64, end: u64) {
    let mut va = begin;
    while va < end {
        if let Some(pte) = peek_pte(mem, pmem, old, va) {
            let src = pte_to_pa(pte);
            let flags = pte_flags(pte);
            let frame = pmem.alloc(mem, Pool::User);
            mem.copy_within(frame, src, PGSIZE as usize);
            map_pages(mem, pmem, new, va, frame, PGSIZE, flags);
        }
        va += PGSIZE;
    }
}

/// Duplicate an address space for fork: the code+heap range, the user
/// stack below the trapframe, and each anonymous region. Trampoline and
/// trapframe are not copied; the child brings its own.
pub fn copy_pgtbl(
    mem: &PhysMemory,
    pmem: &Pmem,
    old: u64,
    new: u64,
    heap_top: u64,
    ustack_pages: u32,
    regions: &[(u64, u32)],
) {
    if heap_top > PGSIZE {
        copy_range(mem, pmem, old, new, PGSIZE, pg_round_up(heap_top));
    }
    if ustack_pages > 0 {
        let bottom = TRAPFRAME - ustack_pages as u64 * PGSIZE;
        copy_range(mem, pmem, old, new, bottom, TRAPFRAME);
    }
    for &(begin, npages) in regions {
        copy_range(mem, pmem, old, new, begin, begin + npages as u64 * PGSIZE);
    }
}

/// Grow the heap to `heap_top + len`, mapping fresh user frames over the
/// newly needed pages. Fails without touching anything if the new top
/// would run into the stack reservation below the trapframe.
pub fn heap_grow(
    mem: &PhysMemory,
    pmem: &Pmem,
    pgtbl: u64,
    heap_top: u64,
    len: u64,
) -> Result<u64> {
    let new_top = heap_top + len;
    let old_aligned = pg_round_up(heap_top);
    let new_aligned = pg_round_up(new_top);
    if new_aligned >= TRAPFRAME - 256 * PGSIZE {
        return Err(KernelError::NoSpace);
    }
    let mut va = old_aligned;
    while va < new_aligned {
        let pa = pmem.alloc(mem, Pool::User);
        map_pages(
            mem,
            pmem,
            pgtbl,
            va,
            pa,
            PGSIZE,
            PteFlags::R | PteFlags::W | PteFlags::U,
        );
        va += PGSIZE;
    }
    Ok(new_top)
}

/// Shrink the heap by `len`, unmapping and freeing pages above the new
/// high-water mark.
pub fn heap_ungrow(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, heap_top: u64, len: u64) -> u64 {
    let new_top = heap_top.saturating_sub(len);
    let old_aligned = pg_round_up(heap_top);
    let new_aligned = pg_round_up(new_top);
    if new_aligned < old_aligned {
        unmap_pages(mem, pmem, pgtbl, new_aligned, old_aligned - new_aligned, true);
    }
    new_top
}

// Leaf PTE for a user-accessible page, or None.
fn user_pte(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, va: u64) -> Option<u64> {
    if va >= VA_MAX {
        return None;
    }
    let pte_pa = walk(mem, pmem, pgtbl, va, false)?;
    let pte = mem.read_u64(pte_pa);
    if pte_valid(pte) && pte_flags(pte).contains(PteFlags::U) {
        Some(pte)
    } else {
        None
    }
}

/// Translate a user virtual address, demanding the given access kind.
/// Used by the hosted user runtime's loads and stores.
pub fn translate_user(
    mem: &PhysMemory,
    pmem: &Pmem,
    pgtbl: u64,
    va: u64,
    need: PteFlags,
) -> Option<u64> {
    let pte = user_pte(mem, pmem, pgtbl, va)?;
    if !pte_flags(pte).contains(need) {
        return None;
    }
    Some(pte_to_pa(pte) + (va % PGSIZE))
}

/// Copy `src` into user space at `dst_va`, one page at a time.
pub fn copyout(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, dst_va: u64, src: &[u8]) -> Result<()> {
    let mut va = dst_va;
    let mut done = 0usize;
    while done < src.len() {
        let page = pg_round_down(va);
        let off = (va - page) as usize;
        let n = (PGSIZE as usize - off).min(src.len() - done);
        let pte = user_pte(mem, pmem, pgtbl, va).ok_or(KernelError::BadAddress)?;
        let pa = pte_to_pa(pte) + off as u64;
        mem.write_bytes(pa, &src[done..done + n]);
        done += n;
        va += n as u64;
    }
    Ok(())
}

/// Copy user memory at `src_va` into `dst`.
pub fn copyin(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, dst: &mut [u8], src_va: u64) -> Result<()> {
    let mut va = src_va;
    let mut done = 0usize;
    while done < dst.len() {
        let page = pg_round_down(va);
        let off = (va - page) as usize;
        let n = (PGSIZE as usize - off).min(dst.len() - done);
        let pte = user_pte(mem, pmem, pgtbl, va).ok_or(KernelError::BadAddress)?;
        let pa = pte_to_pa(pte) + off as u64;
        mem.read_bytes(pa, &mut dst[done..done + n]);
        done += n;
        va += n as u64;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user space, stopping at the NUL or
/// after `maxlen` bytes (in which case the result holds the first
/// `maxlen - 1` bytes, as if the last byte had been forced to NUL).
pub fn copyin_str(
    mem: &PhysMemory,
    pmem: &Pmem,
    pgtbl: u64,
    src_va: u64,
    maxlen: usize,
) -> Result<Vec<u8>> {
    if maxlen == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut va = src_va;
    while out.len() < maxlen {
        let pte = user_pte(mem, pmem, pgtbl, va).ok_or(KernelError::BadAddress)?;
        let pa = pte_to_pa(pte) + (va % PGSIZE);
        let in_page = (PGSIZE - va % PGSIZE) as usize;
        let take = in_page.min(maxlen - out.len());
        let mut chunk = vec![0u8; take];
        mem.read_bytes(pa, &mut chunk);
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(out);
        }
        out.extend_from_slice(&chunk);
        va += take as u64;
    }
    out.truncate(maxlen - 1);
    Ok(out)
}

impl Kernel {
    /// Map `[begin, begin + npages*PGSIZE)` as a fresh anonymous region
    /// of the current process, recording it in the sorted region list.
    pub fn uvm_mmap(&self, begin: u64, npages: u32, perm: PteFlags) {
        if npages == 0 {
            return;
        }
        assert!(begin % PGSIZE == 0, "uvm_mmap: begin not aligned");
        let mem = self.mem();
        let data = unsafe { self.cur_data() };
        data.mmap_head = mmap::insert(&self.mmap_pool, data.mmap_head, begin, npages);
        for i in 0..npages as u64 {
            let pa = self.pmem.alloc(mem, Pool::User);
            map_pages(
                mem,
                &self.pmem,
                data.pgtbl,
                begin + i * PGSIZE,
                pa,
                PGSIZE,
                perm,
            );
        }
    }

    /// Remove `[begin, begin + npages*PGSIZE)` from the current
    /// process's regions, unmapping and freeing the covered pages.
    pub fn uvm_munmap(&self, begin: u64, npages: u32) {
        if npages == 0 {
            return;
        }
        assert!(begin % PGSIZE == 0, "uvm_munmap: begin not aligned");
        let mem = self.mem();
        let data = unsafe { self.cur_data() };
        let end = begin + npages as u64 * PGSIZE;
        data.mmap_head = mmap::remove_range(&self.mmap_pool, data.mmap_head, begin, end);
        unmap_pages(
            mem,
            &self.pmem,
            data.pgtbl,
            begin,
            npages as u64 * PGSIZE,
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBench;
    use proptest::prelude::*;

    fn fresh_space(bench: &TestBench) -> (u64, u64) {
        let tf = bench.pmem.alloc(bench.mem(), Pool::Kernel);
        let pgtbl = create_pgtbl(bench.mem(), &bench.pmem, tf);
        (pgtbl, tf)
    }

    fn map_user_pages(bench: &TestBench, pgtbl: u64, va: u64, n: u64) {
        for i in 0..n {
            let pa = bench.pmem.alloc(bench.mem(), Pool::User);
            map_pages(
                bench.mem(),
                &bench.pmem,
                pgtbl,
                va + i * PGSIZE,
                pa,
                PGSIZE,
                PteFlags::R | PteFlags::W | PteFlags::U,
            );
        }
    }

    #[test]
    fn copyout_copyin_fidelity() {
        let bench = TestBench::new();
        let (pgtbl, _tf) = fresh_space(&bench);
        map_user_pages(&bench, pgtbl, 0x1000, 3);

        // Misaligned start, multi-page body.
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        copyout(bench.mem(), &bench.pmem, pgtbl, 0x1234, &payload).unwrap();
        let mut back = vec![0u8; payload.len()];
        copyin(bench.mem(), &bench.pmem, pgtbl, &mut back, 0x1234).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn copy_primitives_fault_on_unmapped() {
        let bench = TestBench::new();
        let (pgtbl, _tf) = fresh_space(&bench);
        map_user_pages(&bench, pgtbl, 0x1000, 1);
        let err = copyout(bench.mem(), &bench.pmem, pgtbl, 0x1ff0, &[0u8; 64]).unwrap_err();
        assert_eq!(err, KernelError::BadAddress);
        let mut buf = [0u8; 8];
        assert!(copyin(bench.mem(), &bench.pmem, pgtbl, &mut buf, 0x9000).is_err());
    }

    #[test]
    fn copyin_str_stops_at_nul_and_maxlen() {
        let bench = TestBench::new();
        let (pgtbl, _tf) = fresh_space(&bench);
        map_user_pages(&bench, pgtbl, 0x1000, 2);

        copyout(bench.mem(), &bench.pmem, pgtbl, 0x1ffa, b"hello\0world").unwrap();
        let s = copyin_str(bench.mem(), &bench.pmem, pgtbl, 0x1ffa, 64).unwrap();
        assert_eq!(s, b"hello");

        copyout(bench.mem(), &bench.pmem, pgtbl, 0x1000, &[b'x'; 32]).unwrap();
        let s = copyin_str(bench.mem(), &bench.pmem, pgtbl, 0x1000, 8).unwrap();
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn heap_grow_and_ungrow_balance_frames() {
        let bench = TestBench::new();
        let (pgtbl, _tf) = fresh_space(&bench);
        let before = bench.pmem.free_count(Pool::User);

        let top = heap_grow(bench.mem(), &bench.pmem, pgtbl, 2 * PGSIZE, 3 * PGSIZE + 17).unwrap();
        assert_eq!(top, 5 * PGSIZE + 17);
        assert_eq!(bench.pmem.free_count(Pool::User), before - 4);
        // The partially used page is mapped.
        assert!(peek_pte(bench.mem(), &bench.pmem, pgtbl, 5 * PGSIZE).is_some());

        let top = heap_ungrow(bench.mem(), &bench.pmem, pgtbl, top, 3 * PGSIZE + 17);
        assert_eq!(top, 2 * PGSIZE);
        assert_eq!(bench.pmem.free_count(Pool::User), before);
    }

    #[test]
    fn heap_grow_refuses_to_reach_the_stack() {
        let bench = TestBench::new();
        let (pgtbl, _tf) = fresh_space(&bench);
        let huge = TRAPFRAME - 256 * PGSIZE;
        assert_eq!(
            heap_grow(bench.mem(), &bench.pmem, pgtbl, 2 * PGSIZE, huge),
            Err(KernelError::NoSpace)
        );
    }

    #[test]
    fn destroy_returns_every_frame() {
        let bench = TestBench::new();
        let kern_before = bench.pmem.free_count(Pool::Kernel);
        let user_before = bench.pmem.free_count(Pool::User);

        let tf = bench.pmem.alloc(bench.mem(), Pool::Kernel);
        let pgtbl = create_pgtbl(bench.mem(), &bench.pmem, tf);
        map_user_pages(&bench, pgtbl, 0x1000, 5);
        map_user_pages(&bench, pgtbl, TRAPFRAME - PGSIZE, 1);

        destroy_pgtbl(bench.mem(), &bench.pmem, pgtbl);
        bench.pmem.free(bench.mem(), tf, Pool::Kernel);
        assert_eq!(bench.pmem.free_count(Pool::Kernel), kern_before);
        assert_eq!(bench.pmem.free_count(Pool::User), user_before);
    }

    #[test]
    fn copy_pgtbl_duplicates_contents() {
        let bench = TestBench::new();
        let (old, _tf1) = fresh_space(&bench);
        let (new, _tf2) = fresh_space(&bench);

        map_user_pages(&bench, old, PGSIZE, 2); // heap range
        map_user_pages(&bench, old, TRAPFRAME - PGSIZE, 1); // stack
        copyout(bench.mem(), &bench.pmem, old, 0x1100, b"fork me").unwrap();
        copyout(bench.mem(), &bench.pmem, old, TRAPFRAME - 64, b"stack").unwrap();

        copy_pgtbl(bench.mem(), &bench.pmem, old, new, 3 * PGSIZE, 1, &[]);

        let mut buf = [0u8; 7];
        copyin(bench.mem(), &bench.pmem, new, &mut buf, 0x1100).unwrap();
        assert_eq!(&buf, b"fork me");
        let mut buf = [0u8; 5];
        copyin(bench.mem(), &bench.pmem, new, &mut buf, TRAPFRAME - 64).unwrap();
        assert_eq!(&buf, b"stack");

        // Distinct physical frames.
        let p_old = peek_pte(bench.mem(), &bench.pmem, old, 0x1000).unwrap();
        let p_new = peek_pte(bench.mem(), &bench.pmem, new, 0x1000).unwrap();
        assert_ne!(pte_to_pa(p_old), pte_to_pa(p_new));
        assert_eq!(pte_flags(p_old), pte_flags(p_new));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn copy_fidelity_any_offset_and_len(off in 0u64..4096, len in 1usize..9000) {
            let bench = TestBench::new();
            let (pgtbl, _tf) = fresh_space(&bench);
            map_user_pages(&bench, pgtbl, 0x1000, 4);
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            copyout(bench.mem(), &bench.pmem, pgtbl, 0x1000 + off, &data).unwrap();
            let mut back = vec![0u8; len];
            copyin(bench.mem(), &bench.pmem, pgtbl, &mut back, 0x1000 + off).unwrap();
            prop_assert_eq!(back, data);
        }
    }
}
