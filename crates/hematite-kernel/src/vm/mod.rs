//! Page-table primitives and the kernel address space.
//!
//! Page tables are real SV39 trees living in guest frames; `walk`
//! descends the three levels by reading entries out of DRAM and, when
//! asked, installing zeroed kernel-pool frames as internal nodes.

pub mod mmap;
pub mod uvm;

use crate::memlayout::*;
use crate::param::NPROC;
use crate::pmem::{Pmem, Pool};
use crate::riscv::*;
use hematite_machine::memory::PhysMemory;

/// Find the level-0 PTE for `va`, returning the physical address of the
/// entry itself. With `alloc` set, missing interior tables are created
/// from the kernel pool (zeroed, valid bit only).
pub fn walk(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, va: u64, alloc: bool) -> Option<u64> {
    assert!(va < VA_MAX, "walk: va {:#x} out of range", va);
    let mut table = pgtbl;
    for level in [2usize, 1] {
        let pte_pa = table + vpn(va, level) * 8;
        let pte = mem.read_u64(pte_pa);
        if pte_valid(pte) {
            assert!(
                pte_is_internal(pte),
                "walk: leaf at level {} for va {:#x}",
                level,
                va
            );
            table = pte_to_pa(pte);
        } else {
            if !alloc {
                return None;
            }
            let frame = pmem.alloc(mem, Pool::Kernel);
            mem.fill(frame, PGSIZE as usize, 0);
            mem.write_u64(pte_pa, pa_to_pte(frame) | PteFlags::V.bits());
            table = frame;
        }
    }
    Some(table + vpn(va, 0) * 8)
}

/// Install leaf mappings for `[va, va+len) -> [pa, pa+len)`.
/// `va`, `pa` and `len` must be page-aligned, `len > 0`, and the range
/// must fit below `VA_MAX`. Remapping a valid entry is fatal.
pub fn map_pages(
    mem: &PhysMemory,
    pmem: &Pmem,
    pgtbl: u64,
    va: u64,
    pa: u64,
    len: u64,
    perm: PteFlags,
) {
    assert!(va % PGSIZE == 0, "map_pages: va {:#x} not aligned", va);
    assert!(pa % PGSIZE == 0, "map_pages: pa {:#x} not aligned", pa);
    assert!(len > 0 && len % PGSIZE == 0, "map_pages: bad len {:#x}", len);
    assert!(va + len <= VA_MAX, "map_pages: range beyond VA_MAX");

    let mut cur_va = va;
    let mut cur_pa = pa;
    while cur_va < va + len {
        let pte_pa = walk(mem, pmem, pgtbl, cur_va, true).expect("map_pages: walk failed");
        let old = mem.read_u64(pte_pa);
        assert!(!pte_valid(old), "map_pages: remap of va {:#x}", cur_va);
        mem.write_u64(pte_pa, pa_to_pte(cur_pa) | (perm | PteFlags::V).bits());
        cur_va += PGSIZE;
        cur_pa += PGSIZE;
    }
}

/// Clear leaf mappings over `[va, va+len)`. Absent entries are skipped;
/// with `free` set the underlying frames go back to the user pool.
pub fn unmap_pages(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, va: u64, len: u64, free: bool) {
    assert!(va % PGSIZE == 0, "unmap_pages: va {:#x} not aligned", va);
    assert!(len > 0, "unmap_pages: empty range");

    let mut cur = va;
    while cur < va + len {
        if let Some(pte_pa) = walk(mem, pmem, pgtbl, cur, false) {
            let pte = mem.read_u64(pte_pa);
            if pte_valid(pte) {
                if free {
                    pmem.free(mem, pte_to_pa(pte), Pool::User);
                }
                mem.write_u64(pte_pa, 0);
            }
        }
        cur += PGSIZE;
    }
}

/// Leaf PTE value for `va`, if mapped.
pub fn peek_pte(mem: &PhysMemory, pmem: &Pmem, pgtbl: u64, va: u64) -> Option<u64> {
    let pte_pa = walk(mem, pmem, pgtbl, va, false)?;
    let pte = mem.read_u64(pte_pa);
    if pte_valid(pte) {
        Some(pte)
    } else {
        None
    }
}

/// Build the kernel page table: identity-map the devices, the kernel
/// image area (RWX), the allocatable region (RW), the trampoline page at
/// the top of the virtual space, and one stack per process slot with an
/// unmapped guard page below each.
pub fn kvm_make(mem: &PhysMemory, pmem: &Pmem) -> u64 {
    let kpgtbl = pmem.alloc(mem, Pool::Kernel);
    mem.fill(kpgtbl, PGSIZE as usize, 0);

    let rw = PteFlags::R | PteFlags::W;
    map_pages(mem, pmem, kpgtbl, UART0, UART0, PGSIZE, rw);
    map_pages(mem, pmem, kpgtbl, VIRTIO0, VIRTIO0, PGSIZE, rw);
    map_pages(mem, pmem, kpgtbl, FINISHER, FINISHER, PGSIZE, rw);
    map_pages(mem, pmem, kpgtbl, CLINT_BASE, CLINT_BASE, CLINT_SIZE, rw);
    map_pages(mem, pmem, kpgtbl, PLIC_BASE, PLIC_BASE, PLIC_SIZE, rw);

    // Kernel image, then the allocatable frames.
    map_pages(
        mem,
        pmem,
        kpgtbl,
        KERNEL_BASE,
        KERNEL_BASE,
        ALLOC_BEGIN - KERNEL_BASE,
        PteFlags::R | PteFlags::W | PteFlags::X,
    );
    map_pages(
        mem,
        pmem,
        kpgtbl,
        ALLOC_BEGIN,
        ALLOC_BEGIN,
        mem.end() - ALLOC_BEGIN,
        rw,
    );

    map_pages(
        mem,
        pmem,
        kpgtbl,
        TRAMPOLINE,
        TRAMPOLINE_PA,
        PGSIZE,
        PteFlags::R | PteFlags::X,
    );

    // Kernel stacks; the hole below each one is the guard page.
    for p in 0..NPROC {
        let pa = pmem.alloc(mem, Pool::Kernel);
        map_pages(mem, pmem, kpgtbl, kstack(p), pa, PGSIZE, rw);
    }

    log::debug!("kvm: kernel page table at {:#x}", kpgtbl);
    kpgtbl
}
