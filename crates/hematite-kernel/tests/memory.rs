//! User address-space system calls: brk, mmap, munmap, and the
//! load/store behavior they produce through the page table.

use hematite_kernel::riscv::{pg_round_up, PGSIZE};
use hematite_kernel::testing::boot_fresh;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn brk_grow_then_store_and_load() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0);
        assert!(h > 0);
        let h = h as u64;
        assert_eq!(env.brk(h + 4096), (h + 4096) as i64);
        assert!(env.poke(h, 0x5a), "store at old break must succeed");
        assert_eq!(env.peek(h), Some(0x5a));
        // Shrink back; the page is gone.
        assert_eq!(env.brk(h), h as i64);
        assert_eq!(env.peek(h), None);
        0
    });
    assert!(res.clean);
}

#[test]
fn brk_refuses_to_cross_into_the_stack() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0);
        assert!(h > 0);
        assert_eq!(env.brk(u64::MAX / 2), -1);
        // Failure left the heap untouched.
        assert_eq!(env.brk(0), h);
        0
    });
    assert!(res.clean);
}

#[test]
fn mmap_store_load_roundtrip_and_fault_after_munmap() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0) as u64;
        let base = pg_round_up(h) + 2 * PGSIZE;

        assert_eq!(env.mmap(base, 4096), base as i64);
        assert!(env.poke(base, 0xee));
        assert!(env.poke(base + 4095, 0x11));
        assert_eq!(env.peek(base), Some(0xee));
        assert_eq!(env.peek(base + 4095), Some(0x11));

        assert_eq!(env.munmap(base, 4096), 0);
        assert_eq!(env.peek(base), None, "unmapped page must fault");
        assert!(!env.poke(base, 1));
        0
    });
    assert!(res.clean);
}

#[test]
fn mmap_auto_placement_is_above_the_heap() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0) as u64;
        let lo = pg_round_up(h) + PGSIZE;

        let a = env.mmap(0, 2 * PGSIZE);
        assert!(a >= lo as i64);
        let a = a as u64;
        // Second auto mapping lands elsewhere.
        let b = env.mmap(0, PGSIZE) as u64;
        assert!(b >= a + 2 * PGSIZE || b + PGSIZE <= a);

        assert!(env.poke(a, 1));
        assert!(env.poke(b, 2));
        assert_eq!(env.munmap(a, 2 * PGSIZE), 0);
        assert_eq!(env.munmap(b, PGSIZE), 0);
        0
    });
    assert!(res.clean);
}

#[test]
fn mmap_rejects_bad_arguments() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0) as u64;
        let base = pg_round_up(h) + 2 * PGSIZE;
        assert_eq!(env.mmap(base, 100), -1, "unaligned length");
        assert_eq!(env.mmap(base + 1, 4096), -1, "unaligned start");
        assert_eq!(env.mmap(base, 0), -1, "empty mapping");
        assert_eq!(env.munmap(base + 1, 4096), -1);

        // Overlap with an existing region is forbidden.
        assert_eq!(env.mmap(base, 2 * PGSIZE), base as i64);
        assert_eq!(env.mmap(base + PGSIZE, PGSIZE), -1);
        assert_eq!(env.munmap(base, 2 * PGSIZE), 0);
        0
    });
    assert!(res.clean);
}

#[test]
fn munmap_can_split_a_region() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0) as u64;
        let base = pg_round_up(h) + 2 * PGSIZE;

        assert_eq!(env.mmap(base, 4 * PGSIZE), base as i64);
        for i in 0..4 {
            assert!(env.poke(base + i * PGSIZE, i as u8 + 1));
        }
        // Punch out the middle two pages.
        assert_eq!(env.munmap(base + PGSIZE, 2 * PGSIZE), 0);

        assert_eq!(env.peek(base), Some(1));
        assert_eq!(env.peek(base + PGSIZE), None);
        assert_eq!(env.peek(base + 2 * PGSIZE), None);
        assert_eq!(env.peek(base + 3 * PGSIZE), Some(4));

        // The live halves can still be unmapped independently.
        assert_eq!(env.munmap(base, PGSIZE), 0);
        assert_eq!(env.munmap(base + 3 * PGSIZE, PGSIZE), 0);
        0
    });
    assert!(res.clean);
}
