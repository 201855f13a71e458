//! Lower-level filesystem and resource behavior, driven from process
//! context inside a booted kernel: indirect block mapping, cache
//! eviction under pressure, log absorption, and allocator balance
//! across process lifecycles.

use hematite_kernel::file::OpenFlags;
use hematite_kernel::fs::IoSrc;
use hematite_kernel::pmem::Pool;
use hematite_kernel::testing::boot_fresh;
use hematite_fs::BSIZE;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn files_grow_through_the_indirect_block() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        // 35 blocks: well past the twelve direct pointers.
        let blocks = 35usize;
        let payload: Vec<u8> = (0..blocks * BSIZE).map(|i| (i % 251) as u8).collect();

        let fd = env.open("/big", OpenFlags::CREATE | OpenFlags::RDWR);
        assert!(fd >= 0);
        assert_eq!(env.write(fd, &payload), payload.len() as i64);
        env.close(fd);

        let fd = env.open("/big", OpenFlags::empty());
        let st = env.fstat(fd).expect("fstat");
        assert_eq!(st.size as usize, payload.len());
        let mut back = vec![0u8; payload.len()];
        assert_eq!(env.read(fd, &mut back), payload.len() as i64);
        assert_eq!(back, payload, "indirect blocks returned wrong data");
        env.close(fd);

        // Truncating on re-open releases the indirect chain too; the
        // file is empty afterwards.
        let fd = env.open("/big", OpenFlags::RDWR | OpenFlags::TRUNC);
        let st = env.fstat(fd).expect("fstat");
        assert_eq!(st.size, 0);
        env.close(fd);
        0
    });
    assert!(res.clean);
}

#[test]
fn cache_pressure_evicts_without_corruption() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        // More distinct blocks than the cache holds buffers, touched
        // twice: the second pass can only succeed through evictions.
        for round in 0..2 {
            for i in 0..40 {
                let path = format!("/blk_{}", i);
                let flags = if round == 0 {
                    OpenFlags::CREATE | OpenFlags::RDWR
                } else {
                    OpenFlags::empty()
                };
                let fd = env.open(&path, flags);
                assert!(fd >= 0);
                let record = format!("block file {:03}", i);
                if round == 0 {
                    assert_eq!(env.write(fd, record.as_bytes()), record.len() as i64);
                } else {
                    let mut buf = [0u8; 32];
                    let n = env.read(fd, &mut buf);
                    assert_eq!(&buf[..n as usize], record.as_bytes());
                }
                env.close(fd);
            }
        }
        0
    });
    assert!(res.clean);
}

#[test]
fn relogging_a_block_is_absorbed() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let kern = env.kernel().clone();
        let dev = hematite_kernel::param::ROOTDEV;

        kern.begin_op();
        // Pick a quiet data block far from the metadata.
        let blockno = kern.sb().bmapstart + 200;
        {
            let mut b = kern.bread(dev, blockno);
            b.write_at(0, b"one");
            kern.log_write(&b);
        }
        assert_eq!(kern.log_pending(), 1);
        {
            let mut b = kern.bread(dev, blockno);
            b.write_at(8, b"two");
            kern.log_write(&b);
        }
        // Same block logged again: absorbed, not appended.
        assert_eq!(kern.log_pending(), 1);
        kern.end_op();
        assert_eq!(kern.log_pending(), 0, "commit clears the header");
        0
    });
    assert!(res.clean);
}

#[test]
fn writes_beyond_one_transaction_split_and_commit() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let kern = env.kernel().clone();

        // A single oversized writei would overflow the log; the file
        // layer must split it. Exercise it through the syscall path and
        // verify nothing is pending afterwards.
        let payload = vec![0xabu8; 20 * BSIZE];
        let fd = env.open("/split", OpenFlags::CREATE | OpenFlags::RDWR);
        assert_eq!(env.write(fd, &payload), payload.len() as i64);
        env.close(fd);
        assert_eq!(kern.log_pending(), 0);

        let fd = env.open("/split", OpenFlags::empty());
        let mut back = vec![0u8; payload.len()];
        assert_eq!(env.read(fd, &mut back), payload.len() as i64);
        assert!(back.iter().all(|&b| b == 0xab));
        env.close(fd);
        0
    });
    assert!(res.clean);
}

#[test]
fn frames_balance_across_process_lifecycles() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let kern = env.kernel().clone();
        let kern_before = kern.pmem.free_count(Pool::Kernel);
        let user_before = kern.pmem.free_count(Pool::User);

        for round in 0..5 {
            let pid = env.fork(move |env| {
                // Touch some memory so the child owns real frames.
                let h = env.brk(0) as u64;
                env.brk(h + 3 * 4096);
                env.poke(h, round as u8);
                0
            });
            let (got, status) = env.wait();
            assert_eq!((got, status), (pid, 0));
        }

        // Every frame a child held came back to its pool.
        assert_eq!(kern.pmem.free_count(Pool::Kernel), kern_before);
        assert_eq!(kern.pmem.free_count(Pool::User), user_before);
        0
    });
    assert!(res.clean);
}

#[test]
fn directory_content_is_kernel_readable() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let kern = env.kernel().clone();
        assert_eq!(env.mkdir("/probe"), 0);
        let fd = env.open("/probe/x", OpenFlags::CREATE | OpenFlags::RDWR);
        env.close(fd);

        // Walk the directory with the inode layer directly.
        kern.begin_op();
        let ip = kern.namei(b"/probe").expect("namei");
        let mut g = kern.ilock(&ip);
        let (child, _off) = kern.dirlookup(&mut g, b"x").expect("dirlookup");
        assert!(kern.dirlookup(&mut g, b"missing").is_none());
        // Names are unique per directory.
        let dup = kern.dirlink(&mut g, b"x", child.inum);
        assert!(dup.is_err());
        drop(g);
        kern.iput(child);
        kern.iput(ip);
        kern.end_op();
        0
    });
    assert!(res.clean);
}

#[test]
fn kernel_side_writei_readi_roundtrip() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let kern = env.kernel().clone();
        let fd = env.open("/raw", OpenFlags::CREATE | OpenFlags::RDWR);
        env.close(fd);

        kern.begin_op();
        let ip = kern.namei(b"/raw").expect("namei");
        let mut g = kern.ilock(&ip);
        let n = kern
            .writei(&mut g, IoSrc::Kernel(b"kernel bytes"), 0)
            .expect("writei");
        assert_eq!(n, 12);
        drop(g);
        kern.iput(ip);
        kern.end_op();

        let fd = env.open("/raw", OpenFlags::empty());
        let mut buf = [0u8; 16];
        assert_eq!(env.read(fd, &mut buf), 12);
        assert_eq!(&buf[..12], b"kernel bytes");
        env.close(fd);
        0
    });
    assert!(res.clean);
}
