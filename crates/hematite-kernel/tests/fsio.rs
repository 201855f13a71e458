//! Filesystem end-to-end tests driven through the syscall surface:
//! create/write/read cycles, directories, links, inode lifetimes, and
//! persistence across reboots.

use hematite_kernel::file::OpenFlags;
use hematite_kernel::testing::{boot_fresh, boot_with_disk};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn rdwr() -> OpenFlags {
    OpenFlags::CREATE | OpenFlags::RDWR
}

#[test]
fn hello_fs_write_close_reopen_read() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let fd = env.open("/test", rdwr());
        assert!(fd >= 0);
        assert_eq!(env.write(fd, b"Hello FS"), 8);
        assert_eq!(env.close(fd), 0);

        let fd = env.open("/test", OpenFlags::empty());
        assert!(fd >= 0);
        let mut buf = [0u8; 20];
        let n = env.read(fd, &mut buf);
        assert_eq!(n, 8, "read past EOF returns the available bytes");
        assert_eq!(&buf[..8], b"Hello FS");
        assert_eq!(env.close(fd), 0);
        0
    });
    assert!(res.clean);
}

#[test]
fn thirty_small_files_then_one_large_file() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        for i in 0..30 {
            let path = format!("/small_{:02}", i);
            let fd = env.open(&path, rdwr());
            assert!(fd >= 0, "create {} failed", path);
            assert_eq!(env.write(fd, b"test"), 4);
            assert_eq!(env.close(fd), 0);
        }

        let payload = vec![b'L'; 20 * 512];
        let fd = env.open("/large_file", rdwr());
        assert!(fd >= 0);
        assert_eq!(env.write(fd, &payload), payload.len() as i64);
        assert_eq!(env.close(fd), 0);

        // Everything reads back exactly.
        for i in 0..30 {
            let path = format!("/small_{:02}", i);
            let fd = env.open(&path, OpenFlags::empty());
            assert!(fd >= 0);
            let mut buf = [0u8; 8];
            assert_eq!(env.read(fd, &mut buf), 4);
            assert_eq!(&buf[..4], b"test");
            env.close(fd);
        }
        let fd = env.open("/large_file", OpenFlags::empty());
        let mut back = vec![0u8; payload.len() + 16];
        let n = env.read(fd, &mut back);
        assert_eq!(n as usize, payload.len());
        assert_eq!(&back[..payload.len()], &payload[..]);
        env.close(fd);
        0
    });
    assert!(res.clean);
}

#[test]
fn files_survive_a_reboot() {
    init_logging();
    let (res, m) = boot_fresh(|env| {
        let fd = env.open("/persist", rdwr());
        assert!(fd >= 0);
        assert_eq!(env.write(fd, b"durable bytes"), 13);
        env.close(fd);
        0
    });
    assert!(res.clean);

    let disk = m.disk_snapshot();
    let (res, _m) = boot_with_disk(disk, |env| {
        let fd = env.open("/persist", OpenFlags::empty());
        assert!(fd >= 0, "file lost across reboot");
        let mut buf = [0u8; 32];
        assert_eq!(env.read(fd, &mut buf), 13);
        assert_eq!(&buf[..13], b"durable bytes");
        env.close(fd);
        0
    });
    assert!(res.clean);
}

#[test]
fn link_unlink_and_fstat() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let fd = env.open("/a", rdwr());
        assert_eq!(env.write(fd, b"payload"), 7);
        env.close(fd);

        assert_eq!(env.link("/a", "/b"), 0);
        let fd = env.open("/a", OpenFlags::empty());
        let st = env.fstat(fd).expect("fstat");
        assert_eq!(st.nlink, 2);
        assert_eq!(st.size, 7);
        env.close(fd);

        assert_eq!(env.unlink("/a"), 0);
        assert_eq!(env.open("/a", OpenFlags::empty()), -1);

        // Content still reachable through the second name.
        let fd = env.open("/b", OpenFlags::empty());
        assert!(fd >= 0);
        let st = env.fstat(fd).expect("fstat");
        assert_eq!(st.nlink, 1);
        let mut buf = [0u8; 16];
        assert_eq!(env.read(fd, &mut buf), 7);
        assert_eq!(&buf[..7], b"payload");
        env.close(fd);

        // Linking a directory is refused.
        assert_eq!(env.mkdir("/d"), 0);
        assert_eq!(env.link("/d", "/d2"), -1);
        0
    });
    assert!(res.clean);
}

#[test]
fn unlinked_file_lives_until_last_close() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let fd = env.open("/victim", rdwr());
        assert_eq!(env.write(fd, b"still here"), 10);

        assert_eq!(env.unlink("/victim"), 0);
        assert_eq!(env.open("/victim", OpenFlags::empty()), -1);

        // The open descriptor still reaches the content.
        let st = env.fstat(fd).expect("fstat");
        assert_eq!(st.nlink, 0);
        assert_eq!(st.size, 10);
        env.close(fd);

        // After the last reference the name and inode are both gone;
        // recreating starts fresh.
        let fd = env.open("/victim", rdwr());
        let st = env.fstat(fd).expect("fstat");
        assert_eq!(st.size, 0);
        env.close(fd);
        0
    });
    assert!(res.clean);
}

#[test]
fn dup_shares_the_offset() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let fd = env.open("/dup", rdwr());
        assert_eq!(env.write(fd, b"abcdef"), 6);
        env.close(fd);

        let fd = env.open("/dup", OpenFlags::empty());
        let fd2 = env.dup(fd);
        assert!(fd2 >= 0 && fd2 != fd);

        let mut buf = [0u8; 2];
        assert_eq!(env.read(fd, &mut buf), 2);
        assert_eq!(&buf, b"ab");
        // The duplicate continues where the original stopped.
        assert_eq!(env.read(fd2, &mut buf), 2);
        assert_eq!(&buf, b"cd");
        env.close(fd);
        // Still open through fd2.
        assert_eq!(env.read(fd2, &mut buf), 2);
        assert_eq!(&buf, b"ef");
        env.close(fd2);
        0
    });
    assert!(res.clean);
}

#[test]
fn directories_nest_and_refuse_bad_operations() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        assert_eq!(env.mkdir("/dir"), 0);
        assert_eq!(env.mkdir("/dir"), -1, "mkdir over an existing name");

        let fd = env.open("/dir/file", rdwr());
        assert!(fd >= 0);
        assert_eq!(env.write(fd, b"nested"), 6);
        env.close(fd);

        // A populated directory cannot be unlinked.
        assert_eq!(env.unlink("/dir"), -1);
        assert_eq!(env.unlink("/dir/file"), 0);
        assert_eq!(env.unlink("/dir"), 0);
        assert_eq!(env.open("/dir/file", OpenFlags::empty()), -1);

        // Path resolution demands directories along the way.
        let fd = env.open("/plain", rdwr());
        env.close(fd);
        assert_eq!(env.open("/plain/below", OpenFlags::empty()), -1);

        // Directories cannot be opened for writing.
        assert_eq!(env.open("/", OpenFlags::WRONLY), -1);
        assert_eq!(env.open("/missing", OpenFlags::empty()), -1);
        0
    });
    assert!(res.clean);
}
