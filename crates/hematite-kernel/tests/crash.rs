//! Write-ahead-log atomicity under crash injection.
//!
//! The block device persists only a bounded number of writes; whatever
//! the kernel believed afterwards, the surviving image must recover to
//! a state where the whole transaction happened or none of it did.

use hematite_kernel::file::OpenFlags;
use hematite_kernel::testing::{boot_fresh, boot_with_disk};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const OLD: &[u8; 16] = b"AAAAAAAAAAAAAAAA";
const NEW: &[u8; 16] = b"BBBBBBBBBBBBBBBB";

// Boot on the image and read /f back (recovery runs during mount).
fn read_file(disk: Vec<u8>) -> Vec<u8> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = out.clone();
    let (res, _m) = boot_with_disk(disk, move |env| {
        let fd = env.open("/f", OpenFlags::empty());
        if fd >= 0 {
            let mut buf = [0u8; 64];
            let n = env.read(fd, &mut buf);
            if n > 0 {
                sink.lock().unwrap().extend_from_slice(&buf[..n as usize]);
            }
            env.close(fd);
        }
        0
    });
    assert!(res.clean);
    let content = out.lock().unwrap().clone();
    content
}

fn overwrite_workload(limit: Option<u64>) -> impl FnOnce(&mut hematite_kernel::UserEnv) -> i32 {
    move |env| {
        if let Some(limit) = limit {
            // Fail-stop from here on: only `limit` more writes persist.
            env.kernel().machine.disk_set_write_limit(limit);
        }
        let fd = env.open("/f", OpenFlags::RDWR);
        if fd < 0 {
            return 1;
        }
        if env.write(fd, NEW) != NEW.len() as i64 {
            return 2;
        }
        env.close(fd);
        0
    }
}

#[test]
fn committed_updates_are_all_or_nothing_at_every_crash_point() {
    init_logging();

    // Base image: /f holds the old record.
    let (res, m) = boot_fresh(|env| {
        let fd = env.open("/f", OpenFlags::CREATE | OpenFlags::RDWR);
        assert!(fd >= 0);
        assert_eq!(env.write(fd, OLD), OLD.len() as i64);
        env.close(fd);
        0
    });
    assert!(res.clean);
    let base = m.disk_snapshot();

    // Reference run without a crash: count the writes the overwrite
    // takes and confirm it lands.
    let (res, m) = boot_with_disk(base.clone(), overwrite_workload(None));
    assert!(res.clean);
    let full_writes = m.disk_writes_persisted();
    assert_eq!(read_file(m.disk_snapshot()), NEW.to_vec());

    // Crash after every possible prefix of those writes.
    let mut saw_old = false;
    let mut saw_new = false;
    for limit in 0..full_writes {
        let (res, m) = boot_with_disk(base.clone(), overwrite_workload(Some(limit)));
        assert!(res.clean, "workload failed at limit {}", limit);
        let content = read_file(m.disk_snapshot());
        if content == OLD.to_vec() {
            saw_old = true;
        } else if content == NEW.to_vec() {
            saw_new = true;
        } else {
            panic!("limit {}: torn file content {:?}", limit, content);
        }
    }
    // The sweep crossed the commit point somewhere.
    assert!(saw_old, "no crash point preserved the old contents");
    assert!(saw_new, "no crash point carried the new contents");
}

#[test]
fn format_lost_before_the_superblock_is_redone_on_next_boot() {
    init_logging();
    // Nothing the format writes reaches the disk; the next boot finds a
    // blank image (no magic) and formats it again from scratch.
    let machine = hematite_machine::Machine::new(hematite_machine::MachineConfig {
        dram_bytes: 32 * 1024 * 1024,
        disk: vec![0; hematite_machine::DEFAULT_DISK_BYTES],
    })
    .unwrap();
    machine.disk_set_write_limit(0);
    let kernel = hematite_kernel::Kernel::new(machine.clone());
    let res = kernel.boot(Box::new(|_env: &mut hematite_kernel::UserEnv| 0)).wait();
    assert!(res.clean);

    // The next boot sees whatever survived and ends with a working
    // filesystem either way.
    let (res, _m) = boot_with_disk(machine.disk_snapshot(), |env| {
        let fd = env.open("/after", OpenFlags::CREATE | OpenFlags::RDWR);
        assert!(fd >= 0);
        assert_eq!(env.write(fd, b"ok"), 2);
        env.close(fd);
        0
    });
    assert!(res.clean);
}
