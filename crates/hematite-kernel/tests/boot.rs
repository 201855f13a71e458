//! Boot-path smoke tests: console, pids, yield, ticks.

use hematite_kernel::testing::boot_fresh;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn boots_prints_and_shuts_down() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        assert_eq!(env.getpid(), 1);
        assert_eq!(env.print("hello, world\n"), 0);
        assert_eq!(env.yield_now(), 0);
        42
    });
    assert!(res.clean);
    assert_eq!(res.code, 42);
    assert!(res.console.contains("hello, world\n"));
}

#[test]
fn ticks_advance_and_sleep_blocks() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let t0 = env.getticks();
        assert!(t0 >= 0);
        assert_eq!(env.sleep(3), 0);
        let t1 = env.getticks();
        assert!(t1 >= t0 + 3, "slept from {} to {}", t0, t1);
        0
    });
    assert!(res.clean);
}

#[test]
fn unknown_syscall_returns_minus_one() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        assert_eq!(env.syscall(999, &[]), -1);
        assert_eq!(env.syscall(0, &[]), -1);
        0
    });
    assert!(res.clean);
}

#[test]
fn long_prints_are_bounded() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        // Strings are cut at the kernel's copy bound, not faulted on.
        let long = "x".repeat(1000);
        assert_eq!(env.print(&long), 0);
        0
    });
    assert!(res.clean);
    // 256-byte staging buffer, NUL-truncated.
    assert!(res.console.matches('x').count() == 255);
}
