//! Process-core tests: fork/wait/exit, reparenting, kill, cooperative
//! scheduling across both harts.

use hematite_kernel::testing::boot_fresh;
use std::collections::HashSet;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn fork_child_prints_and_parent_reaps_it() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let pid = env.fork(|env| {
            env.print("child: hello\n");
            env.exit(1);
        });
        assert!(pid > 1);
        let (got, status) = env.wait();
        assert_eq!(got, pid);
        assert_eq!(status, 1);
        0
    });
    assert!(res.clean);
    assert!(res.console.contains("child: hello\n"));
}

#[test]
fn child_inherits_the_parents_memory_by_copy() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let h = env.brk(0) as u64;
        env.brk(h + 4096);
        assert!(env.poke(h, 77));

        let pid = env.fork(move |env| {
            // The child sees the parent's value...
            if env.peek(h) != Some(77) {
                return 10;
            }
            // ...but its writes are private.
            env.poke(h, 99);
            if env.peek(h) != Some(99) {
                return 11;
            }
            0
        });
        let (got, status) = env.wait();
        assert_eq!(got, pid);
        assert_eq!(status, 0);
        // Parent still sees its own copy.
        assert_eq!(env.peek(h), Some(77));
        0
    });
    assert!(res.clean);
}

#[test]
fn many_children_all_reaped_with_their_codes() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let mut pids = HashSet::new();
        for code in 10..15 {
            let pid = env.fork(move |_env| code);
            assert!(pids.insert(pid), "duplicate pid {}", pid);
        }
        let mut codes = HashSet::new();
        for _ in 0..5 {
            let (pid, status) = env.wait();
            assert!(pids.remove(&pid), "unknown child {}", pid);
            codes.insert(status);
        }
        assert_eq!(codes, (10..15).collect::<HashSet<i32>>());
        // No more children.
        let (none, _) = env.wait();
        assert_eq!(none, -1);
        0
    });
    assert!(res.clean);
}

#[test]
fn orphaned_grandchildren_are_reparented_to_init() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let child = env.fork(|env| {
            // The grandchild outlives its parent.
            env.fork(|env| {
                env.sleep(3);
                5
            });
            1
        });

        // Both the child and, after reparenting, the grandchild arrive
        // through init's wait.
        let mut statuses = Vec::new();
        let (p1, s1) = env.wait();
        assert!(p1 > 0);
        statuses.push(s1);
        let (p2, s2) = env.wait();
        assert!(p2 > 0 && p2 != p1);
        statuses.push(s2);
        statuses.sort_unstable();
        assert_eq!(statuses, vec![1, 5]);
        assert!(p1 == child || p2 == child);
        0
    });
    assert!(res.clean);
}

#[test]
fn kill_terminates_a_sleeping_process() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let pid = env.fork(|env| {
            // Sleeps forever; only kill gets it out.
            loop {
                env.sleep(1000);
            }
        });
        env.sleep(2);
        assert_eq!(env.kill(pid), 0);
        let (got, status) = env.wait();
        assert_eq!(got, pid);
        assert_eq!(status, -1, "killed processes exit with -1");
        // Killing a nonexistent pid fails.
        assert_eq!(env.kill(9999), -1);
        0
    });
    assert!(res.clean);
}

#[test]
fn yield_ping_pong_makes_progress() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        let a = env.fork(|env| {
            for _ in 0..100 {
                env.yield_now();
            }
            21
        });
        let b = env.fork(|env| {
            for _ in 0..100 {
                env.yield_now();
            }
            22
        });
        let (p1, s1) = env.wait();
        let (p2, s2) = env.wait();
        let mut got = vec![(p1, s1), (p2, s2)];
        got.sort_unstable();
        let mut want = vec![(a, 21), (b, 22)];
        want.sort_unstable();
        assert_eq!(got, want);
        0
    });
    assert!(res.clean);
}

#[test]
fn getpid_is_stable_and_distinct() {
    init_logging();
    let (res, _m) = boot_fresh(|env| {
        assert_eq!(env.getpid(), 1);
        let pid = env.fork(|env| env.getpid() as i32);
        let (got, status) = env.wait();
        assert_eq!(got, pid);
        assert_eq!(status as i64, pid);
        0
    });
    assert!(res.clean);
}
