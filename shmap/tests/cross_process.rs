//! True multi-process tests: fork children that attach to the same map and
//! verify that every write is observed on the other side.

#![cfg(unix)]

use shmap::{CreateMode, MapOptions, PostcardCodec, PostcardMap};

/// `RUST_LOG=shmap=debug` makes failing runs narrate themselves.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn scratch(tag: &str) -> String {
    init_tracing();
    format!(
        "shmapipc_{tag}_{}_{:x}",
        std::process::id(),
        rand::random::<u32>()
    )
}

/// Fork a child; the closure runs in the child, which then exits cleanly.
/// A panic in the child aborts it with a non-zero status, which the parent
/// turns into a test failure.
fn fork_child(child: impl FnOnce()) -> libc::pid_t {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed"),
        0 => {
            child();
            std::process::exit(0);
        }
        pid => pid,
    }
}

fn wait_for_clean_exit(pid: libc::pid_t) {
    let mut status: i32 = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(waited, pid, "waitpid failed");
    assert!(
        libc::WIFEXITED(status),
        "child did not exit normally (status {status})"
    );
    assert_eq!(libc::WEXITSTATUS(status), 0, "child exited with failure");
}

#[test]
fn set_in_one_process_get_in_another() {
    let name = scratch("setget");
    let mut map: PostcardMap<String, String> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .open()
        .unwrap();

    map.set("1".into(), "1".into()).unwrap();
    map.set("k".into(), "v".into()).unwrap();

    let child_name = name.clone();
    let pid = fork_child(move || {
        let mut map: PostcardMap<String, String> = MapOptions::new()
            .name(&child_name)
            .create(CreateMode::Attach)
            .open()
            .unwrap();
        assert_eq!(map.get(&"1".into()).unwrap().as_deref(), Some("1"));
        assert_eq!(map.get(&"k".into()).unwrap().as_deref(), Some("v"));
        assert_eq!(map.len().unwrap(), 2);

        // Write back so the parent can verify the reverse direction.
        map.set("ack".into(), "from-child".into()).unwrap();
    });
    wait_for_clean_exit(pid);

    assert_eq!(map.get(&"ack".into()).unwrap().as_deref(), Some("from-child"));
    // Keys the child did not touch are unchanged.
    assert_eq!(map.get(&"k".into()).unwrap().as_deref(), Some("v"));
    assert_eq!(map.len().unwrap(), 3);
}

#[test]
fn overflow_converges_for_fresh_attachers() {
    let name = scratch("overflow");
    let mut map: PostcardMap<String, Vec<u8>> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .buffer_size(256)
        .open()
        .unwrap();

    let pid = {
        let child_name = name.clone();
        fork_child(move || {
            let mut map: PostcardMap<String, Vec<u8>> = MapOptions::new()
                .name(&child_name)
                .create(CreateMode::Attach)
                .open()
                .unwrap();
            for i in 0..10u8 {
                map.set(format!("key{i}"), vec![i; 64]).unwrap();
            }
        })
    };
    wait_for_clean_exit(pid);

    assert!(
        map.status().unwrap().full_dump_counter >= 1,
        "ten 64-byte records through a 256-byte buffer must dump"
    );
    for i in 0..10u8 {
        assert_eq!(map.get(&format!("key{i}")).unwrap(), Some(vec![i; 64]));
    }

    // A process that never saw the stream converges from the dump alone.
    let pid = fork_child(move || {
        let mut fresh: PostcardMap<String, Vec<u8>> = MapOptions::new()
            .name(&name)
            .create(CreateMode::Attach)
            .open()
            .unwrap();
        assert_eq!(fresh.len().unwrap(), 10);
        for i in 0..10u8 {
            assert_eq!(fresh.get(&format!("key{i}")).unwrap(), Some(vec![i; 64]));
        }
    });
    wait_for_clean_exit(pid);
}

#[test]
fn delete_is_observed_by_fresh_attacher() {
    let name = scratch("delete");
    let mut map: PostcardMap<String, i64> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .open()
        .unwrap();

    map.set("a".into(), 1).unwrap();
    map.set("b".into(), 2).unwrap();
    map.delete(&"a".into()).unwrap();

    let pid = fork_child(move || {
        let mut map: PostcardMap<String, i64> = MapOptions::new()
            .name(&name)
            .create(CreateMode::Attach)
            .open()
            .unwrap();
        assert_eq!(map.len().unwrap(), 1);
        assert_eq!(map.get(&"a".into()).unwrap(), None);
        assert_eq!(map.get(&"b".into()).unwrap(), Some(2));
    });
    wait_for_clean_exit(pid);
}

#[test]
fn concurrent_writers_lose_no_updates() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 50;

    let name = scratch("writers");
    let mut map: PostcardMap<String, u32> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .buffer_size(4096)
        .open()
        .unwrap();

    let pids: Vec<_> = (0..WRITERS)
        .map(|w| {
            let child_name = name.clone();
            fork_child(move || {
                let mut map: PostcardMap<String, u32> = MapOptions::new()
                    .name(&child_name)
                    .create(CreateMode::Attach)
                    .open()
                    .unwrap();
                for i in 0..PER_WRITER {
                    map.set(format!("w{w}-{i}"), (w * PER_WRITER + i) as u32)
                        .unwrap();
                }
            })
        })
        .collect();
    for pid in pids {
        wait_for_clean_exit(pid);
    }

    // No record lost, none duplicated, across dumps and streams.
    assert_eq!(map.len().unwrap(), WRITERS * PER_WRITER);
    for w in 0..WRITERS {
        for i in 0..PER_WRITER {
            assert_eq!(
                map.get(&format!("w{w}-{i}")).unwrap(),
                Some((w * PER_WRITER + i) as u32)
            );
        }
    }
}

#[test]
fn fast_lock_works_across_fork() {
    let name = scratch("fastlock");
    let mut map: PostcardMap<String, i64> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .open()
        .unwrap();
    map.set("seed".into(), 1).unwrap();

    let pid = fork_child(move || {
        let mut map: PostcardMap<String, i64> = MapOptions::new()
            .name(&name)
            .create(CreateMode::Attach)
            .open()
            .unwrap();
        assert_eq!(map.get(&"seed".into()).unwrap(), Some(1));
        map.set("child".into(), 2).unwrap();
    });
    wait_for_clean_exit(pid);

    assert_eq!(map.get(&"child".into()).unwrap(), Some(2));
}

#[test]
fn nested_child_map_updates_cross_processes() {
    let root_name = scratch("nested");
    let mut root: PostcardMap<String, i64> = MapOptions::new()
        .name(&root_name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .recurse(true)
        .open()
        .unwrap();

    // Materialize the child before forking so both sides agree on it.
    let mut child_map = root
        .child::<PostcardCodec<String, i64>>("n", PostcardCodec::default())
        .unwrap();
    child_map.set("c".into(), 0).unwrap();

    let pid = {
        let root_name = root_name.clone();
        fork_child(move || {
            let mut root: PostcardMap<String, i64> = MapOptions::new()
                .name(&root_name)
                .create(CreateMode::Attach)
                .open()
                .unwrap();
            let mut child = root
                .child::<PostcardCodec<String, i64>>("n", PostcardCodec::default())
                .unwrap();
            for _ in 0..5 {
                let current = child.get(&"c".into()).unwrap().unwrap();
                child.set("c".into(), current + 1).unwrap();
            }
        })
    };
    wait_for_clean_exit(pid);

    assert_eq!(child_map.get(&"c".into()).unwrap(), Some(5));
}
