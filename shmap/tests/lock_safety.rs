//! Inter-process lock properties: mutual exclusion under contention and
//! takeover of a lock whose holder died without releasing.

#![cfg(unix)]

use std::time::Duration;

use shmap::{CreateMode, Error, LockError, MapOptions, PostcardMap, SharedSegment};

fn scratch(tag: &str) -> String {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    format!(
        "shmaplock_{tag}_{}_{:x}",
        std::process::id(),
        rand::random::<u32>()
    )
}

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
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    assert_eq!(libc::WEXITSTATUS(status), 0, "child exited with failure");
}

#[test]
fn lock_left_by_dead_process_can_be_stolen() {
    let name = scratch("steal");
    let mut map: PostcardMap<String, i64> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .open()
        .unwrap();

    let holder = {
        let name = name.clone();
        fork_child(move || {
            let mut map: PostcardMap<String, i64> = MapOptions::new()
                .name(&name)
                .create(CreateMode::Attach)
                .open()
                .unwrap();
            map.acquire_lock(true, None, false).unwrap();
            // Exit without releasing; the lock word keeps our PID.
            std::mem::forget(map);
        })
    };
    wait_for_clean_exit(holder);

    assert_ne!(map.locked_by(), 0, "dead holder's PID must still be visible");

    // Without stealing, a bounded acquire times out.
    match map.acquire_lock(true, Some(Duration::from_millis(200)), false) {
        Err(Error::Lock(LockError::Timeout { .. })) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }

    // With steal_after_timeout the takeover succeeds.
    map.acquire_lock(true, Some(Duration::from_millis(200)), true)
        .unwrap();
    assert_eq!(map.locked_by(), std::process::id());
    assert!(map.release_lock());

    // The map is writable again after the takeover.
    map.set("recovered".into(), 1).unwrap();
    assert_eq!(map.get(&"recovered".into()).unwrap(), Some(1));
}

#[test]
fn critical_sections_are_mutually_exclusive_across_processes() {
    const PROCESSES: usize = 4;
    const ROUNDS: usize = 200;

    let name = scratch("mutex");
    let map: PostcardMap<String, i64> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .open()
        .unwrap();

    // A side segment holding one counter the children bump inside the
    // critical section. Any overlap makes the fetch_add observe nonzero.
    let counter_name = scratch("counter");
    let counter_seg = SharedSegment::create(&counter_name, 64).unwrap();

    let pids: Vec<_> = (0..PROCESSES)
        .map(|_| {
            let name = name.clone();
            let counter_name = counter_name.clone();
            fork_child(move || {
                use std::sync::atomic::{AtomicU32, Ordering};

                let mut map: PostcardMap<String, i64> = MapOptions::new()
                    .name(&name)
                    .create(CreateMode::Attach)
                    .open()
                    .unwrap();
                let seg = SharedSegment::attach(&counter_name).unwrap();
                let region = seg.region();
                let inside: &AtomicU32 = unsafe { region.get::<AtomicU32>(0) };

                for _ in 0..ROUNDS {
                    map.acquire_lock(true, None, false).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    assert!(map.release_lock());
                }
            })
        })
        .collect();
    for pid in pids {
        wait_for_clean_exit(pid);
    }

    SharedSegment::unlink_by_name(&counter_name, true).unwrap();
    drop(map);
}

#[test]
fn nonblocking_acquire_reports_the_holder_pid() {
    let name = scratch("holder");
    let mut map: PostcardMap<String, i64> = MapOptions::new()
        .name(&name)
        .create(CreateMode::Create)
        .shared_lock(true)
        .open()
        .unwrap();

    map.acquire_lock(true, None, false).unwrap();

    let pid = {
        let name = name.clone();
        fork_child(move || {
            let mut map: PostcardMap<String, i64> = MapOptions::new()
                .name(&name)
                .create(CreateMode::Attach)
                .open()
                .unwrap();
            match map.acquire_lock(false, None, false) {
                Err(Error::Lock(LockError::CannotAcquire { blocking_pid })) => {
                    assert_eq!(blocking_pid, unsafe { libc::getppid() } as u32);
                }
                other => panic!("expected CannotAcquire, got {other:?}"),
            }
            std::mem::forget(map);
        })
    };
    wait_for_clean_exit(pid);

    assert!(map.release_lock());
}
