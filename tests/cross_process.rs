//! Locking and ledger guarantees between real OS processes.
//!
//! Each test re-runs this test binary filtered to itself, with an env var
//! telling the child which role to play.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use pmr::ledger::CreationLedger;
use pmr::lock::FileLock;

const ROLE_ENV: &str = "PMR_CROSS_PROCESS_ROLE";
const TARGET_ENV: &str = "PMR_CROSS_PROCESS_TARGET";
const WRITER_ENV: &str = "PMR_CROSS_PROCESS_WRITER";
const READY_ENV: &str = "PMR_CROSS_PROCESS_READY";
const RELEASE_ENV: &str = "PMR_CROSS_PROCESS_RELEASE";

const PER_WRITER: usize = 50;

fn maybe_run_child() {
    let role = match env::var(ROLE_ENV) {
        Ok(role) => role,
        Err(_) => return,
    };

    let target = PathBuf::from(env::var(TARGET_ENV).expect("child missing target path"));
    match role.as_str() {
        "append" => {
            let writer = env::var(WRITER_ENV).expect("child missing writer name");
            let ledger = CreationLedger::new(&target);
            for i in 0..PER_WRITER {
                ledger.append(&format!("{writer}-{i}")).expect("child append failed");
            }
            std::process::exit(0);
        }
        "hold" => {
            let _guard = FileLock::new(&target).acquire().expect("child failed to lock");
            fs::write(env::var(READY_ENV).expect("child missing ready path"), "ready")
                .expect("child failed to write ready file");
            let release = PathBuf::from(env::var(RELEASE_ENV).expect("child missing release path"));
            let start = Instant::now();
            while !release.exists() && start.elapsed() < Duration::from_secs(20) {
                thread::sleep(Duration::from_millis(20));
            }
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown role: {other}");
            std::process::exit(4);
        }
    }
}

fn spawn_child(test: &str, role: &str, target: &Path) -> Command {
    let mut command = Command::new(env::current_exe().expect("test executable"));
    command
        .args(["--exact", test, "--nocapture"])
        .env(ROLE_ENV, role)
        .env(TARGET_ENV, target);
    command
}

fn wait_for_file(path: &Path, child: &mut Child) {
    let start = Instant::now();
    while !path.exists() {
        if let Some(status) = child.try_wait().expect("failed to poll child") {
            panic!("lock holder exited early: {status}");
        }
        if start.elapsed() > Duration::from_secs(10) {
            panic!("timed out waiting for {}", path.display());
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn ledger_appends_from_child_processes_are_not_lost() {
    maybe_run_child();

    let dir = tempdir().unwrap();
    let path = dir.path().join("pmr.json");

    let children: Vec<Child> = ["first", "second"]
        .into_iter()
        .map(|writer| {
            spawn_child("ledger_appends_from_child_processes_are_not_lost", "append", &path)
                .env(WRITER_ENV, writer)
                .spawn()
                .expect("failed to spawn writer")
        })
        .collect();

    let ledger = CreationLedger::new(&path);
    for i in 0..PER_WRITER {
        ledger.append(&format!("parent-{i}")).unwrap();
    }

    for mut child in children {
        let status = child.wait().unwrap();
        assert!(status.success(), "writer exited with {status}");
    }

    let ids = ledger.read().unwrap();
    assert_eq!(ids.len(), 3 * PER_WRITER);
    for writer in ["first", "second", "parent"] {
        let mine: Vec<_> = ids.iter().filter(|id| id.starts_with(writer)).cloned().collect();
        let expected: Vec<_> = (0..PER_WRITER).map(|i| format!("{writer}-{i}")).collect();
        assert_eq!(mine, expected);
    }
}

#[test]
fn creation_lock_held_by_child_process_excludes_parent() {
    maybe_run_child();

    let dir = tempdir().unwrap();
    let lock_path = dir.path().join("pmr_create_container_5532.lock");
    let ready = dir.path().join("ready");
    let release = dir.path().join("release");

    let mut holder = spawn_child(
        "creation_lock_held_by_child_process_excludes_parent",
        "hold",
        &lock_path,
    )
    .env(READY_ENV, &ready)
    .env(RELEASE_ENV, &release)
    .spawn()
    .expect("failed to spawn lock holder");

    wait_for_file(&ready, &mut holder);
    let lock = FileLock::new(&lock_path);
    assert!(lock.try_acquire().unwrap().is_none());

    fs::write(&release, "release").unwrap();
    let status = holder.wait().unwrap();
    assert!(status.success(), "lock holder exited with {status}");

    assert!(lock.try_acquire().unwrap().is_some());
}
