// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Contract violations end the process. Each test re-runs this test binary
//! filtered down to itself with `RTSYNC_ABORT_CASE` set; the child performs
//! the violation and the parent checks that it died with SIGABRT.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::mpsc;
use std::time::Duration;

use rtsync::{this_task, Clock, Monotonic, Task};

const CASE_VAR: &str = "RTSYNC_ABORT_CASE";

fn expect_abort(case: &str, violate: impl FnOnce()) {
    if std::env::var(CASE_VAR).as_deref() == Ok(case) {
        violate();
        return;
    }

    let out = Command::new(std::env::current_exe().unwrap())
        .args([case, "--exact", "--nocapture", "--test-threads=1"])
        .env(CASE_VAR, case)
        .output()
        .expect("failed to re-run test binary");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(
        out.status.signal(),
        Some(libc::SIGABRT),
        "{} did not abort: {:?}\nstderr: {}",
        case,
        out.status,
        stderr
    );
    assert!(stderr.contains("rtsync: fatal"), "stderr: {}", stderr);
}

#[test]
fn dropping_joinable_task() {
    expect_abort("dropping_joinable_task", || {
        let task = Task::new(|| {});
        drop(task);
    });
}

#[test]
fn panicking_task_body() {
    expect_abort("panicking_task_body", || {
        let mut task = Task::new(|| panic!("boom"));
        task.join();
    });
}

#[test]
fn wait_period_without_set_periodic() {
    expect_abort("wait_period_without_set_periodic", || {
        let mut task = Task::new(|| {
            this_task::wait_period();
        });
        task.join();
    });
}

#[test]
fn set_periodic_outside_a_task() {
    expect_abort("set_periodic_outside_a_task", || {
        this_task::set_periodic(Monotonic::now(), Duration::from_millis(1));
    });
}

#[test]
fn joining_twice() {
    expect_abort("joining_twice", || {
        let mut task = Task::new(|| {});
        task.join();
        task.join();
    });
}

#[test]
fn joining_from_inside_the_task() {
    expect_abort("joining_from_inside_the_task", || {
        let (tx, rx) = mpsc::channel::<Task>();
        let task = Task::new(move || {
            let mut me = rx.recv().unwrap();
            me.join();
        });
        tx.send(task).unwrap();
        // The task aborts the process; this only bounds a missed abort.
        std::thread::sleep(Duration::from_secs(10));
    });
}

#[test]
fn detaching_twice() {
    expect_abort("detaching_twice", || {
        let mut task = Task::new(|| {});
        task.detach();
        task.detach();
    });
}
