// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Overrun accounting: a task that stalls past several releases gets the
//! missed count from its next `wait_period`, then falls back onto the
//! original release grid.

use std::sync::mpsc;
use std::time::Duration;

use rtsync::{this_task, Clock, Monotonic, Task};

#[test]
fn stall_is_counted_and_grid_recovers() {
    const AFTER_STALL: u32 = 5;
    let period = Duration::from_millis(20);
    let (tx, rx) = mpsc::channel();

    let mut task = Task::new(move || {
        let start = Monotonic::now() + period;
        this_task::set_periodic(start, period);

        let first = this_task::wait_period();

        // Stall for 3.5 periods: releases 1, 2 and 3 pass while asleep.
        std::thread::sleep(period * 7 / 2);
        let stalled = this_task::wait_period();

        let mut after = Vec::new();
        for _ in 0..AFTER_STALL {
            let overruns = this_task::wait_period();
            after.push((overruns, Monotonic::now()));
        }
        tx.send((start, first, stalled, after)).unwrap();
    });
    task.join();

    let (start, first, stalled, after) = rx.recv().unwrap();
    assert_eq!(first, 0);
    assert_eq!(stalled, 2, "a 3.5 period stall misses exactly 2 releases");

    // Back on the original grid: release 4 + k, not a grid shifted by the
    // stall.
    let slack = period.as_nanos() as i64 / 2;
    for (k, (overruns, woke)) in after.into_iter().enumerate() {
        let due = start + period * (4 + k as u32);
        assert_eq!(overruns, 0, "release {} reported overruns", 4 + k);
        let late = woke.nanos_since(due);
        assert!(late >= 0, "woke {} ns before release {}", -late, 4 + k);
        assert!(late < slack, "woke {} ns after release {}", late, 4 + k);
    }
}

#[test]
fn on_time_waits_report_zero() {
    let period = Duration::from_millis(20);
    let (tx, rx) = mpsc::channel();

    let mut task = Task::new(move || {
        this_task::set_periodic(Monotonic::now() + period, period);
        let counts: Vec<u64> = (0..3).map(|_| this_task::wait_period()).collect();
        tx.send(counts).unwrap();
    });
    task.join();

    assert_eq!(rx.recv().unwrap(), vec![0, 0, 0]);
}
