// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! End-to-end smoke runs over the public API: tasks contending on a
//! semaphore, and a periodic loop measuring release latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use rtsync::{this_task, Clock, Monotonic, Semaphore, TaskOptions};

#[test]
fn semaphore_shared_by_three_tasks() {
    let sem = Arc::new(Semaphore::new(1));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..3 {
        let sem = sem.clone();
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let task = TaskOptions::new()
            .name(format!("sem-smoke-{}", i))
            .spawn(move || {
                for _ in 0..20 {
                    while !sem.wait() {}
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.post();
                }
            })
            .unwrap();
        tasks.push(task);
    }
    for mut t in tasks {
        t.join();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(sem.get_value(), 1);
}

#[derive(Debug, Default)]
struct Latency {
    cycles: u32,
    min: Duration,
    max: Duration,
    total: Duration,
    overrun_at: Option<u32>,
}

impl Latency {
    fn record(&mut self, late: Duration) {
        if self.cycles == 0 || late < self.min {
            self.min = late;
        }
        self.max = self.max.max(late);
        self.total += late;
        self.cycles += 1;
    }

    fn mean(&self) -> Duration {
        if self.cycles == 0 {
            Duration::ZERO
        } else {
            self.total / self.cycles
        }
    }
}

#[test]
fn periodic_loop_wakes_on_the_grid() {
    const CYCLES: u32 = 200;
    let period = Duration::from_millis(1);
    let (tx, rx) = mpsc::channel();

    let mut task = TaskOptions::new()
        .name("periodic-smoke")
        .spawn(move || {
            let start = Monotonic::now() + period * 5;
            this_task::set_periodic(start, period);

            let mut stats = Latency::default();
            let mut early = 0u32;
            while stats.cycles < CYCLES {
                let overruns = this_task::wait_period();
                let now = Monotonic::now();
                if overruns > 0 {
                    // Stop at the first overrun; earlier cycles still count.
                    stats.overrun_at = Some(stats.cycles);
                    break;
                }
                let due = start + period * stats.cycles;
                if now < due {
                    early += 1;
                }
                stats.record(now.duration_since(due));
            }
            tx.send((stats, early)).unwrap();
        })
        .unwrap();
    task.join();

    let (stats, early) = rx.recv().unwrap();
    eprintln!(
        "periodic smoke: {} cycles, latency min {:?} mean {:?} max {:?}, overrun at {:?}",
        stats.cycles,
        stats.min,
        stats.mean(),
        stats.max,
        stats.overrun_at
    );
    assert_eq!(early, 0, "released before the period boundary");
    assert!(stats.min <= stats.mean() && stats.mean() <= stats.max);
    if stats.overrun_at.is_none() {
        assert_eq!(stats.cycles, CYCLES);
    }
}
