// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Operations on the calling task.
//!
//! The task trampoline installs a context-local record before the work
//! closure runs and removes it afterwards. Only code running on that
//! context ever sees it, so periodic state needs no locking.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::TaskInfo;
use crate::backend::{Backend, Native, PeriodicClock, RawThread, RawTimer, Work};
use crate::clock::{duration_to_timespec, TimePoint};
use crate::error::{Error, OrRaise, Result};

type NativeTimer = <Native as Backend>::Timer;
type NativeThread = <Native as Backend>::Thread;

struct Current {
    info: Arc<TaskInfo>,
    timer: Option<NativeTimer>,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Wrap a task's work with the current-task record and the panic guard.
pub(super) fn entry(info: Arc<TaskInfo>, work: Work) -> Work {
    Box::new(move || {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = Some(Current {
                info: info.clone(),
                timer: None,
            });
        });
        log::debug!("task {} started", info);

        if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
            fatal!("task {} panicked; task bodies must not unwind", info);
        }

        // Drops the periodic timer, if any, on the context that owns it.
        CURRENT.with(|cell| cell.borrow_mut().take());
        log::debug!("task {} finished", info);
    })
}

fn with_current<R>(op: &str, f: impl FnOnce(&mut Current) -> R) -> R {
    CURRENT.with(|cell| match cell.borrow_mut().as_mut() {
        Some(current) => f(current),
        None => fatal!("{} called outside of a task", op),
    })
}

/// Whether the caller is running inside a [`Task`](super::Task).
pub fn is_task() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}

/// Name of the calling task, if it is a task and has one.
pub fn name() -> Option<String> {
    CURRENT.with(|cell| cell.borrow().as_ref().and_then(|c| c.info.name.clone()))
}

/// Id of the calling task, or `None` outside of tasks.
pub fn id() -> Option<u64> {
    CURRENT.with(|cell| cell.borrow().as_ref().map(|c| c.info.id))
}

/// Make the calling task periodic: first release at `start`, then one
/// every `period`.
#[track_caller]
pub fn set_periodic<C: PeriodicClock>(start: TimePoint<C>, period: Duration) {
    checked_set_periodic(start, period).or_raise()
}

/// Arm (or re-arm) the calling task's periodic timer.
///
/// A timer on the same clock is reused; switching clocks replaces it.
/// Aborts when called outside of a task.
pub fn checked_set_periodic<C: PeriodicClock>(start: TimePoint<C>, period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(Error::ZeroPeriod);
    }
    with_current("set_periodic", |current| {
        let reuse = matches!(&current.timer, Some(timer) if timer.clock() == C::ID);
        if !reuse {
            // Tear down the old timer before creating its replacement.
            current.timer.take();
            current.timer = Some(NativeTimer::new(C::ID)?);
        }
        if let Some(timer) = current.timer.as_mut() {
            timer.arm(&start.to_timespec(), &duration_to_timespec(period))?;
        }
        log::debug!(
            "task {} periodic on {:?}: start {} ns, period {:?}",
            current.info,
            C::ID,
            start.as_nanos(),
            period
        );
        Ok(())
    })
}

/// Block until the next release. Returns the overrun count: 0 when on
/// time, N when N releases were missed since the previous call.
#[track_caller]
pub fn wait_period() -> u64 {
    checked_wait_period().or_raise()
}

/// Aborts when called outside of a task or before `set_periodic`.
pub fn checked_wait_period() -> Result<u64> {
    with_current("wait_period", |current| {
        let Some(timer) = current.timer.as_mut() else {
            fatal!("wait_period on task {} which is not periodic", current.info);
        };
        let overruns = timer.wait()?;
        if overruns > 0 {
            log::trace!("task {} overran by {} period(s)", current.info, overruns);
        }
        Ok(overruns)
    })
}

/// Give up the processor to another ready context.
#[track_caller]
pub fn yield_now() {
    checked_yield_now().or_raise()
}

pub fn checked_yield_now() -> Result<()> {
    NativeThread::yield_now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, Monotonic};
    #[cfg(not(feature = "alchemy"))]
    use crate::clock::Realtime;
    use crate::task::Task;
    use std::sync::mpsc;

    #[test]
    fn main_thread_is_not_a_task() {
        assert!(!is_task());
        assert_eq!(name(), None);
        assert_eq!(id(), None);
    }

    #[test]
    fn inside_a_task() {
        let (tx, rx) = mpsc::channel();
        let mut t = Task::new(move || tx.send(is_task()).unwrap());
        t.join();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn zero_period_is_rejected() {
        let (tx, rx) = mpsc::channel();
        let mut t = Task::new(move || {
            let res = checked_set_periodic(Monotonic::now(), Duration::ZERO);
            tx.send(matches!(res, Err(Error::ZeroPeriod))).unwrap();
        });
        t.join();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn releases_follow_the_grid() {
        let (tx, rx) = mpsc::channel();
        let mut t = Task::new(move || {
            let period = Duration::from_millis(5);
            let start = Monotonic::now() + period;
            set_periodic(start, period);
            let mut late = Vec::new();
            for n in 0..10u32 {
                let overruns = wait_period();
                let now = Monotonic::now();
                late.push((now >= start + period * n, overruns));
            }
            tx.send(late).unwrap();
        });
        t.join();
        for (on_or_after_release, _) in rx.recv().unwrap() {
            assert!(on_or_after_release);
        }
    }

    #[test]
    fn rearm_on_same_clock_moves_the_grid() {
        let (tx, rx) = mpsc::channel();
        let mut t = Task::new(move || {
            let period = Duration::from_millis(2);
            set_periodic(Monotonic::now(), period);
            wait_period();

            let later = Monotonic::now() + Duration::from_millis(20);
            set_periodic(later, period);
            let overruns = wait_period();
            tx.send((Monotonic::now() >= later, overruns)).unwrap();
        });
        t.join();
        assert_eq!(rx.recv().unwrap(), (true, 0));
    }

    #[cfg(not(feature = "alchemy"))]
    #[test]
    fn rearm_on_other_clock() {
        let (tx, rx) = mpsc::channel();
        let mut t = Task::new(move || {
            let period = Duration::from_millis(2);
            set_periodic(Monotonic::now(), period);
            wait_period();
            set_periodic(Realtime::now() + period, period);
            let before = Realtime::now();
            wait_period();
            tx.send(Realtime::now() >= before).unwrap();
        });
        t.join();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn yield_works_anywhere() {
        yield_now();
        let mut t = Task::new(yield_now);
        t.join();
    }
}
