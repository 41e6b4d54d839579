// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Real-time synchronization primitives and periodic tasks.
//!
//! One API over two backends, fixed at build time: POSIX threads with
//! kernel timers (default) or the Xenomai Alchemy skin (`alchemy` feature).
//!
//! Components:
//! - clock: monotonic/realtime time points and deadline conversion
//! - mutex/condvar: timed exclusive locking and wait/notify
//! - semaphore: counting semaphore with timed acquisition
//! - task: task lifecycle, scheduling hints, periodic release
//! - backend: native adapters behind one capability interface
//!
//! Every fallible operation comes in two forms. The `checked_*` form
//! returns an [`Error`]; the plain form raises (panics) on anything other
//! than a timeout, would-block, or interruption, which are always plain
//! `false`/`None` results.

#[macro_use]
mod error;

pub mod backend;
pub mod clock;
pub mod condvar;
pub mod mutex;
pub mod semaphore;
pub mod task;

pub use clock::{Clock, ClockId, Monotonic, Realtime, TimePoint, WaitClock};
pub use condvar::Condvar;
pub use error::{Error, Result};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use task::{this_task, CpuSet, SchedPolicy, Task, TaskOptions};
