// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Backend capability interface.
//!
//! The public primitives hold one native object each and delegate to it.
//! Which implementation sits behind [`Native`] is decided at build time:
//!
//! - `posix`: pthread mutex/condvar, POSIX semaphores, std threads with
//!   `pthread_setschedparam`, `timerfd` periodic timers (default)
//! - `alchemy`: Xenomai Alchemy skin (`alchemy` feature)
//!
//! All raw operations report timeouts, would-block and interrupted waits
//! as `Ok(false)`; everything else is an [`Error`](crate::Error).

use crate::clock::{Clock, ClockId, TimePoint};
use crate::error::Result;
use crate::task::TaskOptions;

#[cfg(not(feature = "alchemy"))]
mod posix;
#[cfg(not(feature = "alchemy"))]
pub use posix::Posix as Native;

#[cfg(feature = "alchemy")]
mod alchemy;
#[cfg(feature = "alchemy")]
pub use alchemy::Alchemy as Native;

/// Type-erased unit of work handed to a new execution context. Invoked
/// exactly once.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// One scheduling backend: a family of native primitives.
pub trait Backend: 'static {
    type Mutex: RawMutex;
    type Condvar: RawCondvar<Mutex = Self::Mutex>;
    type Semaphore: RawSemaphore;
    type Thread: RawThread;
    type Timer: RawTimer;

    /// Clock accepted by mutex and condition variable timed waits.
    type WaitClock: Clock;

    const NAME: &'static str;
}

/// Clocks the active backend accepts for semaphore deadlines.
pub trait SemaphoreClock: Clock {}

/// Clocks the active backend can drive periodic release from.
pub trait PeriodicClock: Clock {}

/// A native exclusive lock. Must not move once created, so
/// implementations keep the native object boxed.
pub trait RawMutex: Send + Sync + Sized {
    fn new() -> Result<Self>;

    fn lock(&self) -> Result<()>;

    /// `Ok(false)` when another holder has it.
    fn try_lock(&self) -> Result<bool>;

    /// `Ok(false)` when the deadline (on the backend's wait clock) passed.
    fn try_lock_until(&self, deadline: &libc::timespec) -> Result<bool>;

    /// # Safety
    ///
    /// The calling context must hold the lock.
    unsafe fn unlock(&self) -> Result<()>;
}

/// A native wait queue, paired with the backend's mutex on each wait.
pub trait RawCondvar: Send + Sync + Sized {
    type Mutex: RawMutex;

    fn new() -> Result<Self>;

    fn notify_one(&self) -> Result<()>;

    fn notify_all(&self) -> Result<()>;

    /// `Ok(false)` on a retryable wakeup.
    ///
    /// # Safety
    ///
    /// The calling context must hold `mutex`; it is held again on return.
    unsafe fn wait(&self, mutex: &Self::Mutex) -> Result<bool>;

    /// `Ok(false)` on timeout or a retryable wakeup.
    ///
    /// # Safety
    ///
    /// Same as [`RawCondvar::wait`].
    unsafe fn wait_until(&self, mutex: &Self::Mutex, deadline: &libc::timespec) -> Result<bool>;
}

/// A native counting semaphore.
pub trait RawSemaphore: Send + Sync + Sized {
    fn new(initial: u32) -> Result<Self>;

    fn post(&self) -> Result<()>;

    /// `Ok(false)` when interrupted before a unit became available.
    fn wait(&self) -> Result<bool>;

    /// `Ok(false)` when the count is zero.
    fn try_wait(&self) -> Result<bool>;

    /// `Ok(false)` on timeout or interruption.
    fn wait_until<C: SemaphoreClock>(&self, deadline: TimePoint<C>) -> Result<bool>;

    /// The native count. Some natives go negative to encode waiters.
    fn value(&self) -> Result<i64>;
}

/// A native execution context.
pub trait RawThread: Send + Sized {
    /// Create and start a context running `work`. Scheduling hints from
    /// `options` are in effect before `work` begins.
    fn spawn(options: &TaskOptions, work: Work) -> Result<Self>;

    fn join(self) -> Result<()>;

    fn detach(self) -> Result<()>;

    /// Whether the caller is running on this context.
    fn is_current(&self) -> bool;

    fn yield_now() -> Result<()>;
}

/// A periodic release source bound to the context that created it.
pub trait RawTimer: Sized {
    fn new(clock: ClockId) -> Result<Self>;

    fn clock(&self) -> ClockId;

    /// First release at `start` (absolute, on `clock()`), then every `period`.
    fn arm(&mut self, start: &libc::timespec, period: &libc::timespec) -> Result<()>;

    /// Block until the next release. Returns how many releases were missed
    /// since the previous call.
    fn wait(&mut self) -> Result<u64>;
}
