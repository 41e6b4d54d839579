// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Condition variable paired with [`Mutex`] on every wait.
//!
//! Waits release the guard's mutex for the blocking part only; it is held
//! again whenever a wait returns, including on timeout. A `false` return
//! means timeout or a retryable wakeup; callers loop on their predicate.

use std::fmt;
use std::time::Duration;

use crate::backend::{Backend, Native, RawCondvar};
use crate::clock::{Clock, TimePoint, WaitClock};
use crate::error::{OrRaise, Result};
use crate::mutex::MutexGuard;

type NativeCondvar = <Native as Backend>::Condvar;

pub struct Condvar {
    raw: NativeCondvar,
}

impl Condvar {
    #[track_caller]
    pub fn new() -> Self {
        Self::checked_new().or_raise()
    }

    pub fn checked_new() -> Result<Self> {
        Ok(Self {
            raw: NativeCondvar::new()?,
        })
    }

    /// Wake at most one waiter. Not remembered if nobody is waiting.
    #[track_caller]
    pub fn notify_one(&self) {
        self.checked_notify_one().or_raise()
    }

    pub fn checked_notify_one(&self) -> Result<()> {
        self.raw.notify_one()
    }

    /// Wake every current waiter.
    #[track_caller]
    pub fn notify_all(&self) {
        self.checked_notify_all().or_raise()
    }

    pub fn checked_notify_all(&self) -> Result<()> {
        self.raw.notify_all()
    }

    /// Block until notified. `false` on a retryable wakeup.
    #[track_caller]
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> bool {
        self.checked_wait(guard).or_raise()
    }

    pub fn checked_wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> Result<bool> {
        // The guard proves the caller holds this mutex.
        unsafe { self.raw.wait(guard.mutex().raw()) }
    }

    /// Block until notified or `deadline` passes. `false` on timeout or a
    /// retryable wakeup.
    #[track_caller]
    pub fn wait_until<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: TimePoint<WaitClock>,
    ) -> bool {
        self.checked_wait_until(guard, deadline).or_raise()
    }

    pub fn checked_wait_until<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: TimePoint<WaitClock>,
    ) -> Result<bool> {
        let ts = deadline.to_timespec();
        unsafe { self.raw.wait_until(guard.mutex().raw(), &ts) }
    }

    /// `wait_until(now + timeout)` on the wait clock.
    #[track_caller]
    pub fn wait_for<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.checked_wait_for(guard, timeout).or_raise()
    }

    pub fn checked_wait_for<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = WaitClock::checked_now()? + timeout;
        self.checked_wait_until(guard, deadline)
    }

    /// Wait until `condition` returns false, absorbing spurious and
    /// interrupted wakeups.
    #[track_caller]
    pub fn wait_while<T: ?Sized, F>(&self, guard: &mut MutexGuard<'_, T>, condition: F)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.checked_wait_while(guard, condition).or_raise()
    }

    pub fn checked_wait_while<T: ?Sized, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut condition: F,
    ) -> Result<()>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.checked_wait(guard)?;
        }
        Ok(())
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
