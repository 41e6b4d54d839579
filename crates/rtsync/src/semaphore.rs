// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphore.
//!
//! Unlike a condition variable notification, a `post` is never lost: the
//! count remembers it until someone waits.

use std::fmt;
use std::time::Duration;

use crate::backend::{Backend, Native, RawSemaphore, SemaphoreClock};
use crate::clock::{Clock, TimePoint, WaitClock};
use crate::error::{OrRaise, Result};

type NativeSemaphore = <Native as Backend>::Semaphore;

pub struct Semaphore {
    raw: NativeSemaphore,
}

impl Semaphore {
    /// Create a semaphore holding `initial` units.
    #[track_caller]
    pub fn new(initial: u32) -> Self {
        Self::checked_new(initial).or_raise()
    }

    pub fn checked_new(initial: u32) -> Result<Self> {
        Ok(Self {
            raw: NativeSemaphore::new(initial)?,
        })
    }

    /// Add one unit, waking one blocked waiter if there is one.
    #[track_caller]
    pub fn post(&self) {
        self.checked_post().or_raise()
    }

    pub fn checked_post(&self) -> Result<()> {
        self.raw.post()
    }

    /// Take one unit, blocking while there are none. `false` if a signal
    /// interrupted the wait before a unit was taken.
    #[track_caller]
    pub fn wait(&self) -> bool {
        self.checked_wait().or_raise()
    }

    pub fn checked_wait(&self) -> Result<bool> {
        self.raw.wait()
    }

    /// Take one unit if one is available right now.
    #[track_caller]
    pub fn try_wait(&self) -> bool {
        self.checked_try_wait().or_raise()
    }

    pub fn checked_try_wait(&self) -> Result<bool> {
        self.raw.try_wait()
    }

    /// Take one unit unless `deadline` passes first.
    #[track_caller]
    pub fn wait_until<C: SemaphoreClock>(&self, deadline: TimePoint<C>) -> bool {
        self.checked_wait_until(deadline).or_raise()
    }

    pub fn checked_wait_until<C: SemaphoreClock>(&self, deadline: TimePoint<C>) -> Result<bool> {
        self.raw.wait_until(deadline)
    }

    /// `wait_until(now + timeout)` on the wait clock.
    #[track_caller]
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.checked_wait_for(timeout).or_raise()
    }

    pub fn checked_wait_for(&self, timeout: Duration) -> Result<bool> {
        let deadline = WaitClock::checked_now()? + timeout;
        self.raw.wait_until(deadline)
    }

    /// Units currently available. Never negative: backends that count
    /// blocked waiters as negative values report 0 here.
    #[track_caller]
    pub fn get_value(&self) -> u32 {
        self.checked_get_value().or_raise()
    }

    pub fn checked_get_value(&self) -> Result<u32> {
        let value = self.raw.value()?;
        Ok(value.clamp(0, u32::MAX as i64) as u32)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.checked_get_value().ok())
            .finish()
    }
}
