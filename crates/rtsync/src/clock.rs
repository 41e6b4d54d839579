// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Clocks and absolute deadlines.
//!
//! Time points are plain nanosecond counts tagged with the clock they were
//! read from, so a deadline on the wrong clock is a type error rather than
//! a silently wrong wait.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

use crate::backend::{Backend, Native};
use crate::error::{Error, OrRaise, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Identifies one of the two supported time sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockId {
    /// Never goes backwards; unrelated to the calendar.
    Monotonic,
    /// Wall-clock time since the Unix epoch. May jump.
    Realtime,
}

impl ClockId {
    pub fn as_raw(self) -> libc::clockid_t {
        match self {
            ClockId::Monotonic => libc::CLOCK_MONOTONIC,
            ClockId::Realtime => libc::CLOCK_REALTIME,
        }
    }

    /// Read the clock, in nanoseconds since its epoch.
    pub fn now_nanos(self) -> Result<i64> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe { libc::clock_gettime(self.as_raw(), &mut ts) };
        if ret != 0 {
            return Err(Error::last_os("clock_gettime"));
        }
        Ok(ts.tv_sec as i64 * NANOS_PER_SEC + ts.tv_nsec as i64)
    }
}

/// A time source usable for deadlines.
pub trait Clock: Copy + Send + Sync + 'static {
    const ID: ClockId;

    /// Whether successive readings never decrease.
    const IS_STEADY: bool;

    /// Current time. Raises if the time source fails, which it shouldn't.
    #[track_caller]
    fn now() -> TimePoint<Self> {
        Self::checked_now().or_raise()
    }

    fn checked_now() -> Result<TimePoint<Self>> {
        Self::ID.now_nanos().map(TimePoint::from_nanos)
    }
}

/// `CLOCK_MONOTONIC`. Use this for periodic scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Monotonic;

impl Clock for Monotonic {
    const ID: ClockId = ClockId::Monotonic;
    const IS_STEADY: bool = true;
}

/// `CLOCK_REALTIME`, the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Realtime;

impl Clock for Realtime {
    const ID: ClockId = ClockId::Realtime;
    const IS_STEADY: bool = false;
}

/// Clock the active backend expects for mutex and condition variable
/// deadlines, and the one relative (`*_for`) waits are measured against.
pub type WaitClock = <Native as Backend>::WaitClock;

/// An instant on clock `C`, as signed nanoseconds since that clock's epoch.
pub struct TimePoint<C> {
    nanos: i64,
    clock: PhantomData<fn() -> C>,
}

impl<C: Clock> TimePoint<C> {
    pub const fn from_nanos(nanos: i64) -> Self {
        Self {
            nanos,
            clock: PhantomData,
        }
    }

    pub const fn as_nanos(self) -> i64 {
        self.nanos
    }

    /// Signed distance from `earlier` to `self`.
    pub fn nanos_since(self, earlier: Self) -> i64 {
        self.nanos - earlier.nanos
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn duration_since(self, earlier: Self) -> Duration {
        let diff = self.nanos_since(earlier);
        if diff <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(diff as u64)
        }
    }

    pub fn checked_add(self, d: Duration) -> Option<Self> {
        let d = i64::try_from(d.as_nanos()).ok()?;
        self.nanos.checked_add(d).map(Self::from_nanos)
    }

    pub fn checked_sub(self, d: Duration) -> Option<Self> {
        let d = i64::try_from(d.as_nanos()).ok()?;
        self.nanos.checked_sub(d).map(Self::from_nanos)
    }

    /// Express the same instant on clock `D`.
    ///
    /// The offset between the clocks is sampled now, so the result is only
    /// as good as the two back-to-back reads.
    pub fn rebase<D: Clock>(self) -> Result<TimePoint<D>> {
        if C::ID == D::ID {
            return Ok(TimePoint::from_nanos(self.nanos));
        }
        let from_now = C::checked_now()?;
        let to_now = D::checked_now()?;
        let remaining = self.nanos_since(from_now);
        Ok(TimePoint::from_nanos(to_now.nanos.saturating_add(remaining)))
    }

    /// The `timespec` form consumed by native timed waits.
    pub fn to_timespec(self) -> libc::timespec {
        nanos_to_timespec(self.nanos)
    }
}

pub(crate) fn nanos_to_timespec(nanos: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: nanos.div_euclid(NANOS_PER_SEC) as libc::time_t,
        tv_nsec: nanos.rem_euclid(NANOS_PER_SEC) as _,
    }
}

pub(crate) fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn saturating_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

impl<C> Clone for TimePoint<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for TimePoint<C> {}

impl<C> PartialEq for TimePoint<C> {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl<C> Eq for TimePoint<C> {}

impl<C> PartialOrd for TimePoint<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for TimePoint<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

impl<C> Hash for TimePoint<C> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.nanos.hash(state);
    }
}

impl<C: Clock> fmt::Debug for TimePoint<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimePoint")
            .field("clock", &C::ID)
            .field("nanos", &self.nanos)
            .finish()
    }
}

impl<C: Clock> Add<Duration> for TimePoint<C> {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self::from_nanos(self.nanos.saturating_add(saturating_nanos(rhs)))
    }
}

impl<C: Clock> AddAssign<Duration> for TimePoint<C> {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl<C: Clock> Sub<Duration> for TimePoint<C> {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self::from_nanos(self.nanos.saturating_sub(saturating_nanos(rhs)))
    }
}

impl<C: Clock> SubAssign<Duration> for TimePoint<C> {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}
