// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Mutex with immediate, non-blocking and deadline acquisition.
//!
//! Holding the lock is a [`MutexGuard`]; the lock is released when the
//! guard goes away, so unlocking a mutex you don't hold can't be written.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::backend::{Backend, Native, RawMutex};
use crate::clock::{Clock, TimePoint, WaitClock};
use crate::error::{OrRaise, Result};

pub(crate) type NativeMutex = <Native as Backend>::Mutex;

/// Exclusive lock around a `T`. With the default `T = ()` it is a bare lock.
pub struct Mutex<T: ?Sized = ()> {
    raw: NativeMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create an unlocked mutex. Raises if the native lock can't be created.
    #[track_caller]
    pub fn new(value: T) -> Self {
        Self::checked_new(value).or_raise()
    }

    pub fn checked_new(value: T) -> Result<Self> {
        Ok(Self {
            raw: NativeMutex::new()?,
            data: UnsafeCell::new(value),
        })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Block until the lock is acquired.
    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.checked_lock().or_raise()
    }

    pub fn checked_lock(&self) -> Result<MutexGuard<'_, T>> {
        self.raw.lock()?;
        Ok(MutexGuard::new(self))
    }

    /// Acquire the lock if nobody holds it. Never blocks.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.checked_try_lock().or_raise()
    }

    pub fn checked_try_lock(&self) -> Result<Option<MutexGuard<'_, T>>> {
        Ok(self.raw.try_lock()?.then(|| MutexGuard::new(self)))
    }

    /// Acquire the lock unless `deadline` passes first.
    #[track_caller]
    pub fn try_lock_until(&self, deadline: TimePoint<WaitClock>) -> Option<MutexGuard<'_, T>> {
        self.checked_try_lock_until(deadline).or_raise()
    }

    pub fn checked_try_lock_until(
        &self,
        deadline: TimePoint<WaitClock>,
    ) -> Result<Option<MutexGuard<'_, T>>> {
        let acquired = self.raw.try_lock_until(&deadline.to_timespec())?;
        Ok(acquired.then(|| MutexGuard::new(self)))
    }

    /// `try_lock_until(now + timeout)` on the wait clock.
    #[track_caller]
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.checked_try_lock_for(timeout).or_raise()
    }

    pub fn checked_try_lock_for(&self, timeout: Duration) -> Result<Option<MutexGuard<'_, T>>> {
        self.checked_try_lock_until(WaitClock::checked_now()? + timeout)
    }

    /// No locking needed: the `&mut` proves nobody else holds it.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) fn raw(&self) -> &NativeMutex {
        &self.raw
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

/// Proof of holding a [`Mutex`]. Unlocks on drop.
///
/// Not `Send`: the native lock must be released by the context that
/// acquired it.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(lock: &'a Mutex<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// The mutex this guard holds.
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }

    /// Release the lock, reporting a backend failure instead of logging it.
    pub fn unlock(self) -> Result<()> {
        let lock = self.lock;
        std::mem::forget(self);
        unsafe { lock.raw.unlock() }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.lock.raw.unlock() } {
            log::error!("mutex unlock failed: {}", e);
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::task::Task;

    #[test]
    fn no_contention() {
        let m = Mutex::new(1);
        {
            let mut guard = m.lock();
            assert!(m.try_lock().is_none());
            *guard += 1;
            assert_eq!(*guard, 2);
        }
        {
            let mut guard = m.try_lock().unwrap();
            *guard += 1;
        }
        assert_eq!(m.into_inner(), 3);
    }

    #[test]
    fn explicit_unlock() {
        let m = Mutex::new(());
        let guard = m.lock();
        guard.unlock().unwrap();
        assert!(m.try_lock().is_some());
    }

    /// Hold `m` on another task until told to let go.
    fn hold_elsewhere(m: Arc<Mutex<u32>>) -> (Task, mpsc::Sender<()>) {
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let task = Task::new(move || {
            let _guard = m.lock();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();
        (task, release_tx)
    }

    #[test]
    fn past_deadline_returns_promptly() {
        let m = Arc::new(Mutex::new(0));
        let (mut holder, release) = hold_elsewhere(m.clone());

        let start = Instant::now();
        let deadline = WaitClock::now() - Duration::from_nanos(1);
        assert!(m.try_lock_until(deadline).is_none());
        assert!(start.elapsed() < Duration::from_millis(500));

        release.send(()).unwrap();
        holder.join();
    }

    #[test]
    fn timed_lock_waits_for_timeout() {
        let m = Arc::new(Mutex::new(0));
        let (mut holder, release) = hold_elsewhere(m.clone());

        let start = Instant::now();
        assert!(m.try_lock_for(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));

        release.send(()).unwrap();
        holder.join();
        assert!(m.try_lock_for(Duration::from_millis(30)).is_some());
    }

    #[test]
    fn timed_lock_succeeds_when_released() {
        let m = Arc::new(Mutex::new(0));
        let (mut holder, release) = hold_elsewhere(m.clone());
        release.send(()).unwrap();
        let guard = m.try_lock_for(Duration::from_secs(5));
        assert!(guard.is_some());
        drop(guard);
        holder.join();
    }

    #[test]
    fn concurrent_lock() {
        let m = Arc::new(Mutex::new(0));
        let mut tasks = vec![];
        for _ in 0..10 {
            let m = m.clone();
            tasks.push(Task::new(move || {
                for _ in 0..100 {
                    *m.lock() += 1;
                }
            }));
        }
        for mut t in tasks {
            t.join();
        }
        assert_eq!(*m.lock(), 1000);
    }

    #[test]
    fn get_mut_without_locking() {
        let mut m = Mutex::new(vec![1]);
        m.get_mut().push(2);
        assert_eq!(*m.lock(), vec![1, 2]);
    }
}
