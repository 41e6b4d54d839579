// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! POSIX backend: pthreads, POSIX semaphores and timerfd.
//!
//! Mutexes use priority inheritance. Condition variables keep the default
//! `CLOCK_REALTIME`, which is why this backend's wait clock is `Realtime`.
//! Semaphore deadlines on the monotonic clock are rebased onto the wall
//! clock before `sem_timedwait`.

use std::cell::UnsafeCell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::clock::{ClockId, Monotonic, Realtime, TimePoint};
use crate::error::{Error, Result};
use crate::task::{CpuSet, SchedPolicy, TaskOptions};

use super::{
    Backend, PeriodicClock, RawCondvar, RawMutex, RawSemaphore, RawThread, RawTimer,
    SemaphoreClock, Work,
};

/// Generic OS-thread backend.
#[derive(Debug)]
pub struct Posix;

impl Backend for Posix {
    type Mutex = PthreadMutex;
    type Condvar = PthreadCondvar;
    type Semaphore = PosixSemaphore;
    type Thread = PosixThread;
    type Timer = TimerFd;
    type WaitClock = Realtime;

    const NAME: &'static str = "posix";
}

impl SemaphoreClock for Monotonic {}
impl SemaphoreClock for Realtime {}
impl PeriodicClock for Monotonic {}
impl PeriodicClock for Realtime {}

// Not exported by every libc release we support.
const PTHREAD_PRIO_INHERIT: libc::c_int = 1;

extern "C" {
    fn pthread_mutexattr_setprotocol(
        attr: *mut libc::pthread_mutexattr_t,
        protocol: libc::c_int,
    ) -> libc::c_int;
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map a pthread-style return code (0 or an errno value).
fn check(op: &'static str, ret: libc::c_int) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::os(op, ret))
    }
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

pub struct PthreadMutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// pthread mutexes are meant to be shared between threads; the box pins
// the native object in place.
unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

impl PthreadMutex {
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

/// # Safety
///
/// `attr` must have been initialized by `pthread_mutexattr_init`.
unsafe fn destroy_mutexattr(attr: *mut libc::pthread_mutexattr_t) {
    let ret = libc::pthread_mutexattr_destroy(attr);
    if ret != 0 {
        log::error!(
            "pthread_mutexattr_destroy failed: {}",
            io::Error::from_raw_os_error(ret)
        );
    }
}

impl RawMutex for PthreadMutex {
    fn new() -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(
                "pthread_mutexattr_init",
                libc::pthread_mutexattr_init(attr.as_mut_ptr()),
            )?;
            let ret = pthread_mutexattr_setprotocol(attr.as_mut_ptr(), PTHREAD_PRIO_INHERIT);
            if ret != 0 {
                destroy_mutexattr(attr.as_mut_ptr());
                return Err(Error::os("pthread_mutexattr_setprotocol", ret));
            }
            let ret = libc::pthread_mutex_init(inner.get(), attr.as_ptr());
            destroy_mutexattr(attr.as_mut_ptr());
            check("pthread_mutex_init", ret)?;
        }
        Ok(Self { inner })
    }

    fn lock(&self) -> Result<()> {
        check("pthread_mutex_lock", unsafe {
            libc::pthread_mutex_lock(self.raw())
        })
    }

    fn try_lock(&self) -> Result<bool> {
        match unsafe { libc::pthread_mutex_trylock(self.raw()) } {
            0 => Ok(true),
            libc::EBUSY => Ok(false),
            code => Err(Error::os("pthread_mutex_trylock", code)),
        }
    }

    fn try_lock_until(&self, deadline: &libc::timespec) -> Result<bool> {
        match unsafe { libc::pthread_mutex_timedlock(self.raw(), deadline) } {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            code => Err(Error::os("pthread_mutex_timedlock", code)),
        }
    }

    unsafe fn unlock(&self) -> Result<()> {
        check("pthread_mutex_unlock", libc::pthread_mutex_unlock(self.raw()))
    }
}

impl Drop for PthreadMutex {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_mutex_destroy(self.raw()) };
        if ret != 0 {
            log::error!(
                "pthread_mutex_destroy failed: {}",
                io::Error::from_raw_os_error(ret)
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

pub struct PthreadCondvar {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl Send for PthreadCondvar {}
unsafe impl Sync for PthreadCondvar {}

impl PthreadCondvar {
    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.inner.get()
    }
}

impl RawCondvar for PthreadCondvar {
    type Mutex = PthreadMutex;

    fn new() -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        check("pthread_cond_init", unsafe {
            libc::pthread_cond_init(inner.get(), ptr::null())
        })?;
        Ok(Self { inner })
    }

    fn notify_one(&self) -> Result<()> {
        check("pthread_cond_signal", unsafe {
            libc::pthread_cond_signal(self.raw())
        })
    }

    fn notify_all(&self) -> Result<()> {
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.raw())
        })
    }

    unsafe fn wait(&self, mutex: &PthreadMutex) -> Result<bool> {
        match libc::pthread_cond_wait(self.raw(), mutex.raw()) {
            0 => Ok(true),
            libc::EINTR => Ok(false),
            code => Err(Error::os("pthread_cond_wait", code)),
        }
    }

    unsafe fn wait_until(&self, mutex: &PthreadMutex, deadline: &libc::timespec) -> Result<bool> {
        match libc::pthread_cond_timedwait(self.raw(), mutex.raw(), deadline) {
            0 => Ok(true),
            libc::ETIMEDOUT | libc::EINTR => Ok(false),
            code => Err(Error::os("pthread_cond_timedwait", code)),
        }
    }
}

impl Drop for PthreadCondvar {
    fn drop(&mut self) {
        let ret = unsafe { libc::pthread_cond_destroy(self.raw()) };
        if ret != 0 {
            log::error!(
                "pthread_cond_destroy failed: {}",
                io::Error::from_raw_os_error(ret)
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

pub struct PosixSemaphore {
    inner: Box<UnsafeCell<libc::sem_t>>,
}

unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    fn raw(&self) -> *mut libc::sem_t {
        self.inner.get()
    }
}

impl RawSemaphore for PosixSemaphore {
    fn new(initial: u32) -> Result<Self> {
        let inner: Box<UnsafeCell<libc::sem_t>> =
            Box::new(UnsafeCell::new(unsafe { mem::zeroed() }));
        if unsafe { libc::sem_init(inner.get(), 0, initial) } != 0 {
            return Err(Error::last_os("sem_init"));
        }
        Ok(Self { inner })
    }

    fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.raw()) } != 0 {
            return Err(Error::last_os("sem_post"));
        }
        Ok(())
    }

    fn wait(&self) -> Result<bool> {
        if unsafe { libc::sem_wait(self.raw()) } == 0 {
            return Ok(true);
        }
        match errno() {
            libc::EINTR => Ok(false),
            code => Err(Error::os("sem_wait", code)),
        }
    }

    fn try_wait(&self) -> Result<bool> {
        if unsafe { libc::sem_trywait(self.raw()) } == 0 {
            return Ok(true);
        }
        match errno() {
            libc::EAGAIN | libc::EINTR => Ok(false),
            code => Err(Error::os("sem_trywait", code)),
        }
    }

    fn wait_until<C: SemaphoreClock>(&self, deadline: TimePoint<C>) -> Result<bool> {
        let ts = deadline.rebase::<Realtime>()?.to_timespec();
        if unsafe { libc::sem_timedwait(self.raw(), &ts) } == 0 {
            return Ok(true);
        }
        match errno() {
            libc::ETIMEDOUT | libc::EINTR => Ok(false),
            code => Err(Error::os("sem_timedwait", code)),
        }
    }

    fn value(&self) -> Result<i64> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.raw(), &mut value) } != 0 {
            return Err(Error::last_os("sem_getvalue"));
        }
        Ok(value as i64)
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_destroy(self.raw()) } != 0 {
            log::error!("sem_destroy failed: {}", io::Error::last_os_error());
        }
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

impl SchedPolicy {
    fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
            SchedPolicy::Other => libc::SCHED_OTHER,
        }
    }
}

/// Scheduling hints applied by the new thread to itself before it runs
/// its work.
struct SchedHints {
    priority: u8,
    policy: SchedPolicy,
    cpus: Option<CpuSet>,
}

impl SchedHints {
    fn from_options(options: &TaskOptions) -> Self {
        Self {
            priority: options.priority,
            policy: options.policy,
            cpus: options.cpu_set.clone(),
        }
    }

    fn apply(&self) -> Result<()> {
        if self.priority > 0 {
            let mut param: libc::sched_param = unsafe { mem::zeroed() };
            param.sched_priority = self.priority as libc::c_int;
            check("pthread_setschedparam", unsafe {
                libc::pthread_setschedparam(libc::pthread_self(), self.policy.as_raw(), &param)
            })?;
        }

        if let Some(cpus) = &self.cpus {
            let ret = unsafe {
                let mut set: libc::cpu_set_t = mem::zeroed();
                libc::CPU_ZERO(&mut set);
                for cpu in cpus.iter() {
                    libc::CPU_SET(cpu, &mut set);
                }
                libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
            };
            if ret != 0 {
                return Err(Error::last_os("sched_setaffinity"));
            }
        }

        Ok(())
    }
}

/// A std thread that applied its scheduling hints before running.
pub struct PosixThread {
    handle: JoinHandle<()>,
}

impl RawThread for PosixThread {
    fn spawn(options: &TaskOptions, work: Work) -> Result<Self> {
        let mut builder = thread::Builder::new();
        if let Some(name) = &options.name {
            builder = builder.name(name.clone());
        }
        if options.stack_size > 0 {
            builder = builder.stack_size(options.stack_size);
        }

        let hints = SchedHints::from_options(options);
        let (tx, rx) = mpsc::sync_channel::<Result<()>>(1);

        let handle = builder
            .spawn(move || {
                let setup = hints.apply();
                let ready = setup.is_ok();
                let _ = tx.send(setup);
                if ready {
                    work();
                }
            })
            .map_err(Error::Spawn)?;

        // Don't hand out a task whose hints never took effect.
        match rx.recv() {
            Ok(Ok(())) => Ok(Self { handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::StartupAborted)
            }
        }
    }

    fn join(self) -> Result<()> {
        if self.handle.join().is_err() {
            // Work panics abort inside the task, so nothing should unwind
            // this far.
            fatal!("task thread unwound past its panic guard");
        }
        Ok(())
    }

    fn detach(self) -> Result<()> {
        // Dropping a JoinHandle detaches the underlying pthread.
        drop(self.handle);
        Ok(())
    }

    fn is_current(&self) -> bool {
        self.handle.thread().id() == thread::current().id()
    }

    fn yield_now() -> Result<()> {
        if unsafe { libc::sched_yield() } != 0 {
            return Err(Error::last_os("sched_yield"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Periodic timer
// ---------------------------------------------------------------------------

/// A timerfd armed in absolute mode. Reads return the number of
/// expirations since the last read.
pub struct TimerFd {
    fd: RawFd,
    clock: ClockId,
}

impl RawTimer for TimerFd {
    fn new(clock: ClockId) -> Result<Self> {
        let fd = unsafe { libc::timerfd_create(clock.as_raw(), libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os("timerfd_create"));
        }
        Ok(Self { fd, clock })
    }

    fn clock(&self) -> ClockId {
        self.clock
    }

    fn arm(&mut self, start: &libc::timespec, period: &libc::timespec) -> Result<()> {
        let mut value = *start;
        // An all-zero it_value disarms the timer instead of firing at the epoch.
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            value.tv_nsec = 1;
        }
        let spec = libc::itimerspec {
            it_interval: *period,
            it_value: value,
        };
        let ret = unsafe {
            libc::timerfd_settime(self.fd, libc::TFD_TIMER_ABSTIME, &spec, ptr::null_mut())
        };
        if ret != 0 {
            return Err(Error::last_os("timerfd_settime"));
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<u64> {
        let mut expirations: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.fd,
                    &mut expirations as *mut u64 as *mut libc::c_void,
                    mem::size_of::<u64>(),
                )
            };
            if n == mem::size_of::<u64>() as isize {
                return Ok(expirations.saturating_sub(1));
            }
            if n < 0 {
                match errno() {
                    // Expirations keep accumulating while we were interrupted.
                    libc::EINTR => continue,
                    code => return Err(Error::os("read(timerfd)", code)),
                }
            }
            return Err(Error::Os {
                op: "read(timerfd)",
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "short read"),
            });
        }
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } != 0 {
            log::error!("close(timerfd) failed: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::time::Duration;

    #[test]
    fn mutex_try_lock_reports_busy() {
        let m = PthreadMutex::new().unwrap();
        assert!(m.try_lock().unwrap());
        assert!(!m.try_lock().unwrap());
        unsafe { m.unlock().unwrap() };
        assert!(m.try_lock().unwrap());
        unsafe { m.unlock().unwrap() };
    }

    #[test]
    fn mutex_attributes_are_released_on_every_create() {
        for _ in 0..1000 {
            let m = PthreadMutex::new().unwrap();
            assert!(m.try_lock().unwrap());
            unsafe { m.unlock().unwrap() };
        }
    }

    #[test]
    fn mutex_timedlock_past_deadline() {
        let m = PthreadMutex::new().unwrap();
        m.lock().unwrap();
        let past = (Realtime::now() - Duration::from_nanos(1)).to_timespec();
        assert!(!m.try_lock_until(&past).unwrap());
        unsafe { m.unlock().unwrap() };
    }

    #[test]
    fn semaphore_counts() {
        let s = PosixSemaphore::new(2).unwrap();
        assert_eq!(s.value().unwrap(), 2);
        assert!(s.try_wait().unwrap());
        assert!(s.try_wait().unwrap());
        assert!(!s.try_wait().unwrap());
        s.post().unwrap();
        assert_eq!(s.value().unwrap(), 1);
    }

    #[test]
    fn semaphore_monotonic_deadline_times_out() {
        let s = PosixSemaphore::new(0).unwrap();
        let start = Monotonic::now();
        assert!(!s.wait_until(start + Duration::from_millis(20)).unwrap());
        assert!(Monotonic::now().duration_since(start) >= Duration::from_millis(15));
    }

    #[test]
    fn timer_counts_missed_releases() {
        let mut timer = TimerFd::new(ClockId::Monotonic).unwrap();
        assert_eq!(timer.clock(), ClockId::Monotonic);
        let period = Duration::from_millis(10);
        let start = Monotonic::now() - period * 5;
        timer
            .arm(&start.to_timespec(), &crate::clock::duration_to_timespec(period))
            .unwrap();
        // Releases at start, +10, ..., +50ms have all passed.
        assert!(timer.wait().unwrap() >= 4);
        assert_eq!(timer.wait().unwrap(), 0);
    }

    #[test]
    fn spawn_reports_bad_affinity() {
        // CPU 1023 is within the set size but absent on any test machine.
        let opts = TaskOptions::default().cpu_set(CpuSet::single(1023));
        let res = PosixThread::spawn(&opts, Box::new(|| {}));
        assert!(res.is_err());
    }

    #[test]
    fn spawn_runs_work_with_name() {
        let (tx, rx) = mpsc::channel();
        let opts = TaskOptions::default().name("posix-named");
        let t = PosixThread::spawn(
            &opts,
            Box::new(move || {
                tx.send(thread::current().name().map(str::to_owned)).unwrap();
            }),
        )
        .unwrap();
        assert!(!t.is_current());
        t.join().unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("posix-named"));
    }
}
