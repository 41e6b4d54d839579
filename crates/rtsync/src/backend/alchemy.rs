// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Xenomai Alchemy backend.
//!
//! Everything runs on the Alchemy clock (`CLOCK_MONOTONIC` under Cobalt),
//! so the wait clock, semaphore deadlines and periodic release are all
//! monotonic. Alchemy calls return `-errno` on failure.
//!
//! Binaries must be linked with the flags from
//! `xeno-config --skin=alchemy --ldflags` (pass them through `RUSTFLAGS`).

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use crate::clock::{ClockId, Monotonic, TimePoint};
use crate::error::{Error, Result};
use crate::task::{SchedPolicy, TaskOptions};

use super::{
    Backend, PeriodicClock, RawCondvar, RawMutex, RawSemaphore, RawThread, RawTimer,
    SemaphoreClock, Work,
};

#[allow(non_camel_case_types)]
mod ffi {
    use libc::{c_char, c_int, c_ulong, c_void, cpu_set_t, pthread_t, timespec, uintptr_t};

    pub type RTIME = u64;

    pub const TM_NOW: RTIME = 0;
    pub const TM_INFINITE: RTIME = 0;

    pub const T_JOINABLE: c_int = 1 << 16;
    pub const S_PRIO: c_int = 0x1;

    const XNOBJECT_NAME_LEN: usize = 32;

    #[repr(C)]
    pub struct RT_TASK {
        pub handle: uintptr_t,
        pub thread: pthread_t,
    }

    #[repr(C)]
    pub struct RT_MUTEX {
        pub handle: uintptr_t,
    }

    #[repr(C)]
    pub struct RT_COND {
        pub handle: uintptr_t,
    }

    #[repr(C)]
    pub struct RT_SEM {
        pub handle: uintptr_t,
    }

    #[repr(C)]
    pub struct RT_SEM_INFO {
        pub count: c_ulong,
        pub nwaiters: c_int,
        pub name: [c_char; XNOBJECT_NAME_LEN],
    }

    extern "C" {
        pub fn rt_task_create(
            task: *mut RT_TASK,
            name: *const c_char,
            stksize: c_int,
            prio: c_int,
            mode: c_int,
        ) -> c_int;
        pub fn rt_task_start(
            task: *mut RT_TASK,
            entry: extern "C" fn(arg: *mut c_void),
            arg: *mut c_void,
        ) -> c_int;
        pub fn rt_task_delete(task: *mut RT_TASK) -> c_int;
        pub fn rt_task_join(task: *mut RT_TASK) -> c_int;
        pub fn rt_task_set_affinity(task: *mut RT_TASK, cpus: *const cpu_set_t) -> c_int;
        pub fn rt_task_set_periodic(task: *mut RT_TASK, idate: RTIME, period: RTIME) -> c_int;
        pub fn rt_task_wait_period(overruns_r: *mut c_ulong) -> c_int;
        pub fn rt_task_yield() -> c_int;

        pub fn rt_mutex_create(mutex: *mut RT_MUTEX, name: *const c_char) -> c_int;
        pub fn rt_mutex_delete(mutex: *mut RT_MUTEX) -> c_int;
        pub fn rt_mutex_acquire_timed(mutex: *mut RT_MUTEX, abs_timeout: *const timespec) -> c_int;
        pub fn rt_mutex_release(mutex: *mut RT_MUTEX) -> c_int;

        pub fn rt_cond_create(cond: *mut RT_COND, name: *const c_char) -> c_int;
        pub fn rt_cond_delete(cond: *mut RT_COND) -> c_int;
        pub fn rt_cond_signal(cond: *mut RT_COND) -> c_int;
        pub fn rt_cond_broadcast(cond: *mut RT_COND) -> c_int;
        pub fn rt_cond_wait_timed(
            cond: *mut RT_COND,
            mutex: *mut RT_MUTEX,
            abs_timeout: *const timespec,
        ) -> c_int;

        pub fn rt_sem_create(
            sem: *mut RT_SEM,
            name: *const c_char,
            icount: c_ulong,
            mode: c_int,
        ) -> c_int;
        pub fn rt_sem_delete(sem: *mut RT_SEM) -> c_int;
        pub fn rt_sem_p_timed(sem: *mut RT_SEM, abs_timeout: *const timespec) -> c_int;
        pub fn rt_sem_v(sem: *mut RT_SEM) -> c_int;
        pub fn rt_sem_inquire(sem: *mut RT_SEM, info: *mut RT_SEM_INFO) -> c_int;
    }
}

/// Xenomai Alchemy real-time skin.
#[derive(Debug)]
pub struct Alchemy;

impl Backend for Alchemy {
    type Mutex = AlchemyMutex;
    type Condvar = AlchemyCondvar;
    type Semaphore = AlchemySemaphore;
    type Thread = AlchemyThread;
    type Timer = AlchemyTimer;
    type WaitClock = Monotonic;

    const NAME: &'static str = "alchemy";
}

impl SemaphoreClock for Monotonic {}
impl PeriodicClock for Monotonic {}

/// `{0, 0}` asks Alchemy timed services not to block at all.
const NONBLOCK: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

fn check(op: &'static str, ret: libc::c_int) -> Result<()> {
    if ret < 0 {
        Err(Error::os(op, -ret))
    } else {
        Ok(())
    }
}

/// Map a timed-service result: success, or one of the codes meaning
/// "didn't get it this time".
fn acquired(op: &'static str, ret: libc::c_int, misses: &[libc::c_int]) -> Result<bool> {
    if ret >= 0 {
        Ok(true)
    } else if misses.contains(&-ret) {
        Ok(false)
    } else {
        Err(Error::os(op, -ret))
    }
}

fn log_drop_failure(op: &str, ret: libc::c_int) {
    if ret < 0 {
        log::error!("{} failed: {}", op, io::Error::from_raw_os_error(-ret));
    }
}

fn timespec_to_rtime(ts: &libc::timespec) -> ffi::RTIME {
    let nanos = ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64;
    nanos.max(0) as ffi::RTIME
}

// ---------------------------------------------------------------------------
// Mutex / condition variable / semaphore
// ---------------------------------------------------------------------------

pub struct AlchemyMutex {
    inner: Box<UnsafeCell<ffi::RT_MUTEX>>,
}

unsafe impl Send for AlchemyMutex {}
unsafe impl Sync for AlchemyMutex {}

impl RawMutex for AlchemyMutex {
    fn new() -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(ffi::RT_MUTEX { handle: 0 }));
        check("rt_mutex_create", unsafe {
            ffi::rt_mutex_create(inner.get(), ptr::null())
        })?;
        Ok(Self { inner })
    }

    fn lock(&self) -> Result<()> {
        check("rt_mutex_acquire", unsafe {
            ffi::rt_mutex_acquire_timed(self.inner.get(), ptr::null())
        })
    }

    fn try_lock(&self) -> Result<bool> {
        let ret = unsafe { ffi::rt_mutex_acquire_timed(self.inner.get(), &NONBLOCK) };
        acquired("rt_mutex_acquire", ret, &[libc::EWOULDBLOCK])
    }

    fn try_lock_until(&self, deadline: &libc::timespec) -> Result<bool> {
        let ret = unsafe { ffi::rt_mutex_acquire_timed(self.inner.get(), deadline) };
        acquired("rt_mutex_acquire_timed", ret, &[libc::ETIMEDOUT, libc::EWOULDBLOCK])
    }

    unsafe fn unlock(&self) -> Result<()> {
        check("rt_mutex_release", ffi::rt_mutex_release(self.inner.get()))
    }
}

impl Drop for AlchemyMutex {
    fn drop(&mut self) {
        log_drop_failure("rt_mutex_delete", unsafe {
            ffi::rt_mutex_delete(self.inner.get())
        });
    }
}

pub struct AlchemyCondvar {
    inner: Box<UnsafeCell<ffi::RT_COND>>,
}

unsafe impl Send for AlchemyCondvar {}
unsafe impl Sync for AlchemyCondvar {}

impl RawCondvar for AlchemyCondvar {
    type Mutex = AlchemyMutex;

    fn new() -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(ffi::RT_COND { handle: 0 }));
        check("rt_cond_create", unsafe {
            ffi::rt_cond_create(inner.get(), ptr::null())
        })?;
        Ok(Self { inner })
    }

    fn notify_one(&self) -> Result<()> {
        check("rt_cond_signal", unsafe { ffi::rt_cond_signal(self.inner.get()) })
    }

    fn notify_all(&self) -> Result<()> {
        check("rt_cond_broadcast", unsafe {
            ffi::rt_cond_broadcast(self.inner.get())
        })
    }

    unsafe fn wait(&self, mutex: &AlchemyMutex) -> Result<bool> {
        let ret = ffi::rt_cond_wait_timed(self.inner.get(), mutex.inner.get(), ptr::null());
        acquired("rt_cond_wait", ret, &[libc::EINTR])
    }

    unsafe fn wait_until(&self, mutex: &AlchemyMutex, deadline: &libc::timespec) -> Result<bool> {
        let ret = ffi::rt_cond_wait_timed(self.inner.get(), mutex.inner.get(), deadline);
        acquired(
            "rt_cond_wait_timed",
            ret,
            &[libc::ETIMEDOUT, libc::EWOULDBLOCK, libc::EINTR],
        )
    }
}

impl Drop for AlchemyCondvar {
    fn drop(&mut self) {
        log_drop_failure("rt_cond_delete", unsafe {
            ffi::rt_cond_delete(self.inner.get())
        });
    }
}

pub struct AlchemySemaphore {
    inner: Box<UnsafeCell<ffi::RT_SEM>>,
}

unsafe impl Send for AlchemySemaphore {}
unsafe impl Sync for AlchemySemaphore {}

impl RawSemaphore for AlchemySemaphore {
    fn new(initial: u32) -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(ffi::RT_SEM { handle: 0 }));
        check("rt_sem_create", unsafe {
            ffi::rt_sem_create(inner.get(), ptr::null(), initial as libc::c_ulong, ffi::S_PRIO)
        })?;
        Ok(Self { inner })
    }

    fn post(&self) -> Result<()> {
        check("rt_sem_v", unsafe { ffi::rt_sem_v(self.inner.get()) })
    }

    fn wait(&self) -> Result<bool> {
        let ret = unsafe { ffi::rt_sem_p_timed(self.inner.get(), ptr::null()) };
        acquired("rt_sem_p", ret, &[libc::EINTR])
    }

    fn try_wait(&self) -> Result<bool> {
        let ret = unsafe { ffi::rt_sem_p_timed(self.inner.get(), &NONBLOCK) };
        acquired("rt_sem_p", ret, &[libc::EWOULDBLOCK])
    }

    fn wait_until<C: SemaphoreClock>(&self, deadline: TimePoint<C>) -> Result<bool> {
        let ts = deadline.rebase::<Monotonic>()?.to_timespec();
        let ret = unsafe { ffi::rt_sem_p_timed(self.inner.get(), &ts) };
        acquired(
            "rt_sem_p_timed",
            ret,
            &[libc::ETIMEDOUT, libc::EWOULDBLOCK, libc::EINTR],
        )
    }

    fn value(&self) -> Result<i64> {
        let mut info: ffi::RT_SEM_INFO = unsafe { mem::zeroed() };
        check("rt_sem_inquire", unsafe {
            ffi::rt_sem_inquire(self.inner.get(), &mut info)
        })?;
        Ok(info.count as i64)
    }
}

impl Drop for AlchemySemaphore {
    fn drop(&mut self) {
        log_drop_failure("rt_sem_delete", unsafe {
            ffi::rt_sem_delete(self.inner.get())
        });
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

extern "C" fn trampoline(arg: *mut libc::c_void) {
    // Ownership of the boxed work was handed over by `rt_task_start`. The
    // work carries its own panic guard, so nothing unwinds out of here.
    let work = unsafe { Box::from_raw(arg as *mut Work) };
    work();
}

pub struct AlchemyThread {
    task: Box<ffi::RT_TASK>,
}

unsafe impl Send for AlchemyThread {}

impl AlchemyThread {
    fn set_affinity(&mut self, options: &TaskOptions) -> Result<()> {
        let Some(cpus) = &options.cpu_set else {
            return Ok(());
        };
        let ret = unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for cpu in cpus.iter() {
                libc::CPU_SET(cpu, &mut set);
            }
            ffi::rt_task_set_affinity(&mut *self.task, &set)
        };
        check("rt_task_set_affinity", ret)
    }

    fn start(&mut self, work: Work) -> Result<()> {
        let arg = Box::into_raw(Box::new(work)) as *mut libc::c_void;
        let ret = unsafe { ffi::rt_task_start(&mut *self.task, trampoline, arg) };
        if ret < 0 {
            drop(unsafe { Box::from_raw(arg as *mut Work) });
            return Err(Error::os("rt_task_start", -ret));
        }
        Ok(())
    }
}

impl RawThread for AlchemyThread {
    fn spawn(options: &TaskOptions, work: Work) -> Result<Self> {
        let name = options
            .name
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::InvalidOptions("task name contains a NUL byte".to_string()))?;
        let stack_size = libc::c_int::try_from(options.stack_size)
            .map_err(|_| Error::InvalidOptions("stack size too large".to_string()))?;

        if options.is_realtime() && options.policy != SchedPolicy::Fifo {
            log::warn!(
                "alchemy schedules realtime tasks FIFO; ignoring {:?}",
                options.policy
            );
        }

        let mut thread = AlchemyThread {
            task: Box::new(ffi::RT_TASK {
                handle: 0,
                thread: 0,
            }),
        };
        check("rt_task_create", unsafe {
            ffi::rt_task_create(
                &mut *thread.task,
                name.as_ref().map_or(ptr::null(), |n| n.as_ptr()),
                stack_size,
                options.priority as libc::c_int,
                ffi::T_JOINABLE,
            )
        })?;

        if let Err(e) = thread.set_affinity(options).and_then(|()| thread.start(work)) {
            log_drop_failure("rt_task_delete", unsafe {
                ffi::rt_task_delete(&mut *thread.task)
            });
            return Err(e);
        }
        Ok(thread)
    }

    fn join(mut self) -> Result<()> {
        check("rt_task_join", unsafe { ffi::rt_task_join(&mut *self.task) })
    }

    fn detach(self) -> Result<()> {
        let ret = unsafe { libc::pthread_detach(self.task.thread) };
        if ret != 0 {
            return Err(Error::os("pthread_detach", ret));
        }
        Ok(())
    }

    fn is_current(&self) -> bool {
        unsafe { libc::pthread_equal(self.task.thread, libc::pthread_self()) != 0 }
    }

    fn yield_now() -> Result<()> {
        check("rt_task_yield", unsafe { ffi::rt_task_yield() })
    }
}

// ---------------------------------------------------------------------------
// Periodic release
// ---------------------------------------------------------------------------

/// Periodic mode of the calling Alchemy task. The task itself is the timer.
pub struct AlchemyTimer {
    clock: ClockId,
    armed: bool,
}

impl RawTimer for AlchemyTimer {
    fn new(clock: ClockId) -> Result<Self> {
        Ok(Self {
            clock,
            armed: false,
        })
    }

    fn clock(&self) -> ClockId {
        self.clock
    }

    fn arm(&mut self, start: &libc::timespec, period: &libc::timespec) -> Result<()> {
        let idate = match timespec_to_rtime(start) {
            0 => ffi::TM_NOW,
            date => date,
        };
        check("rt_task_set_periodic", unsafe {
            ffi::rt_task_set_periodic(ptr::null_mut(), idate, timespec_to_rtime(period))
        })?;
        self.armed = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<u64> {
        loop {
            let mut overruns: libc::c_ulong = 0;
            let ret = unsafe { ffi::rt_task_wait_period(&mut overruns) };
            match -ret {
                0 => return Ok(0),
                // Late: the missed releases are in `overruns`.
                libc::ETIMEDOUT => return Ok(overruns as u64),
                libc::EINTR => continue,
                code => return Err(Error::os("rt_task_wait_period", code)),
            }
        }
    }
}

impl Drop for AlchemyTimer {
    fn drop(&mut self) {
        if self.armed {
            log_drop_failure("rt_task_set_periodic", unsafe {
                ffi::rt_task_set_periodic(ptr::null_mut(), ffi::TM_NOW, ffi::TM_INFINITE)
            });
        }
    }
}
