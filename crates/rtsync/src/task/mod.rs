// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks: one native execution context per task.
//!
//! A task is created and started in one step. It must then be consumed
//! exactly once through `join()` or `detach()`; dropping a still-joinable
//! task either joins it (`auto_join`) or aborts the process.
//!
//! ```no_run
//! use std::time::Duration;
//! use rtsync::{this_task, Clock, Monotonic, Task, TaskOptions};
//!
//! let mut task = Task::with_options(TaskOptions::new().name("ctl").priority(80), || {
//!     this_task::set_periodic(Monotonic::now(), Duration::from_millis(1));
//!     for _ in 0..1000 {
//!         let overruns = this_task::wait_period();
//!         if overruns > 0 {
//!             return;
//!         }
//!         // one control step
//!     }
//! });
//! task.join();
//! ```

mod options;
pub mod this_task;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, Native, RawThread, Work};
use crate::error::{OrRaise, Result};

pub use options::{CpuSet, SchedPolicy, TaskOptions, MAX_PRIORITY};

type NativeThread = <Native as Backend>::Thread;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity shared between a task handle and the task's own context.
#[derive(Debug)]
pub(crate) struct TaskInfo {
    pub id: u64,
    pub name: Option<String>,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "`{}` (#{})", name, self.id),
            None => write!(f, "#{}", self.id),
        }
    }
}

/// Owning handle to a running task.
pub struct Task {
    thread: Option<NativeThread>,
    info: Arc<TaskInfo>,
    auto_join: bool,
}

impl Task {
    /// Start `f` as a non-realtime task with default options.
    #[track_caller]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_options(TaskOptions::default(), f)
    }

    /// Start `f` with `options`. Raises if the task can't be created; use
    /// [`TaskOptions::spawn`] to get the error instead.
    #[track_caller]
    pub fn with_options<F>(options: TaskOptions, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        options.spawn(f).or_raise()
    }

    pub(crate) fn spawn_with(options: TaskOptions, work: Work) -> Result<Self> {
        options.validate()?;

        let info = Arc::new(TaskInfo {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: options.name.clone(),
        });
        let thread = NativeThread::spawn(&options, this_task::entry(info.clone(), work))?;
        log::debug!(
            "spawned task {} (priority {}, backend {})",
            info,
            options.priority,
            Native::NAME
        );

        Ok(Self {
            thread: Some(thread),
            info,
            auto_join: options.auto_join,
        })
    }

    /// Block until the task's work returns.
    #[track_caller]
    pub fn join(&mut self) {
        self.checked_join().or_raise()
    }

    pub fn checked_join(&mut self) -> Result<()> {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => fatal!("join on task {} which is not joinable", self.info),
        };
        if thread.is_current() {
            fatal!("task {} tried to join itself", self.info);
        }
        thread.join()
    }

    /// Let the task run to completion on its own.
    #[track_caller]
    pub fn detach(&mut self) {
        self.checked_detach().or_raise()
    }

    pub fn checked_detach(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.detach(),
            None => fatal!("detach on task {} which is not joinable", self.info),
        }
    }

    /// Whether a `join()` or `detach()` is still owed.
    pub fn joinable(&self) -> bool {
        self.thread.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.info.name.as_deref()
    }

    /// Process-unique task number, never reused.
    pub fn id(&self) -> u64 {
        self.info.id
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("joinable", &self.joinable())
            .field("auto_join", &self.auto_join)
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if !self.auto_join {
            fatal!("task {} dropped while still joinable", self.info);
        }
        if thread.is_current() {
            fatal!("task {} dropped its own handle with auto_join set", self.info);
        }
        if let Err(e) = thread.join() {
            log::error!("auto-join of task {} failed: {}", self.info, e);
        }
    }
}
