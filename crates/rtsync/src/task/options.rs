// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task creation options.
//!
//! Each setter consumes the options and returns them with one field
//! changed, so `TaskOptions::default().priority(80).name("ctl")` applies
//! left to right and an untouched `default()` is a plain non-realtime task.

use std::collections::BTreeSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::Task;
use crate::error::{Error, Result};

/// Highest realtime priority accepted.
pub const MAX_PRIORITY: u8 = 99;

/// Scheduling policy requested for a realtime task. Ignored when the
/// priority is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SchedPolicy {
    #[default]
    Fifo,
    RoundRobin,
    Other,
}

/// CPUs a task may run on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CpuSet {
    cpus: BTreeSet<usize>,
}

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(cpu: usize) -> Self {
        let mut set = Self::new();
        set.insert(cpu);
        set
    }

    pub fn insert(&mut self, cpu: usize) -> bool {
        self.cpus.insert(cpu)
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.cpus.contains(&cpu)
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// CPU indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.cpus.iter().copied()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            cpus: iter.into_iter().collect(),
        }
    }
}

/// Configuration snapshot for a new [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TaskOptions {
    /// Informational name, visible to the OS where supported.
    pub name: Option<String>,
    /// Stack size in bytes; 0 picks the backend default.
    pub stack_size: usize,
    /// 0 = non-realtime, 1..=99 = realtime priority band.
    pub priority: u8,
    pub cpu_set: Option<CpuSet>,
    pub policy: SchedPolicy,
    /// Join implicitly when the task is dropped while still joinable.
    pub auto_join: bool,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn cpu_set(mut self, cpus: CpuSet) -> Self {
        self.cpu_set = Some(cpus);
        self
    }

    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn auto_join(mut self, auto_join: bool) -> Self {
        self.auto_join = auto_join;
        self
    }

    pub fn is_realtime(&self) -> bool {
        self.priority > 0
    }

    /// Reject option combinations no backend can honor.
    pub fn validate(&self) -> Result<()> {
        if self.priority > MAX_PRIORITY {
            return Err(Error::InvalidOptions(format!(
                "priority {} is above {}",
                self.priority, MAX_PRIORITY
            )));
        }
        if self.is_realtime() && self.policy == SchedPolicy::Other {
            return Err(Error::InvalidOptions(
                "realtime priority requires a realtime policy".to_string(),
            ));
        }
        if let Some(name) = &self.name {
            if name.contains('\0') {
                return Err(Error::InvalidOptions(
                    "task name contains a NUL byte".to_string(),
                ));
            }
        }
        if let Some(cpus) = &self.cpu_set {
            if cpus.is_empty() {
                return Err(Error::InvalidOptions("empty CPU set".to_string()));
            }
            let limit = libc::CPU_SETSIZE as usize;
            if let Some(cpu) = cpus.iter().find(|&cpu| cpu >= limit) {
                return Err(Error::InvalidOptions(format!(
                    "CPU {} is outside the native set size {}",
                    cpu, limit
                )));
            }
        }
        Ok(())
    }

    /// Create and start a task running `f`.
    pub fn spawn<F>(self, f: F) -> Result<Task>
    where
        F: FnOnce() + Send + 'static,
    {
        Task::spawn_with(self, Box::new(f))
    }
}
