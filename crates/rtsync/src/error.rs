// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error model.
//!
//! Timeouts, would-block and interrupted waits never show up here; those
//! are ordinary `false`/`None` results. Precondition violations don't
//! either: they go through `fatal!` and abort.

use std::io;

use thiserror::Error;

/// A hard failure reported by a primitive or its backend.
#[derive(Debug, Error)]
pub enum Error {
    /// Unexpected error code from the native backend.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The native execution context could not be created.
    #[error("failed to spawn task: {0}")]
    Spawn(#[source] io::Error),

    /// Task options rejected before anything was created.
    #[error("invalid task options: {0}")]
    InvalidOptions(String),

    /// `set_periodic` called with a zero period.
    #[error("period must be greater than zero")]
    ZeroPeriod,

    /// The new execution context exited before it could report its setup.
    #[error("task exited before starting its work")]
    StartupAborted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wrap a positive errno value returned by `op`.
    pub(crate) fn os(op: &'static str, code: i32) -> Self {
        Error::Os {
            op,
            source: io::Error::from_raw_os_error(code),
        }
    }

    /// Wrap the calling thread's current `errno`.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Error::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// The native error code, if this error came from the backend.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Os { source, .. } | Error::Spawn(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Turns the explicit-error form of an operation into its raising form.
pub(crate) trait OrRaise<T> {
    fn or_raise(self) -> T;
}

impl<T> OrRaise<T> for Result<T> {
    #[track_caller]
    fn or_raise(self) -> T {
        match self {
            Ok(val) => val,
            Err(e) => panic!("{}", e),
        }
    }
}

/// Log a precondition violation and abort the process.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        log::error!("{}", msg);
        eprintln!("rtsync: fatal: {}", msg);
        std::process::abort()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_keeps_code() {
        let e = Error::os("pthread_mutex_lock", libc::EDEADLK);
        assert_eq!(e.raw_os_error(), Some(libc::EDEADLK));
        assert!(e.to_string().starts_with("pthread_mutex_lock failed"));
    }

    #[test]
    fn non_os_errors_have_no_code() {
        assert_eq!(Error::ZeroPeriod.raw_os_error(), None);
        assert_eq!(Error::InvalidOptions("x".into()).raw_os_error(), None);
    }

    #[test]
    fn or_raise_passes_values_through() {
        let r: Result<u32> = Ok(7);
        assert_eq!(r.or_raise(), 7);
    }

    #[test]
    #[should_panic(expected = "period must be greater than zero")]
    fn or_raise_panics_with_message() {
        let r: Result<()> = Err(Error::ZeroPeriod);
        r.or_raise();
    }
}
