use crate::registry::InstanceId;
use crate::thread::ThreadId;
use anyhow::Error as AnyError;
use hearth_module::Ordinal;
use std::fmt;
use std::os::raw::c_int;
use std::path::PathBuf;
use thiserror::Error;

/// Hearth runtime errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {}", _0)]
    InvalidArgument(&'static str),

    /// Memory for a globals block or its heap could not be obtained.
    #[error("Allocation failed: could not reserve {} bytes", _0)]
    Allocation(usize),

    /// An instance id did not name a live instance.
    #[error("Unknown instance: {}", _0)]
    UnknownInstance(InstanceId),

    /// A thread id did not name a worker that can still be waited for.
    #[error("Unknown thread: {}", _0)]
    UnknownThread(ThreadId),

    /// The operating system refused to create a thread.
    #[error("Resource exhausted: {}", _0)]
    ResourceExhausted(#[source] std::io::Error),

    /// A module error occurred.
    #[error("Module error: {}", _0)]
    ModuleError(#[from] ModuleError),

    /// A call would exceed one of an instance's [`Limits`](struct.Limits.html).
    #[error("Instance limits exceeded: {}", _0)]
    LimitsExceeded(String),

    /// `wait()` was called on a wait primitive from a thread other than the one that created it.
    #[error("Wait primitive is owned by thread {}", _0)]
    WaitOwnership(ThreadId),

    /// `wait()` was called while another wait on the same primitive was still pending.
    #[error("Wait already in progress")]
    WaitInProgress,

    /// The calling thread has no cooperative scheduler installed.
    #[error("No scheduler installed on this thread")]
    NoScheduler,

    /// A completion was posted to a scheduler that has already been torn down.
    #[error("Scheduler is no longer running")]
    SchedulerGone,

    /// Teardown was requested while worker threads were still bound to the instance.
    #[error("Instance busy: {} worker threads still running", _0)]
    InstanceBusy(usize),

    #[error("Script not found: {}", _0.display())]
    ScriptNotFound(PathBuf),

    #[error("Script unreadable: {}: {}", path.display(), source)]
    ScriptUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A catch-all for internal errors that are likely unrecoverable by the runtime user.
    #[error("Internal error: {}", _0)]
    InternalError(#[source] AnyError),
}

/// Errors raised while loading, promoting or finalizing native extension images.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Module not found: {}", _0.display())]
    NotFound(PathBuf),

    /// A mandatory entry point could not be resolved. The image has been closed.
    #[error("Bad entry point {} in {}", ordinal, path.display())]
    BadEntryPoint { path: PathBuf, ordinal: Ordinal },

    #[error(
        "ABI version mismatch in {}: found {}, expected {}",
        path.display(),
        found,
        expected
    )]
    AbiMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    /// The platform loader reported an error.
    #[error("Loader error for {}: {}", path.display(), source)]
    Loader {
        path: PathBuf,
        #[source]
        source: AnyError,
    },

    #[error("Finalizer for {} returned status {}", path.display(), status)]
    FinalizerFailed { path: PathBuf, status: c_int },

    #[error("Unknown module handle: {}", _0)]
    UnknownHandle(crate::loader::ModuleHandle),
}

/// Report a broken usage contract and abort the process.
///
/// Contract violations leave the embedded runtime in a state nothing can recover from, so they are
/// never surfaced as `Err`.
#[cold]
#[inline(never)]
pub fn contract_abort(args: fmt::Arguments<'_>) -> ! {
    tracing::error!("contract violation: {}", args);
    eprintln!("hearth: contract violation: {}", args);
    std::process::abort()
}

#[macro_export]
macro_rules! contract_violation {
    ($($arg:tt)*) => {
        $crate::error::contract_abort(format_args!($($arg)*))
    };
}

#[macro_export(local_inner_macros)]
macro_rules! contract_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            contract_violation!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! hearth_bail {
    ($e:expr) => {
        return Err(hearth_format_err!($e));
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err(hearth_format_err!($fmt, $($arg)*));
    };
}

#[macro_export(local_inner_macros)]
macro_rules! hearth_ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            hearth_bail!($e);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            hearth_bail!($fmt, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! hearth_format_err {
    ($($arg:tt)*) => { $crate::error::Error::InternalError(anyhow::format_err!($($arg)*)) }
}

#[macro_export]
macro_rules! bail_limits_exceeded {
    ($($arg:tt)*) => { return Err($crate::error::Error::LimitsExceeded(format!($($arg)*))); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(n: u32) -> Result<u32, Error> {
        match n {
            0 => {
                hearth_bail!("zero is not allowed");
            }
            n if n > 10 => {
                bail_limits_exceeded!("{} is more than 10", n);
            }
            n => {
                hearth_ensure!(n % 2 == 0, "{} is odd", n);
                Ok(n / 2)
            }
        }
    }

    #[test]
    fn bail_macros_return_from_match_arms() {
        assert_eq!(pick(4).unwrap(), 2);
        match pick(0) {
            Err(Error::InternalError(e)) => assert_eq!(e.to_string(), "zero is not allowed"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(pick(11), Err(Error::LimitsExceeded(m)) if m == "11 is more than 10"));
        assert!(matches!(pick(3), Err(Error::InternalError(_))));
    }
}
