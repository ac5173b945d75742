//! The contract between the adapter and the embedded script runtime.

use crate::error::Error;
use std::any::Any;
use std::fmt;
use std::path::Path;

/// Opaque per-thread runtime state.
///
/// The adapter never looks inside a `SavedState`; it only carries the value from
/// [`ScriptRuntime::leave`] back into the matching [`ScriptRuntime::enter`] for the same thread.
pub struct SavedState(Box<dyn Any + Send>);

impl SavedState {
    pub fn new<T: Any + Send>(state: T) -> Self {
        SavedState(Box::new(state))
    }

    pub fn downcast<T: Any>(self) -> Result<Box<T>, SavedState> {
        self.0.downcast::<T>().map_err(SavedState)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for SavedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SavedState(..)")
    }
}

/// An error raised by script code and not handled by it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptError {
    pub message: String,
    /// Innermost frame last.
    pub traceback: Vec<String>,
}

impl ScriptError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        ScriptError {
            message: message.into(),
            traceback: vec![],
        }
    }

    pub fn with_frame<S: Into<String>>(mut self, frame: S) -> Self {
        self.traceback.push(frame.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in self.traceback.iter() {
                writeln!(f, "  {}", frame)?;
            }
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Outcome of running a script to completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptStatus {
    Completed,
    /// The script raised an error. It is kept in the instance's last-error slot until
    /// [`report_last_error`](struct.InstanceHandle.html#method.report_last_error) takes it.
    Failed,
}

/// Execution contract of an embedded script runtime.
///
/// One value serves every thread of one instance. The adapter guarantees that at most one thread
/// is between `enter` and `leave` at any time, that each `enter` is matched by exactly one
/// `leave` on the same thread, and that the state passed to `enter` is the one the same thread
/// last got back from `leave` (or from `new_thread_state`, for a thread's first entry).
pub trait ScriptRuntime: Send + Sync {
    /// Bring up the runtime on the instance's home thread.
    ///
    /// On success the home thread's state must be current, as if `enter` had been called. The
    /// adapter follows up with `leave` to park it.
    fn initialize(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Allocate state for a thread about to be spawned. Called on the spawning thread.
    fn new_thread_state(&self) -> SavedState;

    fn enter(&self, state: SavedState);

    fn leave(&self) -> SavedState;

    /// Execute `source`, read from `path`, with `argv` as the script's arguments. `argv[0]` is
    /// the script path.
    fn run_script(&self, source: &str, path: &Path, argv: &[String]) -> Result<(), ScriptError>;

    fn format_error(&self, error: &ScriptError) -> String {
        error.to_string()
    }

    /// Tear the runtime down. Called once, on the home thread, with the lease held.
    fn finalize(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_formats_innermost_last() {
        let err = ScriptError::new("ValueError: bad")
            .with_frame("File \"a.py\", line 1")
            .with_frame("File \"b.py\", line 7");
        assert_eq!(
            err.to_string(),
            "Traceback (most recent call last):\n  File \"a.py\", line 1\n  File \"b.py\", line 7\nValueError: bad"
        );
        assert_eq!(ScriptError::new("boom").to_string(), "boom");
    }

    #[test]
    fn saved_state_downcasts() {
        let state = SavedState::new(17u32);
        assert_eq!(state.downcast_ref::<u32>(), Some(&17));
        let state = state.downcast::<String>().unwrap_err();
        assert_eq!(*state.downcast::<u32>().unwrap(), 17);
    }
}
