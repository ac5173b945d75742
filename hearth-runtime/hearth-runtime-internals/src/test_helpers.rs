use crate::runtime::{SavedState, ScriptError, ScriptRuntime};
use std::path::Path;

/// A runtime with no behavior, for tests that only exercise the adapter.
pub struct NullRuntime;

impl ScriptRuntime for NullRuntime {
    fn new_thread_state(&self) -> SavedState {
        SavedState::new(())
    }

    fn enter(&self, _state: SavedState) {}

    fn leave(&self) -> SavedState {
        SavedState::new(())
    }

    fn run_script(&self, _source: &str, _path: &Path, _argv: &[String]) -> Result<(), ScriptError> {
        Ok(())
    }
}
