//! A small line-oriented script runtime used to drive the adapter in tests.
//!
//! Each line of a script is one statement:
//!
//! * `print <text>` appends `<text>` to the runtime's output;
//! * `argv` appends the script's arguments, space-separated;
//! * `call <hook> [args...]` runs a hook registered with [`TestRuntime::with_hook`];
//! * `raise <message>` fails the script.
//!
//! Blank lines and lines starting with `#` are skipped.

use hearth_runtime_internals::runtime::{SavedState, ScriptError, ScriptRuntime};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type Hook = Arc<dyn Fn(&[String]) -> anyhow::Result<()> + Send + Sync>;

/// Per-thread state handed back and forth through `enter`/`leave`.
#[derive(Debug)]
pub struct TestThreadState {
    pub serial: usize,
}

#[derive(Default)]
pub struct TestRuntime {
    current: Mutex<Option<TestThreadState>>,
    hooks: Mutex<HashMap<String, Hook>>,
    output: Mutex<Vec<String>>,
    thread_states: AtomicUsize,
    enters: AtomicUsize,
    leaves: AtomicUsize,
    initialized: AtomicUsize,
    finalized: AtomicUsize,
    fail_initialize: bool,
}

impl TestRuntime {
    pub fn new() -> Self {
        TestRuntime::default()
    }

    /// A runtime whose `initialize` fails.
    pub fn failing() -> Self {
        TestRuntime {
            fail_initialize: true,
            ..TestRuntime::default()
        }
    }

    pub fn with_hook<F>(self, name: &str, hook: F) -> Self
    where
        F: Fn(&[String]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .lock()
            .unwrap()
            .insert(name.to_owned(), Arc::new(hook));
        self
    }

    pub fn output(&self) -> Vec<String> {
        self.output.lock().unwrap().clone()
    }

    /// Thread states created so far, including the home thread's.
    pub fn thread_states(&self) -> usize {
        self.thread_states.load(Ordering::SeqCst)
    }

    pub fn enters(&self) -> usize {
        self.enters.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Serial of the thread state currently entered, if any.
    pub fn entered_serial(&self) -> Option<usize> {
        self.current.lock().unwrap().as_ref().map(|s| s.serial)
    }

    fn fresh_state(&self) -> TestThreadState {
        TestThreadState {
            serial: self.thread_states.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn statement(&self, line: &str, argv: &[String]) -> Result<(), String> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("print") => {
                let text = line["print".len()..].trim().to_owned();
                self.output.lock().unwrap().push(text);
                Ok(())
            }
            Some("argv") => {
                self.output.lock().unwrap().push(argv.join(" "));
                Ok(())
            }
            Some("raise") => Err(line["raise".len()..].trim().to_owned()),
            Some("call") => {
                let name = words.next().ok_or("call without a hook name")?;
                let hook = self
                    .hooks
                    .lock()
                    .unwrap()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("no hook named {}", name))?;
                let args: Vec<String> = words.map(str::to_owned).collect();
                hook(&args).map_err(|e| e.to_string())
            }
            Some(other) => Err(format!("unknown statement {}", other)),
            None => Ok(()),
        }
    }
}

impl ScriptRuntime for TestRuntime {
    fn initialize(&self) -> Result<(), hearth_runtime_internals::error::Error> {
        if self.fail_initialize {
            return Err(hearth_runtime_internals::error::Error::InvalidArgument(
                "test runtime refused to initialize",
            ));
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        // the creating thread is inside the runtime until the adapter first calls `leave`
        let state = self.fresh_state();
        self.enters.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = Some(state);
        Ok(())
    }

    fn new_thread_state(&self) -> SavedState {
        SavedState::new(self.fresh_state())
    }

    fn enter(&self, state: SavedState) {
        let state = state
            .downcast::<TestThreadState>()
            .unwrap_or_else(|_| panic!("foreign thread state"));
        let mut current = self.current.lock().unwrap();
        assert!(current.is_none(), "entered twice without leaving");
        *current = Some(*state);
        self.enters.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) -> SavedState {
        let state = self
            .current
            .lock()
            .unwrap()
            .take()
            .expect("left without entering");
        self.leaves.fetch_add(1, Ordering::SeqCst);
        SavedState::new(state)
    }

    fn run_script(&self, source: &str, path: &Path, argv: &[String]) -> Result<(), ScriptError> {
        for (n, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.statement(line, argv).map_err(|message| {
                ScriptError::new(message).with_frame(format!(
                    "File \"{}\", line {}",
                    path.display(),
                    n + 1
                ))
            })?;
        }
        Ok(())
    }

    fn finalize(&self) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}
