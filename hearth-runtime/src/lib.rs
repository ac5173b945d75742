//! # hearth-runtime
//!
//! Hosts a stateful script runtime, written around one set of process-wide globals, inside an
//! application that may run several independent instances of it and that only offers cooperative,
//! per-thread scheduling.
//!
//! The script runtime itself is supplied by the embedder as a [`ScriptRuntime`]. This crate keeps
//! each instance's globals apart, makes sure at most one thread at a time runs runtime code for a
//! given instance, gives script code real threads with cooperative waits, and loads and unloads
//! native extension images on the instance's behalf.
//!
//! ```ignore
//! use hearth_runtime::{InstanceBuilder, ScriptStatus};
//! use std::sync::Arc;
//!
//! let mut inst = InstanceBuilder::new(Arc::new(MyRuntime::new()))
//!     .with_heap_size(8 * 1024 * 1024)
//!     .build()?;
//! if inst.run_script("main.py", &["--verbose"])? == ScriptStatus::Failed {
//!     if let Some(report) = inst.report_last_error()? {
//!         eprintln!("{}", report);
//!     }
//! }
//! inst.destroy()?;
//! ```
//!
//! Runtime code reaches the adapter through the free functions of [`thread`], [`wait`],
//! [`timer`] and [`loader`], which resolve the calling thread's instance through its binding in
//! the [`registry`]. Native extensions call back through the functions in [`c_api`].

#![deny(bare_trait_objects)]

pub mod c_api;

pub use hearth_module::{ModuleFlags, ModuleMetadata, Ordinal, ABI_VERSION};
pub use hearth_runtime_internals::callgate::{self, CallGate, GateCaller};
pub use hearth_runtime_internals::error::{Error, ModuleError};
pub use hearth_runtime_internals::globals::{self, BuildInfo, GlobalsBlock, GlobalsData};
pub use hearth_runtime_internals::instance::{
    self, create_instance, InstanceBuilder, InstanceHandle, TeardownReport,
};
pub use hearth_runtime_internals::lease::{self, ExecutionLease, RuntimeEntry};
pub use hearth_runtime_internals::limits::Limits;
pub use hearth_runtime_internals::loader::{
    self, DlLoader, ImageLoader, ModuleHandle, NativeImage, OwnershipScope,
};
pub use hearth_runtime_internals::registry::{self, registry, InstanceId};
pub use hearth_runtime_internals::runtime::{
    SavedState, ScriptError, ScriptRuntime, ScriptStatus,
};
pub use hearth_runtime_internals::scheduler::{self, timer, Completion, RequestId};
pub use hearth_runtime_internals::thread::{self, ExitStatus, ThreadId};
pub use hearth_runtime_internals::wait::{self, WaitPrimitive};

#[cfg(feature = "concurrent_testpoints")]
pub use hearth_runtime_internals::lock_testpoints;
