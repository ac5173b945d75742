//! `hearth-runtime-internals` hosts a stateful script runtime inside a larger application.
//!
//! The runtime keeps its global state in a per-instance [`GlobalsBlock`](globals/struct.GlobalsBlock.html),
//! resolved through per-thread bindings, so that several independent instances can share an
//! address space. Runtime code for one instance only ever runs on the thread holding that
//! instance's [execution lease](lease/index.html), and every logical thread gets its own
//! cooperative loop on which waits, timers and cross-thread calls are delivered.

#![deny(bare_trait_objects)]

#[macro_use]
pub mod error;

#[cfg(test)]
pub mod test_helpers;

pub mod callgate;
pub mod globals;
pub mod instance;
pub mod lease;
pub mod limits;
pub mod loader;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod thread;
pub mod wait;

#[cfg(feature = "concurrent_testpoints")]
pub mod lock_testpoints;
