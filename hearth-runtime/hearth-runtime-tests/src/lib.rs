//! Test suites for `hearth-runtime`, exported as macros so that they are compiled against the
//! public facade crate.

pub mod contracts;
pub mod helpers;
pub mod lease;
pub mod lifecycle;
pub mod loader;
pub mod runtime;
pub mod threads;
pub mod wait;
