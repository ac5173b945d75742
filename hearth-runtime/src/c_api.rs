//! C entry points for native extension images.
//!
//! An extension's initializer runs inside the runtime of the instance that imported it, with the
//! instance's lease held, so these functions act on the calling thread's current instance.

use crate::{registry, thread, Error};
use libc::{c_char, c_int};
use std::ffi::CStr;

pub const HEARTH_OK: c_int = 0;
pub const HEARTH_EINVAL: c_int = -1;
pub const HEARTH_ELIMITS: c_int = -2;
pub const HEARTH_EUNBOUND: c_int = -3;

fn status_of(res: Result<(), Error>) -> c_int {
    match res {
        Ok(()) => HEARTH_OK,
        Err(Error::LimitsExceeded(_)) => HEARTH_ELIMITS,
        Err(Error::InvalidArgument(_)) => HEARTH_EINVAL,
        Err(Error::UnknownInstance(_)) => HEARTH_EUNBOUND,
        Err(e) => {
            tracing::warn!("extension callback failed: {}", e);
            HEARTH_EINVAL
        }
    }
}

/// Record a module named `name` in the current instance's module table.
///
/// When called from an initializer run by `loader::import`, the module is attributed to the image
/// being imported.
///
/// # Safety
///
/// `name` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn hearth_register_module(name: *const c_char) -> c_int {
    if name.is_null() {
        return HEARTH_EINVAL;
    }
    let name = match CStr::from_ptr(name).to_str() {
        Ok(name) if !name.is_empty() => name.to_owned(),
        _ => return HEARTH_EINVAL,
    };
    let block = match registry().try_current() {
        Some(block) => block,
        None => return HEARTH_EUNBOUND,
    };
    block.with_mut(|g| {
        let origin = g.loading_origin().map(|p| p.to_path_buf());
        tracing::debug!("registered module {} from {:?}", name, origin);
        g.modules.register(name, origin);
    });
    HEARTH_OK
}

/// Register `handler` to run when the calling thread shuts down, or when the instance is destroyed
/// if called from the instance's home thread.
#[no_mangle]
pub extern "C" fn hearth_register_exit_handler(handler: Option<extern "C" fn()>) -> c_int {
    let handler = match handler {
        Some(handler) => handler,
        None => return HEARTH_EINVAL,
    };
    if registry().try_current().is_none() {
        return HEARTH_EUNBOUND;
    }
    status_of(thread::register_exit_handler(move || handler()))
}

/// Id of the calling thread's current instance, or 0 if it is not bound to one.
#[no_mangle]
pub extern "C" fn hearth_current_instance() -> u64 {
    registry()
        .current_instance()
        .map(|id| id.as_u64())
        .unwrap_or(0)
}

/// Id of the calling thread as seen by script code.
#[no_mangle]
pub extern "C" fn hearth_current_thread() -> u64 {
    thread::current_ident().as_u64()
}
