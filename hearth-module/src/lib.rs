//! Common definitions for native extension images loaded by `hearth-runtime`.
//!
//! An extension image is a shared object exporting its entry points by ordinal:
//!
//! * ordinal 1 (`hearth_ordinal_1`) is the initializer, and is mandatory;
//! * ordinal 2 (`hearth_ordinal_2`) is the finalizer, and is only mandatory when the image's
//!   metadata carries [`ModuleFlags::FINI_REQUIRED`].
//!
//! The metadata record (`hearth_module_metadata`) is optional. Images without one are treated as
//! version [`ABI_VERSION`] with no flags. The [`hearth_extension!`] macro emits all three symbols.

#![deny(bare_trait_objects)]

mod metadata;
mod ordinal;

pub use crate::metadata::{
    ModuleFlags, ModuleMetadata, ABI_VERSION, FINI_REQUIRED_BIT, METADATA_SYMBOL,
};
pub use crate::ordinal::{FiniFn, InitFn, Ordinal, ORDINAL_SYMBOL_PREFIX};

/// Emit the exported entry points of an extension image.
///
/// ```ignore
/// fn init() { /* register types */ }
/// fn fini() -> i32 { 0 }
///
/// hearth_module::hearth_extension!(init: init, fini: fini);
/// ```
///
/// Supplying a finalizer also marks it mandatory in the exported metadata.
#[macro_export]
macro_rules! hearth_extension {
    (init: $init:path) => {
        #[no_mangle]
        pub extern "C" fn hearth_ordinal_1() {
            $init()
        }
    };
    (init: $init:path, fini: $fini:path) => {
        $crate::hearth_extension!(init: $init);

        #[no_mangle]
        pub extern "C" fn hearth_ordinal_2() -> ::std::os::raw::c_int {
            $fini()
        }

        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static hearth_module_metadata: $crate::ModuleMetadata =
            $crate::ModuleMetadata::new($crate::FINI_REQUIRED_BIT);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn init() {
        INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn fini() -> i32 {
        7
    }

    mod image {
        crate::hearth_extension!(init: super::init, fini: super::fini);
    }

    #[test]
    fn extension_macro_exports_entry_points() {
        image::hearth_ordinal_1();
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(image::hearth_ordinal_2(), 7);
        assert!(image::hearth_module_metadata.fini_required());
        assert_eq!(image::hearth_module_metadata.abi_version, ABI_VERSION);
    }
}
