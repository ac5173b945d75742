use crate::error::ModuleError;
use crate::loader::{ImageLoader, NativeImage, OwnershipScope};
use hearth_module::{FiniFn, InitFn, ModuleMetadata, Ordinal, METADATA_SYMBOL};
use libloading::os::unix::{Library, Symbol};
use std::io::ErrorKind;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

/// Opens extension images as shared objects with the platform dynamic loader.
///
/// Thread-owned images are opened with `RTLD_LOCAL`; promoted images are reopened with
/// `RTLD_GLOBAL`, so that later images can link against their symbols.
#[derive(Clone, Copy, Debug, Default)]
pub struct DlLoader;

impl DlLoader {
    pub fn new() -> DlLoader {
        DlLoader
    }
}

fn dlopen_flags(scope: OwnershipScope) -> c_int {
    match scope {
        OwnershipScope::Thread(_) => libc::RTLD_NOW | libc::RTLD_LOCAL,
        OwnershipScope::Process => libc::RTLD_NOW | libc::RTLD_GLOBAL,
    }
}

fn open_library(path: &Path, scope: OwnershipScope) -> Result<DlImage, ModuleError> {
    let lib = unsafe { Library::open(Some(path), dlopen_flags(scope)) }.map_err(|e| {
        ModuleError::Loader {
            path: path.to_path_buf(),
            source: e.into(),
        }
    })?;
    Ok(DlImage {
        path: path.to_path_buf(),
        lib,
        scope,
    })
}

impl ImageLoader for DlLoader {
    fn open(
        &self,
        path: &Path,
        scope: OwnershipScope,
    ) -> Result<Box<dyn NativeImage>, ModuleError> {
        // canonicalize so that relative paths are not resolved against the loader's search path
        let abs = path.canonicalize().map_err(|e| match e.kind() {
            ErrorKind::NotFound => ModuleError::NotFound(path.to_path_buf()),
            _ => ModuleError::Loader {
                path: path.to_path_buf(),
                source: e.into(),
            },
        })?;
        let image = open_library(&abs, scope)?;
        tracing::debug!("opened {} ({:?})", abs.display(), scope);
        Ok(Box::new(image))
    }
}

pub struct DlImage {
    path: PathBuf,
    lib: Library,
    scope: OwnershipScope,
}

impl DlImage {
    fn symbol<T>(&self, name: &str) -> Option<Symbol<T>> {
        unsafe { self.lib.get::<T>(name.as_bytes()) }.ok()
    }
}

impl NativeImage for DlImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn scope(&self) -> OwnershipScope {
        self.scope
    }

    fn metadata(&self) -> Option<ModuleMetadata> {
        let sym = self.symbol::<*const ModuleMetadata>(METADATA_SYMBOL)?;
        let ptr: *const ModuleMetadata = *sym;
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { ptr.read_unaligned() })
        }
    }

    fn resolve_init(&self) -> Option<InitFn> {
        self.symbol::<InitFn>(&Ordinal::INIT.symbol_name())
            .map(|sym| *sym)
    }

    fn resolve_fini(&self) -> Option<FiniFn> {
        self.symbol::<FiniFn>(&Ordinal::FINI.symbol_name())
            .map(|sym| *sym)
    }

    fn reopen(&self, scope: OwnershipScope) -> Result<Box<dyn NativeImage>, ModuleError> {
        Ok(Box::new(open_library(&self.path, scope)?))
    }

    fn close(self: Box<Self>) -> Result<(), ModuleError> {
        let DlImage { path, lib, .. } = *self;
        lib.close().map_err(|e| ModuleError::Loader {
            path,
            source: e.into(),
        })
    }
}
