//! Loading and unloading of native extension images.
//!
//! Loaded images are kept per instance, in load order, and finalized in reverse order when the
//! instance is torn down. An image loaded by a worker thread is owned by that thread until it is
//! promoted to process-wide ownership; an unpromoted image is released when its thread exits.

pub mod dl;
pub mod mock;

pub use self::dl::DlLoader;
pub use self::mock::{MockImageBuilder, MockLoader};

use crate::error::{Error, ModuleError};
use crate::globals::GlobalsBlock;
use crate::registry::{registry, InstanceId};
use crate::thread::{self, ThreadId};
use hearth_module::{FiniFn, InitFn, ModuleMetadata, Ordinal, ABI_VERSION};
use std::fmt;
use std::path::{Path, PathBuf};

/// Who keeps an opened image alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OwnershipScope {
    /// Released when the thread exits.
    Thread(ThreadId),
    /// Kept until explicitly closed.
    Process,
}

/// An opened native image.
pub trait NativeImage: Send {
    fn path(&self) -> &Path;

    fn scope(&self) -> OwnershipScope;

    /// The image's metadata record, if it exports one.
    fn metadata(&self) -> Option<ModuleMetadata>;

    fn resolve_init(&self) -> Option<InitFn>;

    fn resolve_fini(&self) -> Option<FiniFn>;

    /// Open another handle on the same image under `scope`.
    ///
    /// The image stays mapped, and its entry points valid, for as long as either handle is open.
    fn reopen(&self, scope: OwnershipScope) -> Result<Box<dyn NativeImage>, ModuleError>;

    fn close(self: Box<Self>) -> Result<(), ModuleError>;
}

/// The platform mechanism used to open native images.
pub trait ImageLoader: Send + Sync {
    fn open(&self, path: &Path, scope: OwnershipScope)
        -> Result<Box<dyn NativeImage>, ModuleError>;
}

/// Names one loaded image of one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    instance: InstanceId,
    index: u64,
}

impl ModuleHandle {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{} of {}", self.index, self.instance)
    }
}

pub struct LoadedModuleHandle {
    handle: ModuleHandle,
    image: Box<dyn NativeImage>,
    init_entry: InitFn,
    fini_entry: Option<FiniFn>,
}

impl LoadedModuleHandle {
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn path(&self) -> &Path {
        self.image.path()
    }

    pub fn scope(&self) -> OwnershipScope {
        self.image.scope()
    }

    pub fn has_finalizer(&self) -> bool {
        self.fini_entry.is_some()
    }

    /// Run the finalizer, if any, then close the image.
    fn finalize(self, errors: &mut Vec<ModuleError>) {
        let path = self.image.path().to_path_buf();
        if let Some(fini) = self.fini_entry {
            let status = unsafe { fini() };
            if status != 0 {
                tracing::error!("finalizer of {} returned {}", path.display(), status);
                errors.push(ModuleError::FinalizerFailed {
                    path: path.clone(),
                    status,
                });
            }
        }
        if let Err(e) = self.image.close() {
            errors.push(e);
        }
        tracing::debug!("finalized {}", path.display());
    }
}

fn discard(image: Box<dyn NativeImage>) {
    let path = image.path().to_path_buf();
    if let Err(e) = image.close() {
        tracing::warn!("failed to close {}: {}", path.display(), e);
    }
}

fn promote_image(image: Box<dyn NativeImage>) -> Result<Box<dyn NativeImage>, ModuleError> {
    let promoted = image.reopen(OwnershipScope::Process)?;
    image.close()?;
    Ok(promoted)
}

/// Open the image at `path` for the calling thread's instance and resolve its entry points.
///
/// Must be called from runtime code. On failure nothing is registered and the image is closed.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ModuleHandle, Error> {
    let path = path.as_ref();
    let block = registry().current();
    contract_assert!(
        block.lease().is_held_by_current(),
        "extension loaded without holding the execution lease of {}",
        block.id()
    );

    let me = thread::current_ident();
    let scope = if me == block.home_thread() {
        OwnershipScope::Process
    } else {
        OwnershipScope::Thread(me)
    };
    let image = block.loader().open(path, scope)?;

    let metadata = image.metadata().unwrap_or_default();
    if metadata.abi_version != ABI_VERSION {
        let path = image.path().to_path_buf();
        discard(image);
        return Err(ModuleError::AbiMismatch {
            path,
            found: metadata.abi_version,
            expected: ABI_VERSION,
        }
        .into());
    }

    let init_entry = match image.resolve_init() {
        Some(init) => init,
        None => return Err(bad_entry_point(image, Ordinal::INIT)),
    };
    let fini_entry = image.resolve_fini();
    if metadata.fini_required() && fini_entry.is_none() {
        return Err(bad_entry_point(image, Ordinal::FINI));
    }

    let image = match scope {
        OwnershipScope::Thread(_) if block.limits().promote_worker_loads => promote_image(image)?,
        _ => image,
    };

    let instance = block.id();
    let handle = block.with_mut(|g| {
        let handle = ModuleHandle {
            instance,
            index: g.next_module,
        };
        g.next_module += 1;
        g.loaded.push(LoadedModuleHandle {
            handle,
            image,
            init_entry,
            fini_entry,
        });
        handle
    });
    tracing::debug!("loaded {} as {}", path.display(), handle);
    Ok(handle)
}

fn bad_entry_point(image: Box<dyn NativeImage>, ordinal: Ordinal) -> Error {
    let path = image.path().to_path_buf();
    discard(image);
    ModuleError::BadEntryPoint { path, ordinal }.into()
}

/// Load the image at `path` and run its initializer.
///
/// Modules the initializer registers are recorded with the image's path as their origin.
pub fn import<P: AsRef<Path>>(path: P) -> Result<ModuleHandle, Error> {
    let handle = load(path)?;
    let block = registry().current();
    let (init, origin) = block.with_mut(|g| {
        let entry = g
            .loaded
            .iter()
            .find(|m| m.handle == handle)
            .map(|m| (m.init_entry, m.path().to_path_buf()));
        if let Some((_, origin)) = entry.as_ref() {
            g.loading_origin = Some(origin.clone());
        }
        entry
    })
    .ok_or(ModuleError::UnknownHandle(handle))?;

    tracing::debug!("initializing {}", origin.display());
    unsafe { init() };
    block.with_mut(|g| g.loading_origin = None);
    Ok(handle)
}

/// Give a loaded image process-wide ownership. Promoting an already promoted image does
/// nothing.
pub fn promote(handle: ModuleHandle) -> Result<(), Error> {
    let block = registry().current();
    let old = block.with_mut(|g| {
        let entry = g
            .loaded
            .iter_mut()
            .find(|m| m.handle == handle)
            .ok_or(ModuleError::UnknownHandle(handle))?;
        if entry.scope() == OwnershipScope::Process {
            return Ok(None);
        }
        let promoted = entry.image.reopen(OwnershipScope::Process)?;
        Ok::<_, ModuleError>(Some(std::mem::replace(&mut entry.image, promoted)))
    })?;
    if let Some(old) = old {
        tracing::debug!("promoted {}", old.path().display());
        old.close()?;
    }
    Ok(())
}

/// Ownership of a loaded image.
pub fn scope_of(handle: ModuleHandle) -> Result<OwnershipScope, Error> {
    let block = registry().current();
    block.with_mut(|g| {
        g.loaded
            .iter()
            .find(|m| m.handle == handle)
            .map(|m| m.scope())
            .ok_or_else(|| Error::from(ModuleError::UnknownHandle(handle)))
    })
}

/// Number of images loaded by the calling thread's instance.
pub fn loaded_count() -> usize {
    registry().current().with_mut(|g| g.loaded.len())
}

/// Paths of the images loaded by the calling thread's instance, in load order.
pub fn loaded_paths() -> Vec<PathBuf> {
    registry()
        .current()
        .with_mut(|g| g.loaded.iter().map(|m| m.path().to_path_buf()).collect())
}

/// Finalize and close every image of `block`, most recently loaded first.
///
/// Runs to completion regardless of failures, which are returned.
pub fn finalize_all(block: &GlobalsBlock) -> Vec<ModuleError> {
    let loaded = block.with_mut(|g| std::mem::take(&mut g.loaded));
    let mut errors = vec![];
    for entry in loaded.into_iter().rev() {
        entry.finalize(&mut errors);
    }
    errors
}

/// Finalize and close the images still owned by exiting thread `ident`.
pub(crate) fn release_thread_images(block: &GlobalsBlock, ident: ThreadId) -> Vec<ModuleError> {
    let owned = block.with_mut(|g| {
        let (owned, kept): (Vec<LoadedModuleHandle>, Vec<LoadedModuleHandle>) =
            std::mem::take(&mut g.loaded)
                .into_iter()
                .partition(|m| m.scope() == OwnershipScope::Thread(ident));
        g.loaded = kept;
        owned
    });
    let mut errors = vec![];
    for entry in owned.into_iter().rev() {
        tracing::warn!(
            "{} exited without promoting {}",
            ident,
            entry.path().display()
        );
        entry.finalize(&mut errors);
    }
    errors
}
