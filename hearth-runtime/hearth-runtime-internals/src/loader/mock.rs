use crate::error::ModuleError;
use crate::loader::{ImageLoader, NativeImage, OwnershipScope};
use hearth_module::{FiniFn, InitFn, ModuleMetadata, FINI_REQUIRED_BIT};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Describes an in-memory extension image served by a [`MockLoader`].
#[derive(Clone, Default)]
pub struct MockImageBuilder {
    init: Option<InitFn>,
    fini: Option<FiniFn>,
    metadata: Option<ModuleMetadata>,
    fail_close: bool,
}

impl MockImageBuilder {
    pub fn new() -> Self {
        MockImageBuilder::default()
    }

    pub fn with_init(mut self, init: InitFn) -> Self {
        self.init = Some(init);
        self
    }

    pub fn with_fini(mut self, fini: FiniFn) -> Self {
        self.fini = Some(fini);
        self
    }

    pub fn with_metadata(mut self, metadata: ModuleMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Declare the finalizer mandatory, whether or not one is supplied.
    pub fn with_fini_required(self) -> Self {
        self.with_metadata(ModuleMetadata::new(FINI_REQUIRED_BIT))
    }

    /// Make closing the image report an error.
    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

/// An [`ImageLoader`] serving images described by [`MockImageBuilder`]s, keyed by path.
///
/// Every handle it hands out is counted until it is closed or dropped, so tests can check that
/// nothing leaks.
#[derive(Default)]
pub struct MockLoader {
    images: Mutex<HashMap<PathBuf, MockImageBuilder>>,
    open_handles: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

impl MockLoader {
    pub fn new() -> Self {
        MockLoader::default()
    }

    pub fn with_image<P: Into<PathBuf>>(self, path: P, image: MockImageBuilder) -> Self {
        self.add_image(path, image);
        self
    }

    pub fn add_image<P: Into<PathBuf>>(&self, path: P, image: MockImageBuilder) {
        self.images.lock().unwrap().insert(path.into(), image);
    }

    /// Handles currently open, across all images.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Total number of successful opens through this loader, reopens included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn handle(&self, path: &Path, desc: MockImageBuilder, scope: OwnershipScope) -> MockImage {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        MockImage {
            path: path.to_path_buf(),
            desc,
            scope,
            open_handles: self.open_handles.clone(),
            opens: self.opens.clone(),
        }
    }
}

impl ImageLoader for MockLoader {
    fn open(
        &self,
        path: &Path,
        scope: OwnershipScope,
    ) -> Result<Box<dyn NativeImage>, ModuleError> {
        let desc = self
            .images
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound(path.to_path_buf()))?;
        Ok(Box::new(self.handle(path, desc, scope)))
    }
}

struct MockImage {
    path: PathBuf,
    desc: MockImageBuilder,
    scope: OwnershipScope,
    open_handles: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

impl NativeImage for MockImage {
    fn path(&self) -> &Path {
        &self.path
    }

    fn scope(&self) -> OwnershipScope {
        self.scope
    }

    fn metadata(&self) -> Option<ModuleMetadata> {
        self.desc.metadata
    }

    fn resolve_init(&self) -> Option<InitFn> {
        self.desc.init
    }

    fn resolve_fini(&self) -> Option<FiniFn> {
        self.desc.fini
    }

    fn reopen(&self, scope: OwnershipScope) -> Result<Box<dyn NativeImage>, ModuleError> {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockImage {
            path: self.path.clone(),
            desc: self.desc.clone(),
            scope,
            open_handles: self.open_handles.clone(),
            opens: self.opens.clone(),
        }))
    }

    fn close(self: Box<Self>) -> Result<(), ModuleError> {
        if self.desc.fail_close {
            return Err(ModuleError::Loader {
                path: self.path.clone(),
                source: anyhow::format_err!("mock image refused to close"),
            });
        }
        Ok(())
    }
}

impl Drop for MockImage {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn init() {}

    #[test]
    fn counts_open_handles() {
        let loader = MockLoader::new().with_image("a.so", MockImageBuilder::new().with_init(init));
        let image = loader
            .open(Path::new("a.so"), OwnershipScope::Process)
            .unwrap();
        assert_eq!(loader.open_handles(), 1);
        let again = image.reopen(OwnershipScope::Process).unwrap();
        assert_eq!(loader.open_handles(), 2);
        assert_eq!(loader.opens(), 2);
        image.close().unwrap();
        again.close().unwrap();
        assert_eq!(loader.open_handles(), 0);
        assert!(matches!(
            loader.open(Path::new("b.so"), OwnershipScope::Process),
            Err(ModuleError::NotFound(_))
        ));
    }
}
