//! Per-instance storage for everything the embedded runtime would otherwise keep in process-wide
//! statics.
//!
//! Each live instance owns exactly one [`GlobalsBlock`]. Its mutable contents ([`GlobalsData`])
//! are only reachable through [`GlobalsBlock::with_mut`], which checks that the calling thread
//! holds the instance's execution lease.

use crate::error::Error;
use crate::lease::ExecutionLease;
use crate::limits::Limits;
use crate::loader::{ImageLoader, LoadedModuleHandle};
use crate::registry::InstanceId;
use crate::runtime::{ScriptError, ScriptRuntime};
use crate::thread::ThreadId;
use std::any::{Any, TypeId};
use std::cell::UnsafeCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "concurrent_testpoints")]
use crate::lock_testpoints::LockTestpoints;

/// A handler run once when its thread, or its instance, shuts down.
pub type ExitHandler = Box<dyn FnOnce() + Send>;

pub struct GlobalsBlock {
    id: InstanceId,
    home: ThreadId,
    lease: ExecutionLease,
    runtime: Arc<dyn ScriptRuntime>,
    loader: Arc<dyn ImageLoader>,
    limits: Limits,
    bound: AtomicUsize,
    borrowed: AtomicBool,
    data: UnsafeCell<GlobalsData>,
}

// `data` is only handed out by `with_mut`, which requires the execution lease and rejects
// re-entrant borrows.
unsafe impl Sync for GlobalsBlock {}

impl GlobalsBlock {
    /// A new block whose lease is held by the calling thread.
    pub(crate) fn new(
        id: InstanceId,
        home: ThreadId,
        runtime: Arc<dyn ScriptRuntime>,
        loader: Arc<dyn ImageLoader>,
        limits: Limits,
        heap: HeapAccount,
    ) -> GlobalsBlock {
        GlobalsBlock {
            id,
            home,
            lease: ExecutionLease::new_held(),
            runtime,
            loader,
            limits,
            bound: AtomicUsize::new(0),
            borrowed: AtomicBool::new(false),
            data: UnsafeCell::new(GlobalsData {
                heap,
                ..GlobalsData::default()
            }),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The thread that created the instance.
    pub fn home_thread(&self) -> ThreadId {
        self.home
    }

    pub fn lease(&self) -> &ExecutionLease {
        &self.lease
    }

    pub fn runtime(&self) -> &Arc<dyn ScriptRuntime> {
        &self.runtime
    }

    pub fn loader(&self) -> &Arc<dyn ImageLoader> {
        &self.loader
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Number of threads currently bound to this block.
    pub fn bound_threads(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    pub(crate) fn note_bound(&self) {
        self.bound.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn note_unbound(&self) {
        self.bound.fetch_sub(1, Ordering::SeqCst);
    }

    #[cfg(feature = "concurrent_testpoints")]
    pub fn lock_testpoints(&self) -> &Arc<LockTestpoints> {
        &self.lease.lock_testpoints
    }

    /// Run `f` with exclusive access to the block's mutable contents.
    ///
    /// Aborts the process if the calling thread does not hold the lease, or if it is already
    /// inside `with_mut` for this block. `f` must not call back into anything that touches the
    /// same block, such as module initializers or exit handlers.
    pub fn with_mut<R, F: FnOnce(&mut GlobalsData) -> R>(&self, f: F) -> R {
        contract_assert!(
            self.lease.is_held_by_current(),
            "globals of {} touched without holding its execution lease",
            self.id
        );
        if self.borrowed.swap(true, Ordering::Acquire) {
            contract_violation!("re-entrant access to the globals of {}", self.id);
        }

        struct Unborrow<'a>(&'a AtomicBool);
        impl Drop for Unborrow<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _unborrow = Unborrow(&self.borrowed);

        f(unsafe { &mut *self.data.get() })
    }
}

impl fmt::Debug for GlobalsBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalsBlock")
            .field("id", &self.id)
            .field("home", &self.home)
            .field("bound", &self.bound_threads())
            .finish()
    }
}

/// The mutable contents of a [`GlobalsBlock`].
#[derive(Default)]
pub struct GlobalsData {
    pub build: BuildInfo,
    pub types: TypeTable,
    pub modules: ModuleTable,
    pub last_error: Option<ScriptError>,
    pub heap: HeapAccount,
    pub(crate) loaded: Vec<LoadedModuleHandle>,
    pub(crate) exit_handlers: Vec<ExitHandler>,
    pub(crate) next_module: u64,
    pub(crate) loading_origin: Option<PathBuf>,
}

impl GlobalsData {
    /// Path of the extension image whose initializer is running, if any.
    pub fn loading_origin(&self) -> Option<&Path> {
        self.loading_origin.as_deref()
    }

    pub fn exit_handler_count(&self) -> usize {
        self.exit_handlers.len()
    }
}

/// Version and platform strings reported to scripts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub os: &'static str,
    pub arch: &'static str,
}

impl BuildInfo {
    pub const fn current() -> BuildInfo {
        BuildInfo {
            version: env!("CARGO_PKG_VERSION"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    pub fn version_string(&self) -> String {
        format!("hearth {} ({}-{})", self.version, self.arch, self.os)
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        BuildInfo::current()
    }
}

/// Singleton objects keyed by their Rust type.
#[derive(Default)]
pub struct TypeTable {
    objects: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl TypeTable {
    /// Store `value`, returning the previous object of the same type.
    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.objects
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.objects
            .get(&TypeId::of::<T>())
            .and_then(|obj| obj.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.objects
            .get_mut(&TypeId::of::<T>())
            .and_then(|obj| obj.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.objects
            .remove(&TypeId::of::<T>())
            .and_then(|obj| obj.downcast::<T>().ok())
            .map(|obj| *obj)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Script-visible modules registered with the instance.
#[derive(Debug, Default)]
pub struct ModuleTable {
    entries: BTreeMap<String, ModuleRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRecord {
    /// The extension image that registered the module, if it came from one.
    pub origin: Option<PathBuf>,
}

impl ModuleTable {
    /// Register `name`, replacing any earlier registration under the same name.
    pub fn register<S: Into<String>>(&mut self, name: S, origin: Option<PathBuf>) {
        self.entries.insert(name.into(), ModuleRecord { origin });
    }

    pub fn get(&self, name: &str) -> Option<&ModuleRecord> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bookkeeping for the instance's heap arena.
///
/// The arena is reserved in full when the instance is created, so that running out of memory
/// surfaces at creation rather than partway through a script.
#[derive(Default)]
pub struct HeapAccount {
    arena: Vec<u8>,
    used: usize,
    peak: usize,
}

impl HeapAccount {
    pub(crate) fn reserve(size: usize) -> Result<HeapAccount, Error> {
        let mut arena = Vec::new();
        arena
            .try_reserve_exact(size)
            .map_err(|_| Error::Allocation(size))?;
        Ok(HeapAccount {
            arena,
            used: 0,
            peak: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    /// Account for `bytes` more of the arena being in use.
    pub fn charge(&mut self, bytes: usize) -> Result<(), Error> {
        if bytes > self.available() {
            return Err(Error::Allocation(bytes));
        }
        self.used += bytes;
        self.peak = self.peak.max(self.used);
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }
}

impl fmt::Debug for HeapAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAccount")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("peak", &self.peak)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_account_charges_within_capacity() {
        let mut heap = HeapAccount::reserve(1024).unwrap();
        assert!(heap.capacity() >= 1024);
        heap.charge(1000).unwrap();
        assert!(matches!(heap.charge(heap.available() + 1), Err(Error::Allocation(_))));
        heap.release(600);
        assert_eq!(heap.used(), 400);
        assert_eq!(heap.peak(), 1000);
    }

    #[test]
    fn heap_reservation_failure_is_an_allocation_error() {
        assert!(matches!(
            HeapAccount::reserve(usize::MAX),
            Err(Error::Allocation(usize::MAX))
        ));
    }

    #[test]
    fn type_table_is_keyed_by_type() {
        struct Counter(u32);
        let mut types = TypeTable::default();
        assert!(types.insert(Counter(1)).is_none());
        assert!(types.insert(String::from("str")).is_none());
        types.get_mut::<Counter>().unwrap().0 += 1;
        assert_eq!(types.get::<Counter>().map(|c| c.0), Some(2));
        assert_eq!(types.remove::<String>().as_deref(), Some("str"));
        assert_eq!(types.len(), 1);
    }

    #[test]
    fn module_table_replaces_by_name() {
        let mut modules = ModuleTable::default();
        modules.register("e32", None);
        modules.register("e32", Some(PathBuf::from("/ext/e32.so")));
        assert_eq!(modules.len(), 1);
        assert_eq!(
            modules.get("e32").and_then(|m| m.origin.clone()),
            Some(PathBuf::from("/ext/e32.so"))
        );
    }

    #[test]
    fn version_string_names_platform() {
        let info = BuildInfo::current();
        let s = info.version_string();
        assert!(s.starts_with("hearth "));
        assert!(s.contains(std::env::consts::OS));
    }
}
