//! Process-wide table of live instances, and the per-thread bindings that resolve "the current
//! instance" for code running on a thread.
//!
//! A thread may be bound to several instances at once; the most recently bound or activated one
//! is the active binding, and is what [`GlobalStateRegistry::current`] returns.

use crate::error::Error;
use crate::globals::{ExitHandler, GlobalsBlock, HeapAccount};
use crate::limits::Limits;
use crate::loader::ImageLoader;
use crate::runtime::{SavedState, ScriptRuntime};
use crate::thread;
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

lazy_static! {
    static ref REGISTRY: GlobalStateRegistry = GlobalStateRegistry::new();
}

/// The process-wide registry.
pub fn registry() -> &'static GlobalStateRegistry {
    &REGISTRY
}

thread_local! {
    // Last entry is the active binding.
    static BINDINGS: RefCell<Vec<ThreadBinding>> = RefCell::new(Vec::new());
}

/// Attachment of one OS thread to one instance.
pub struct ThreadBinding {
    globals: Weak<GlobalsBlock>,
    instance: InstanceId,
    pub(crate) exit_handlers: Vec<ExitHandler>,
    pub(crate) saved_state: Option<SavedState>,
}

impl ThreadBinding {
    fn new(block: &Arc<GlobalsBlock>) -> ThreadBinding {
        block.note_bound();
        ThreadBinding {
            globals: Arc::downgrade(block),
            instance: block.id(),
            exit_handlers: vec![],
            saved_state: None,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }
}

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        if let Some(block) = self.globals.upgrade() {
            block.note_unbound();
        }
    }
}

pub struct GlobalStateRegistry {
    next_id: AtomicU64,
    blocks: RwLock<HashMap<InstanceId, Arc<GlobalsBlock>>>,
}

impl GlobalStateRegistry {
    fn new() -> Self {
        GlobalStateRegistry {
            next_id: AtomicU64::new(1),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a globals block for a new instance and bind it to the calling thread.
    ///
    /// The instance's lease is held by the caller when this returns. On failure nothing has been
    /// registered and the caller's bindings are unchanged.
    pub fn create_instance(
        &self,
        runtime: Arc<dyn ScriptRuntime>,
        loader: Arc<dyn ImageLoader>,
        limits: Limits,
    ) -> Result<Arc<GlobalsBlock>, Error> {
        limits.validate()?;
        let heap = HeapAccount::reserve(limits.heap_size)?;
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let block = Arc::new(GlobalsBlock::new(
            id,
            thread::current_ident(),
            runtime,
            loader,
            limits,
            heap,
        ));
        BINDINGS.with(|b| b.borrow_mut().push(ThreadBinding::new(&block)));
        self.blocks.write().unwrap().insert(id, block.clone());
        tracing::debug!("allocated globals for {}", id);
        Ok(block)
    }

    /// Attach the calling thread to an existing instance and make it the active binding.
    pub fn bind_thread(&self, id: InstanceId) -> Result<Arc<GlobalsBlock>, Error> {
        let block = self.lookup(id)?;
        if !switch_to(id) {
            BINDINGS.with(|b| b.borrow_mut().push(ThreadBinding::new(&block)));
        }
        Ok(block)
    }

    /// The globals block of the calling thread's active binding.
    ///
    /// Aborts the process if the thread is not bound to a live instance.
    pub fn current(&self) -> Arc<GlobalsBlock> {
        match self.try_current() {
            Some(block) => block,
            None => contract_violation!(
                "runtime called from {} which is not bound to any instance",
                thread::current_ident()
            ),
        }
    }

    pub fn try_current(&self) -> Option<Arc<GlobalsBlock>> {
        BINDINGS
            .try_with(|b| b.borrow().last().and_then(|b| b.globals.upgrade()))
            .ok()
            .flatten()
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        BINDINGS
            .try_with(|b| b.borrow().last().map(|b| b.instance))
            .ok()
            .flatten()
    }

    pub fn is_bound(&self, id: InstanceId) -> bool {
        BINDINGS.with(|b| b.borrow().iter().any(|b| b.instance == id))
    }

    /// Drop the calling thread's active binding. The previously active binding, if any, becomes
    /// active again.
    pub fn unbind_thread(&self) -> Option<InstanceId> {
        let binding = BINDINGS.with(|b| b.borrow_mut().pop());
        binding.map(|binding| binding.instance)
    }

    /// Make `id` the active binding of the calling thread until the returned guard is dropped.
    pub fn activate(&self, id: InstanceId) -> Result<Activation, Error> {
        let previous = self.current_instance();
        if previous == Some(id) {
            return Ok(Activation { previous: None });
        }
        if switch_to(id) {
            Ok(Activation { previous })
        } else {
            Err(Error::UnknownInstance(id))
        }
    }

    /// Free an instance's globals block and invalidate its id.
    ///
    /// The caller must hold the instance's lease and be the only thread bound to it; anything
    /// else aborts the process.
    pub fn destroy_instance(&self, id: InstanceId) -> Result<(), Error> {
        let block = self.lookup(id)?;
        contract_assert!(
            block.lease().is_held_by_current(),
            "{} destroyed without holding its execution lease",
            id
        );
        contract_assert!(
            self.is_bound(id) && block.bound_threads() == 1,
            "{} destroyed while {} threads are bound to it",
            id,
            block.bound_threads()
        );

        self.blocks.write().unwrap().remove(&id);
        let data = block.with_mut(std::mem::take);
        let binding = BINDINGS.with(|b| {
            let mut b = b.borrow_mut();
            let pos = b.iter().position(|b| b.instance == id);
            pos.map(|pos| b.remove(pos))
        });
        drop(binding);
        thread::forget_instance(id);
        block.lease().release();
        drop(data);
        tracing::debug!("freed globals for {}", id);
        Ok(())
    }

    pub fn lookup(&self, id: InstanceId) -> Result<Arc<GlobalsBlock>, Error> {
        self.blocks
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownInstance(id))
    }

    pub fn is_live(&self, id: InstanceId) -> bool {
        self.blocks.read().unwrap().contains_key(&id)
    }

    pub fn live_instances(&self) -> usize {
        self.blocks.read().unwrap().len()
    }
}

/// Restores the previously active binding when dropped.
#[must_use]
pub struct Activation {
    previous: Option<InstanceId>,
}

impl Drop for Activation {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            switch_to(previous);
        }
    }
}

/// Move the calling thread's binding for `id` to the active position, if there is one.
fn switch_to(id: InstanceId) -> bool {
    BINDINGS
        .try_with(|b| {
            let mut b = b.borrow_mut();
            match b.iter().position(|b| b.instance == id) {
                Some(pos) => {
                    let binding = b.remove(pos);
                    b.push(binding);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
}

/// Run `f` on the calling thread's binding for `id`.
pub(crate) fn with_binding<R, F: FnOnce(&mut ThreadBinding) -> R>(
    id: InstanceId,
    f: F,
) -> Option<R> {
    BINDINGS.with(|b| b.borrow_mut().iter_mut().find(|b| b.instance == id).map(f))
}

/// Park the runtime state of the calling thread for `id` until the next entry.
pub(crate) fn store_saved_state(id: InstanceId, state: SavedState) {
    let stored = with_binding(id, |b| {
        if b.saved_state.is_some() {
            return false;
        }
        b.saved_state = Some(state);
        true
    });
    match stored {
        Some(true) => (),
        Some(false) => contract_violation!(
            "runtime left twice on {} for {} without entering in between",
            thread::current_ident(),
            id
        ),
        None => contract_violation!("{} is not bound to {}", thread::current_ident(), id),
    }
}

pub(crate) fn take_saved_state(id: InstanceId) -> SavedState {
    match with_binding(id, |b| b.saved_state.take()) {
        Some(Some(state)) => state,
        Some(None) => contract_violation!(
            "no saved runtime state for {} on {}",
            id,
            thread::current_ident()
        ),
        None => contract_violation!("{} is not bound to {}", thread::current_ident(), id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::mock::MockLoader;
    use crate::test_helpers::NullRuntime;

    fn new_block() -> Arc<GlobalsBlock> {
        registry()
            .create_instance(
                Arc::new(NullRuntime),
                Arc::new(MockLoader::new()),
                Limits::default().with_heap_size(4096),
            )
            .expect("instance can be created")
    }

    #[test]
    fn create_binds_creator_with_lease_held() {
        let block = new_block();
        let id = block.id();
        assert!(block.lease().is_held_by_current());
        assert_eq!(registry().current().id(), id);
        assert_eq!(block.bound_threads(), 1);
        registry().destroy_instance(id).unwrap();
        assert!(matches!(
            registry().lookup(id),
            Err(Error::UnknownInstance(stale)) if stale == id
        ));
        assert!(registry().try_current().is_none());
    }

    #[test]
    fn failed_create_leaves_no_state() {
        let before = registry().current_instance();
        let res = registry().create_instance(
            Arc::new(NullRuntime),
            Arc::new(MockLoader::new()),
            Limits::default().with_heap_size(usize::MAX),
        );
        assert!(matches!(res, Err(Error::Allocation(usize::MAX))));
        assert_eq!(registry().current_instance(), before);
    }

    #[test]
    fn activation_switches_and_restores() {
        let a = new_block();
        let b = new_block();
        assert_eq!(registry().current().id(), b.id());
        {
            let _active = registry().activate(a.id()).unwrap();
            assert_eq!(registry().current().id(), a.id());
        }
        assert_eq!(registry().current().id(), b.id());
        assert_ne!(a.id(), b.id());

        registry().destroy_instance(b.id()).unwrap();
        assert_eq!(registry().current().id(), a.id());
        registry().destroy_instance(a.id()).unwrap();
    }

    #[test]
    fn bind_unknown_instance_fails() {
        let block = new_block();
        let id = block.id();
        registry().destroy_instance(id).unwrap();
        assert!(matches!(
            registry().bind_thread(id),
            Err(Error::UnknownInstance(_))
        ));
    }
}
