//! The execution lease: at most one thread runs runtime code for an instance at a time.
//!
//! Threads take the lease through [`RuntimeEntry`], which also hands the thread's saved runtime
//! state back to the runtime, and give it up again whenever they are about to block
//! cooperatively ([`suspend_lease`]).

use crate::error::Error;
use crate::globals::GlobalsBlock;
use crate::registry::{self, registry, Activation};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

#[cfg(feature = "concurrent_testpoints")]
use crate::lock_testpoints::LockTestpoints;

pub struct ExecutionLease {
    state: Mutex<LeaseState>,
    released: Condvar,
    #[cfg(feature = "concurrent_testpoints")]
    pub lock_testpoints: Arc<LockTestpoints>,
}

struct LeaseState {
    holder: Option<thread::ThreadId>,
    waiters: usize,
}

impl ExecutionLease {
    fn with_holder(holder: Option<thread::ThreadId>) -> ExecutionLease {
        ExecutionLease {
            state: Mutex::new(LeaseState { holder, waiters: 0 }),
            released: Condvar::new(),
            #[cfg(feature = "concurrent_testpoints")]
            lock_testpoints: Arc::new(LockTestpoints::new()),
        }
    }

    pub fn new() -> ExecutionLease {
        ExecutionLease::with_holder(None)
    }

    pub(crate) fn new_held() -> ExecutionLease {
        ExecutionLease::with_holder(Some(thread::current().id()))
    }

    /// Block until the lease is free, then take it.
    ///
    /// Taking the lease again while already holding it is a contract violation, detected in
    /// debug builds.
    pub fn acquire(&self) {
        #[cfg(feature = "concurrent_testpoints")]
        self.lock_testpoints.lease_before_acquire.check();

        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if cfg!(debug_assertions) && state.holder == Some(me) {
            drop(state);
            contract_violation!("execution lease acquired twice by the same thread");
        }
        state.waiters += 1;
        while state.holder.is_some() {
            state = self.released.wait(state).unwrap();
        }
        state.waiters -= 1;
        state.holder = Some(me);
        drop(state);

        #[cfg(feature = "concurrent_testpoints")]
        self.lock_testpoints.lease_after_acquire.check();
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.holder.is_some() {
            return false;
        }
        state.holder = Some(thread::current().id());
        true
    }

    /// Give up the lease, waking at most one waiting thread.
    pub fn release(&self) {
        #[cfg(feature = "concurrent_testpoints")]
        self.lock_testpoints.lease_before_release.check();

        let mut state = self.state.lock().unwrap();
        if state.holder != Some(thread::current().id()) {
            drop(state);
            contract_violation!("execution lease released by a thread that does not hold it");
        }
        state.holder = None;
        drop(state);
        self.released.notify_one();
    }

    pub fn is_held_by_current(&self) -> bool {
        self.state.lock().unwrap().holder == Some(thread::current().id())
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().holder.is_some()
    }

    /// Number of threads blocked in `acquire`.
    pub fn waiters(&self) -> usize {
        self.state.lock().unwrap().waiters
    }
}

impl Default for ExecutionLease {
    fn default() -> Self {
        ExecutionLease::new()
    }
}

/// A thread's stay inside the runtime of one instance.
///
/// Creating a `RuntimeEntry` activates the thread's binding to the instance, takes the lease and
/// enters the runtime with the thread's saved state. Dropping it leaves the runtime, saves the
/// state and releases the lease.
pub struct RuntimeEntry {
    block: Arc<GlobalsBlock>,
    inside: bool,
    _activation: Activation,
}

impl RuntimeEntry {
    pub fn enter(block: Arc<GlobalsBlock>) -> Result<RuntimeEntry, Error> {
        let activation = registry().activate(block.id())?;
        block.lease().acquire();
        let state = registry::take_saved_state(block.id());
        block.runtime().enter(state);
        Ok(RuntimeEntry {
            block,
            inside: true,
            _activation: activation,
        })
    }

    pub fn block(&self) -> &Arc<GlobalsBlock> {
        &self.block
    }

    /// Leave the runtime but keep the lease, discarding this thread's runtime state.
    ///
    /// Used on the way to destroying an instance, which requires the lease.
    pub fn finish_holding_lease(mut self) -> Arc<GlobalsBlock> {
        self.inside = false;
        drop(self.block.runtime().leave());
        self.block.clone()
    }
}

impl Drop for RuntimeEntry {
    fn drop(&mut self) {
        if self.inside {
            let state = self.block.runtime().leave();
            registry::store_saved_state(self.block.id(), state);
            self.block.lease().release();
        }
    }
}

/// Run `f` with the calling thread's lease released and its runtime state saved.
///
/// If the thread is not inside the runtime, `f` simply runs. The lease is taken back before this
/// returns, including when `f` unwinds.
pub fn suspend_lease<R, F: FnOnce() -> R>(f: F) -> R {
    let block = match registry().try_current() {
        Some(block) if block.lease().is_held_by_current() => block,
        _ => return f(),
    };

    let state = block.runtime().leave();
    registry::store_saved_state(block.id(), state);
    block.lease().release();

    struct Resume(Arc<GlobalsBlock>);
    impl Drop for Resume {
        fn drop(&mut self) {
            self.0.lease().acquire();
            let state = registry::take_saved_state(self.0.id());
            self.0.runtime().enter(state);
        }
    }
    let _resume = Resume(block);

    f()
}

/// Run `f` inside the runtime of `block`, if the instance is still alive.
///
/// This is how deferred work, such as timer callbacks, gets back onto the lease.
pub(crate) fn with_lease<R, F: FnOnce() -> R>(block: &Weak<GlobalsBlock>, f: F) -> Option<R> {
    let block = block.upgrade()?;
    if !registry().is_live(block.id()) {
        return None;
    }
    if block.lease().is_held_by_current() {
        return Some(f());
    }
    let entry = match RuntimeEntry::enter(block) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::debug!("dropping deferred call: {}", e);
            return None;
        }
    };
    let res = f();
    drop(entry);
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn release_wakes_a_waiter() {
        let lease = Arc::new(ExecutionLease::new());
        lease.acquire();
        assert!(lease.is_held_by_current());

        let acquired = Arc::new(AtomicBool::new(false));
        let t = {
            let lease = lease.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                lease.acquire();
                acquired.store(true, Ordering::SeqCst);
                lease.release();
            })
        };

        while lease.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!acquired.load(Ordering::SeqCst));
        lease.release();
        t.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!lease.is_held());
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lease = ExecutionLease::new();
        assert!(lease.try_acquire());
        assert!(!lease.try_acquire());
        lease.release();
        assert!(lease.try_acquire());
        lease.release();
    }

    #[test]
    fn suspend_without_binding_just_runs() {
        assert_eq!(suspend_lease(|| 5), 5);
    }
}
