//! Logical threads for script code.
//!
//! Every logical thread is a real OS thread with its own cooperative loop. A worker binds itself
//! to the instance of the thread that spawned it, and takes that instance's execution lease
//! before running any runtime code. Joining is cooperative: [`wait_for_exit`] suspends the
//! caller's lease and runs its loop until the worker has fully torn down.

use crate::error::Error;
use crate::globals::ExitHandler;
use crate::lease::{suspend_lease, RuntimeEntry};
use crate::loader;
use crate::registry::{self, registry, InstanceId};
use crate::runtime::SavedState;
use crate::scheduler::{self, Completion, Remote, RequestId};
use lazy_static::lazy_static;
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identity of a thread, as seen by script code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> ThreadId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

thread_local! {
    static IDENT: Cell<Option<ThreadId>> = Cell::new(None);
}

/// The identity of the calling thread, assigned on first use.
pub fn current_ident() -> ThreadId {
    IDENT.with(|ident| match ident.get() {
        Some(id) => id,
        None => {
            let id = ThreadId::next();
            ident.set(Some(id));
            id
        }
    })
}

/// How a worker thread ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// The entry function returned.
    Returned,
    /// The worker called [`exit_thread`].
    Exited,
    /// The entry function panicked.
    Panicked(String),
    /// The worker could not bind to its instance, which was destroyed before it started.
    BindFailed,
}

struct WorkerRecord {
    instance: InstanceId,
    state: Mutex<WorkerState>,
}

#[derive(Default)]
struct WorkerState {
    status: Option<ExitStatus>,
    joiners: Vec<(Remote, RequestId)>,
}

lazy_static! {
    static ref WORKERS: Mutex<HashMap<ThreadId, Arc<WorkerRecord>>> = Mutex::new(HashMap::new());
}

/// Unwind payload used by [`exit_thread`].
struct ThreadExit;

/// End the calling worker thread. Its exit handlers still run.
///
/// Calling this from a thread that was not started with [`spawn`] aborts the process.
pub fn exit_thread() -> ! {
    let me = current_ident();
    if !WORKERS.lock().unwrap().contains_key(&me) {
        contract_violation!("exit_thread called on {} which is not a worker", me);
    }
    panic::resume_unwind(Box::new(ThreadExit))
}

/// Start a worker thread running `entry` inside the calling thread's instance.
///
/// Must be called from runtime code, with the instance's lease held.
pub fn spawn<F>(entry: F) -> Result<ThreadId, Error>
where
    F: FnOnce() + Send + 'static,
{
    let parent = registry().current();
    contract_assert!(
        parent.lease().is_held_by_current(),
        "spawn called without holding the execution lease of {}",
        parent.id()
    );

    let ident = ThreadId::next();
    let instance = parent.id();
    let state = parent.runtime().new_thread_state();
    let record = Arc::new(WorkerRecord {
        instance,
        state: Mutex::new(WorkerState::default()),
    });
    WORKERS.lock().unwrap().insert(ident, record.clone());

    let res = std::thread::Builder::new()
        .name(format!("hearth-worker-{}", ident.0))
        .stack_size(parent.limits().worker_stack_size)
        .spawn(move || worker_main(ident, instance, state, record, entry));
    match res {
        Ok(_) => {
            tracing::debug!("{} spawned {}", current_ident(), ident);
            Ok(ident)
        }
        Err(e) => {
            WORKERS.lock().unwrap().remove(&ident);
            Err(Error::ResourceExhausted(e))
        }
    }
}

fn worker_main<F: FnOnce()>(
    ident: ThreadId,
    instance: InstanceId,
    state: SavedState,
    record: Arc<WorkerRecord>,
    entry: F,
) {
    IDENT.with(|id| id.set(Some(ident)));
    let status = run_worker(ident, instance, state, entry);
    tracing::debug!("{} exited: {:?}", ident, status);

    let joiners = {
        let mut st = record.state.lock().unwrap();
        st.status = Some(status);
        std::mem::take(&mut st.joiners)
    };
    for (remote, id) in joiners {
        // a joiner whose loop is gone has nobody left to tell
        let _ = remote.complete(id, Completion::Done);
    }
}

fn run_worker<F: FnOnce()>(
    ident: ThreadId,
    instance: InstanceId,
    state: SavedState,
    entry: F,
) -> ExitStatus {
    let block = match registry().bind_thread(instance) {
        Ok(block) => block,
        Err(e) => {
            tracing::warn!("{} could not bind: {}", ident, e);
            return ExitStatus::BindFailed;
        }
    };
    registry::store_saved_state(instance, state);

    #[cfg(feature = "concurrent_testpoints")]
    block.lock_testpoints().worker_after_bind.check();

    let sched = scheduler::install();
    let status = {
        let entry_guard = match RuntimeEntry::enter(block.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("{} could not enter the runtime: {}", ident, e);
                drop(sched);
                registry().unbind_thread();
                return ExitStatus::BindFailed;
            }
        };

        let status = match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => ExitStatus::Returned,
            Err(payload) => exit_status_of(payload),
        };

        #[cfg(feature = "concurrent_testpoints")]
        block.lock_testpoints().worker_before_exit_handlers.check();

        let handlers = registry::with_binding(instance, |b| std::mem::take(&mut b.exit_handlers))
            .unwrap_or_default();
        run_exit_handlers(handlers);
        for err in loader::release_thread_images(&block, ident) {
            tracing::warn!("{}: {}", ident, err);
        }
        drop(entry_guard);
        status
    };
    drop(sched);
    registry().unbind_thread();
    status
}

fn exit_status_of(payload: Box<dyn Any + Send>) -> ExitStatus {
    if payload.is::<ThreadExit>() {
        ExitStatus::Exited
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        ExitStatus::Panicked(msg.to_string())
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        ExitStatus::Panicked(msg.clone())
    } else {
        ExitStatus::Panicked(String::from("non-string panic payload"))
    }
}

/// Run exit handlers most recently registered first. A panicking handler does not stop the rest.
pub(crate) fn run_exit_handlers(handlers: Vec<ExitHandler>) {
    for handler in handlers.into_iter().rev() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(handler)) {
            tracing::error!("exit handler failed: {:?}", exit_status_of(payload));
        }
    }
}

/// Suspend the caller until worker `target` has torn down, and return how it ended.
///
/// A worker can be waited for once.
pub fn wait_for_exit(target: ThreadId) -> Result<ExitStatus, Error> {
    if target == current_ident() {
        return Err(Error::InvalidArgument("a thread cannot wait for its own exit"));
    }
    let record = WORKERS
        .lock()
        .unwrap()
        .get(&target)
        .cloned()
        .ok_or(Error::UnknownThread(target))?;

    let flag = {
        let mut st = record.state.lock().unwrap();
        if st.status.is_some() {
            None
        } else {
            let sched = scheduler::current().ok_or(Error::NoScheduler)?;
            let (id, flag) = sched.request_flag();
            st.joiners.push((sched.remote(), id));
            Some((sched, flag))
        }
    };
    if let Some((sched, flag)) = flag {
        suspend_lease(|| sched.wait_flag(&flag));
    }

    let status = record.state.lock().unwrap().status.clone();
    match status {
        Some(status) => {
            WORKERS.lock().unwrap().remove(&target);
            Ok(status)
        }
        None => {
            hearth_bail!("{} woke from joining {} before it exited", current_ident(), target);
        }
    }
}

/// Number of workers of `instance` that have not finished tearing down.
pub fn live_workers(instance: InstanceId) -> usize {
    WORKERS
        .lock()
        .unwrap()
        .values()
        .filter(|r| r.instance == instance && r.state.lock().unwrap().status.is_none())
        .count()
}

/// Workers of `instance` that have not finished tearing down.
pub fn live_worker_ids(instance: InstanceId) -> Vec<ThreadId> {
    WORKERS
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, r)| r.instance == instance && r.state.lock().unwrap().status.is_none())
        .map(|(id, _)| *id)
        .collect()
}

/// Forget the exit records of a destroyed instance's workers.
pub(crate) fn forget_instance(instance: InstanceId) {
    WORKERS
        .lock()
        .unwrap()
        .retain(|_, r| r.instance != instance);
}

/// Register `handler` to run when the calling thread shuts down.
///
/// On the instance's home thread handlers are kept with the instance and run when it is
/// destroyed; on a worker they run when the worker exits. Either way they run most recently
/// registered first.
pub fn register_exit_handler<F: FnOnce() + Send + 'static>(handler: F) -> Result<(), Error> {
    let block = registry().current();
    let limit = block.limits().max_exit_handlers;
    let push = move |handlers: &mut Vec<ExitHandler>| {
        if handlers.len() >= limit {
            bail_limits_exceeded!("at most {} exit handlers may be registered", limit);
        }
        handlers.push(Box::new(handler));
        Ok(())
    };
    if current_ident() == block.home_thread() {
        block.with_mut(|g| push(&mut g.exit_handlers))
    } else {
        registry::with_binding(block.id(), |b| push(&mut b.exit_handlers))
            .unwrap_or_else(|| Err(Error::UnknownInstance(block.id())))
    }
}

/// The instance the calling worker belongs to, if it is a worker.
pub fn worker_instance(ident: ThreadId) -> Option<InstanceId> {
    WORKERS.lock().unwrap().get(&ident).map(|r| r.instance)
}
