//! The host-facing side of an instance: creation, running scripts, and teardown.

use crate::error::{Error, ModuleError};
use crate::globals::{GlobalsBlock, TypeTable};
use crate::lease::RuntimeEntry;
use crate::limits::Limits;
use crate::loader::{self, DlLoader, ImageLoader};
use crate::registry::{self, registry, InstanceId};
use crate::runtime::{ScriptRuntime, ScriptStatus};
use crate::scheduler::{self, SchedulerGuard};
use crate::thread;
use std::any::Any;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

type TypeInit = Box<dyn FnOnce(&mut TypeTable) + Send>;

/// Configures and creates an instance.
///
/// ```ignore
/// let mut inst = InstanceBuilder::new(Arc::new(MyRuntime::new()))
///     .with_heap_size(4 * 1024 * 1024)
///     .build()?;
/// inst.run_script("main.py", &[])?;
/// inst.destroy()?;
/// ```
pub struct InstanceBuilder {
    runtime: Arc<dyn ScriptRuntime>,
    loader: Arc<dyn ImageLoader>,
    limits: Limits,
    types: Vec<TypeInit>,
}

impl InstanceBuilder {
    pub fn new(runtime: Arc<dyn ScriptRuntime>) -> Self {
        InstanceBuilder {
            runtime,
            loader: Arc::new(DlLoader::new()),
            limits: Limits::default(),
            types: vec![],
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.limits = self.limits.with_heap_size(heap_size);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ImageLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Seed the instance's type table with `value`.
    pub fn with_type_object<T: Any + Send>(mut self, value: T) -> Self {
        self.types.push(Box::new(move |types: &mut TypeTable| {
            types.insert(value);
        }));
        self
    }

    /// Create the instance on the calling thread, which becomes its home thread.
    ///
    /// The returned handle is idle: the instance's lease is free until the handle is used.
    pub fn build(self) -> Result<InstanceHandle, Error> {
        let scheduler = scheduler::install();
        let block = registry().create_instance(self.runtime, self.loader, self.limits)?;

        if let Err(e) = block.runtime().initialize() {
            tracing::error!("runtime failed to initialize for {}: {}", block.id(), e);
            registry().destroy_instance(block.id())?;
            return Err(e);
        }
        let types = self.types;
        block.with_mut(|g| {
            for init in types {
                init(&mut g.types);
            }
        });

        let state = block.runtime().leave();
        registry::store_saved_state(block.id(), state);
        block.lease().release();
        tracing::info!("created {} ({} byte heap)", block.id(), block.limits().heap_size);

        Ok(InstanceHandle {
            block,
            scheduler,
            destroyed: false,
        })
    }
}

/// Create an instance with a heap of `heap_size` bytes and the platform loader.
pub fn create_instance(
    heap_size: usize,
    runtime: Arc<dyn ScriptRuntime>,
) -> Result<InstanceHandle, Error> {
    InstanceBuilder::new(runtime)
        .with_heap_size(heap_size)
        .build()
}

/// Errors collected while tearing an instance down.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub finalizer_errors: Vec<ModuleError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.finalizer_errors.is_empty()
    }
}

/// A live instance, owned by its home thread.
///
/// Dropping the handle destroys the instance if [`destroy`](#method.destroy) has not already
/// done so. Workers still running at that point are waited for first, so a worker that never
/// finishes keeps the drop from returning.
pub struct InstanceHandle {
    block: Arc<GlobalsBlock>,
    scheduler: SchedulerGuard,
    destroyed: bool,
}

impl InstanceHandle {
    pub fn id(&self) -> InstanceId {
        self.block.id()
    }

    pub fn globals(&self) -> &Arc<GlobalsBlock> {
        &self.block
    }

    /// Run the script at `path` with `args` as its arguments.
    ///
    /// An error raised by the script is not an `Err`: it yields `ScriptStatus::Failed` and is
    /// kept for [`report_last_error`](#method.report_last_error).
    pub fn run_script<P: AsRef<Path>>(
        &mut self,
        path: P,
        args: &[&str],
    ) -> Result<ScriptStatus, Error> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::ScriptNotFound(path.to_path_buf()),
            _ => Error::ScriptUnreadable {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        let mut argv = vec![path.display().to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));

        let entry = RuntimeEntry::enter(self.block.clone())?;
        let res = self.block.runtime().run_script(&source, path, &argv);
        let status = match res {
            Ok(()) => ScriptStatus::Completed,
            Err(e) => {
                tracing::debug!("{} failed: {}", path.display(), e.message);
                self.block.with_mut(|g| g.last_error = Some(e));
                ScriptStatus::Failed
            }
        };
        drop(entry);
        Ok(status)
    }

    /// Run `f` as runtime code on the home thread.
    pub fn run_with<R, F: FnOnce() -> R>(&mut self, f: F) -> Result<R, Error> {
        let entry = RuntimeEntry::enter(self.block.clone())?;
        let res = f();
        drop(entry);
        Ok(res)
    }

    /// Take the error left by the last failed script, formatted by the runtime.
    pub fn report_last_error(&mut self) -> Result<Option<String>, Error> {
        let block = self.block.clone();
        self.run_with(|| {
            block
                .with_mut(|g| g.last_error.take())
                .map(|e| block.runtime().format_error(&e))
        })
        .map(|report| {
            if let Some(report) = report.as_ref() {
                tracing::warn!("{}", report);
            }
            report
        })
    }

    /// Run every completion that is ready on the home thread's loop. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let _active = registry().activate(self.id());
        self.scheduler.run_until_idle()
    }

    /// Run the home thread's loop for `duration`.
    pub fn run_for(&mut self, duration: Duration) {
        let _active = registry().activate(self.id());
        self.scheduler.run_for(duration)
    }

    /// Worker threads of this instance that have not finished.
    pub fn live_workers(&self) -> usize {
        thread::live_workers(self.id())
    }

    /// Tear the instance down: run its exit handlers, finalize its extension images, finalize
    /// the runtime, and free its globals.
    ///
    /// Fails with `InstanceBusy`, leaving the instance usable, while worker threads are still
    /// running. Once destroyed, every further use of the handle fails with `UnknownInstance`.
    pub fn destroy(&mut self) -> Result<TeardownReport, Error> {
        let id = self.id();
        if self.destroyed {
            return Err(Error::UnknownInstance(id));
        }
        let entry = RuntimeEntry::enter(self.block.clone())?;
        let busy = thread::live_workers(id);
        if busy > 0 {
            drop(entry);
            return Err(Error::InstanceBusy(busy));
        }

        let handlers = self.block.with_mut(|g| std::mem::take(&mut g.exit_handlers));
        thread::run_exit_handlers(handlers);
        let finalizer_errors = loader::finalize_all(&self.block);
        self.block.runtime().finalize();

        let block = entry.finish_holding_lease();
        registry().destroy_instance(block.id())?;
        self.destroyed = true;
        tracing::info!("destroyed {}", id);
        Ok(TeardownReport { finalizer_errors })
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        // workers may spawn more workers while we wait
        loop {
            let workers = thread::live_worker_ids(self.id());
            if workers.is_empty() {
                break;
            }
            tracing::info!(
                "waiting for {} workers of {} before teardown",
                workers.len(),
                self.id()
            );
            let joined = self.run_with(|| {
                workers
                    .into_iter()
                    .try_for_each(|worker| thread::wait_for_exit(worker).map(|_| ()))
            });
            if let Err(e) = joined.and_then(|r| r) {
                tracing::error!("failed to join workers of {}: {}", self.id(), e);
                break;
            }
        }
        if let Err(e) = self.destroy() {
            tracing::error!("failed to tear down {}: {}", self.id(), e);
        }
    }
}
