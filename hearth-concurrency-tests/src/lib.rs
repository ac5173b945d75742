//! Helpers shared by the interleaving tests.

use hearth_runtime::{thread, ExitStatus, InstanceBuilder, InstanceHandle, ThreadId, WaitPrimitive};
use hearth_runtime_tests::runtime::TestRuntime;
use std::sync::mpsc;
use std::sync::Arc;

pub fn new_instance() -> InstanceHandle {
    InstanceBuilder::new(Arc::new(TestRuntime::new()))
        .build()
        .expect("instance can be created")
}

/// Spawn a worker that waits on a primitive of its own, and return the primitive once the worker
/// has created it.
///
/// The home thread's lease is free when this returns, so the worker may already be waiting.
pub fn spawn_waiter(inst: &mut InstanceHandle) -> (ThreadId, Arc<WaitPrimitive>) {
    let (tx, rx) = mpsc::channel();
    let worker = inst
        .run_with(move || {
            thread::spawn(move || {
                let w = Arc::new(WaitPrimitive::new().expect("worker has a scheduler"));
                tx.send(w.clone()).expect("home thread is listening");
                w.wait().expect("wait completes");
            })
        })
        .expect("instance is live")
        .expect("worker can be spawned");
    let w = rx.recv().expect("worker sends its primitive");
    (worker, w)
}

pub fn join(inst: &mut InstanceHandle, worker: ThreadId) -> ExitStatus {
    inst.run_with(|| thread::wait_for_exit(worker))
        .expect("instance is live")
        .expect("worker can be joined")
}
