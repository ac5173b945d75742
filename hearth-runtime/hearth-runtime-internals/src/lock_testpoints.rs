//! Pause points compiled in with the `concurrent_testpoints` feature.
//!
//! Each [`Syncpoint`] is passed through unconditionally by the runtime. A test that calls
//! [`Syncpoint::wait_at`] turns the next pass into a stop: the thread reaching the point blocks
//! until the test resumes it through the returned [`SyncWaiter`]. This lets a test place a
//! second thread's action at an exact spot in the first thread's protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(5);

/// The test's handle on one armed [`Syncpoint`]. Consumed by waiting.
pub struct SyncWaiter {
    arrived: Arc<AtomicBool>,
    proceed: Arc<AtomicBool>,
}

impl SyncWaiter {
    /// Block until the point is reached, then let the stopped thread continue.
    pub fn wait(self) {
        self.wait_and_then(|| ())
    }

    /// Block until the point is reached, run `f` while the other thread is stopped there, then
    /// let it continue.
    pub fn wait_and_then<U, F: FnOnce() -> U>(self, f: F) -> U {
        let stopped = self.pause();
        let res = f();
        stopped.resume();
        res
    }

    /// Block until the point is reached and keep the other thread stopped. It stays stopped
    /// until `resume` is called.
    #[must_use]
    pub fn pause(self) -> Self {
        while !self.arrived.load(Ordering::SeqCst) {
            thread::sleep(POLL);
        }
        self
    }

    /// Let the stopped thread continue. Resuming before the point is reached disarms it.
    pub fn resume(self) {
        self.proceed.store(true, Ordering::SeqCst);
    }
}

pub struct Syncpoint {
    arrived: Arc<AtomicBool>,
    proceed: Arc<AtomicBool>,
}

impl Default for Syncpoint {
    fn default() -> Self {
        Syncpoint::new()
    }
}

impl Syncpoint {
    pub fn new() -> Self {
        Syncpoint {
            arrived: Arc::new(AtomicBool::new(false)),
            proceed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Arm the point: the next thread to `check` it stops there.
    pub fn wait_at(&self) -> SyncWaiter {
        self.arrived.store(false, Ordering::SeqCst);
        self.proceed.store(false, Ordering::SeqCst);
        SyncWaiter {
            arrived: self.arrived.clone(),
            proceed: self.proceed.clone(),
        }
    }

    pub fn check(&self) {
        self.arrived.store(true, Ordering::SeqCst);
        while !self.proceed.load(Ordering::SeqCst) {
            thread::sleep(POLL);
        }
    }
}

/// The pause points of one instance.
#[derive(Default)]
pub struct LockTestpoints {
    pub lease_before_acquire: Syncpoint,
    pub lease_after_acquire: Syncpoint,
    pub lease_before_release: Syncpoint,
    /// A waiter has registered its pending request but still holds the lease.
    pub wait_before_suspend: Syncpoint,
    /// A worker is bound to its instance but has not taken the lease yet.
    pub worker_after_bind: Syncpoint,
    pub worker_before_exit_handlers: Syncpoint,
}

impl LockTestpoints {
    pub fn new() -> Self {
        LockTestpoints::default()
    }
}
