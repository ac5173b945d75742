//! Cross-thread calls into a thread's loop.
//!
//! A [`CallGate`] lives on its owner thread and wraps a callback. Any thread holding a
//! [`GateCaller`] can queue an argument for it; the owner's loop then runs the callback, inside
//! the runtime of the owner's instance, once per queued argument and in call order.

use crate::error::Error;
use crate::globals::GlobalsBlock;
use crate::lease::with_lease;
use crate::registry::registry;
use crate::scheduler::{self, Completion, Remote, RequestId, Scheduler};
use crate::thread::ThreadId;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};

struct GateState<T> {
    queue: VecDeque<T>,
    armed: Option<RequestId>,
    closed: bool,
}

struct GateShared<T> {
    remote: Remote,
    state: Mutex<GateState<T>>,
}

pub struct CallGate<T: Send + 'static> {
    shared: Arc<GateShared<T>>,
    scheduler: Rc<Scheduler>,
}

impl<T: Send + 'static> CallGate<T> {
    /// Create a gate on the calling thread, which must be bound to an instance and have a
    /// scheduler installed.
    pub fn new<F: FnMut(T) + 'static>(callback: F) -> Result<CallGate<T>, Error> {
        let scheduler = scheduler::current().ok_or(Error::NoScheduler)?;
        let block = Arc::downgrade(&registry().current());
        let shared = Arc::new(GateShared {
            remote: scheduler.remote(),
            state: Mutex::new(GateState {
                queue: VecDeque::new(),
                armed: None,
                closed: false,
            }),
        });
        arm(&scheduler, &shared, block, Rc::new(RefCell::new(callback)));
        Ok(CallGate { shared, scheduler })
    }

    pub fn owner(&self) -> ThreadId {
        self.scheduler.owner()
    }

    pub fn caller(&self) -> GateCaller<T> {
        GateCaller {
            shared: self.shared.clone(),
        }
    }

    /// Arguments queued but not yet delivered.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }
}

impl<T: Send + 'static> Drop for CallGate<T> {
    fn drop(&mut self) {
        let armed = {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            state.queue.clear();
            state.armed.take()
        };
        if let Some(id) = armed {
            self.scheduler.cancel(id);
        }
    }
}

fn arm<T, F>(
    scheduler: &Rc<Scheduler>,
    shared: &Arc<GateShared<T>>,
    block: Weak<GlobalsBlock>,
    callback: Rc<RefCell<F>>,
) where
    T: Send + 'static,
    F: FnMut(T) + 'static,
{
    let weak_sched = Rc::downgrade(scheduler);
    let gate = shared.clone();
    let id = scheduler.request(move |status| {
        if status == Completion::Cancelled {
            return;
        }
        let sched = match weak_sched.upgrade() {
            Some(sched) => sched,
            None => return,
        };
        let calls: Vec<T> = {
            let mut state = gate.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.queue.drain(..).collect()
        };
        arm(&sched, &gate, block.clone(), callback.clone());
        with_lease(&block, || {
            for arg in calls {
                (&mut *callback.borrow_mut())(arg);
            }
        });
    });
    let mut state = shared.state.lock().unwrap();
    if state.queue.is_empty() {
        state.armed = Some(id);
    } else {
        // calls arrived while disarmed
        drop(state);
        let _ = shared.remote.complete(id, Completion::Done);
    }
}

/// The cross-thread half of a [`CallGate`].
pub struct GateCaller<T> {
    shared: Arc<GateShared<T>>,
}

impl<T> Clone for GateCaller<T> {
    fn clone(&self) -> Self {
        GateCaller {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> GateCaller<T> {
    /// Queue `arg` for the owner's callback.
    ///
    /// Fails with `SchedulerGone` once the gate or its owner's loop has been torn down.
    pub fn call(&self, arg: T) -> Result<(), Error> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(Error::SchedulerGone);
        }
        state.queue.push_back(arg);
        match state.armed.take() {
            Some(id) => self
                .shared
                .remote
                .complete(id, Completion::Done)
                .map_err(|e| {
                    state.closed = true;
                    state.queue.clear();
                    e
                }),
            None => Ok(()),
        }
    }
}
