//! A minimal cooperative event loop, one per thread.
//!
//! Work is expressed as requests: a request is registered on the owning thread together with a
//! completion callback, and is completed either by a timer on the same loop or by another thread
//! through a [`Remote`]. The loop only blocks the OS thread while it has nothing ready to run,
//! and wakes when a completion is posted to its inbox or its next timer expires.

pub mod timer;

use crate::error::Error;
use crate::thread::{self, ThreadId};
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    Cancelled,
}

type Callback = Box<dyn FnOnce(Completion)>;

struct InboxQueue {
    completed: VecDeque<(RequestId, Completion)>,
    open: bool,
}

struct Inbox {
    queue: Mutex<InboxQueue>,
    ready: Condvar,
}

/// A handle for completing requests of a scheduler from any thread.
#[derive(Clone)]
pub struct Remote {
    inbox: Arc<Inbox>,
    owner: ThreadId,
}

impl Remote {
    /// Post a completion to the owning loop.
    pub fn complete(&self, id: RequestId, status: Completion) -> Result<(), Error> {
        let mut queue = self.inbox.queue.lock().unwrap();
        if !queue.open {
            return Err(Error::SchedulerGone);
        }
        queue.completed.push_back((id, status));
        drop(queue);
        self.inbox.ready.notify_one();
        Ok(())
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote").field("owner", &self.owner).finish()
    }
}

pub struct Scheduler {
    owner: ThreadId,
    inbox: Arc<Inbox>,
    next_request: Cell<u64>,
    timer_seq: Cell<u64>,
    pending: RefCell<HashMap<RequestId, Callback>>,
    timers: RefCell<BinaryHeap<Reverse<(Instant, u64, RequestId)>>>,
    installs: Cell<usize>,
}

thread_local! {
    static SCHEDULER: RefCell<Option<Rc<Scheduler>>> = RefCell::new(None);
}

/// The scheduler installed on the calling thread, if any.
pub fn current() -> Option<Rc<Scheduler>> {
    SCHEDULER.try_with(|s| s.borrow().clone()).ok().flatten()
}

/// Install a scheduler on the calling thread, or retain the one already there.
///
/// The scheduler is shut down when the last guard for it is dropped.
pub fn install() -> SchedulerGuard {
    let scheduler = SCHEDULER.with(|s| {
        s.borrow_mut()
            .get_or_insert_with(|| Rc::new(Scheduler::new(thread::current_ident())))
            .clone()
    });
    scheduler.installs.set(scheduler.installs.get() + 1);
    SchedulerGuard { scheduler }
}

/// Keeps the calling thread's scheduler installed.
pub struct SchedulerGuard {
    scheduler: Rc<Scheduler>,
}

impl SchedulerGuard {
    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }
}

impl std::ops::Deref for SchedulerGuard {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        let installs = self.scheduler.installs.get() - 1;
        self.scheduler.installs.set(installs);
        if installs == 0 {
            self.scheduler.shut_down();
            let _ = SCHEDULER.try_with(|s| s.borrow_mut().take());
        }
    }
}

impl Scheduler {
    fn new(owner: ThreadId) -> Scheduler {
        Scheduler {
            owner,
            inbox: Arc::new(Inbox {
                queue: Mutex::new(InboxQueue {
                    completed: VecDeque::new(),
                    open: true,
                }),
                ready: Condvar::new(),
            }),
            next_request: Cell::new(1),
            timer_seq: Cell::new(0),
            pending: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            installs: Cell::new(0),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn remote(&self) -> Remote {
        Remote {
            inbox: self.inbox.clone(),
            owner: self.owner,
        }
    }

    /// Register a request whose completion runs `on_complete` on this loop.
    pub fn request<F: FnOnce(Completion) + 'static>(&self, on_complete: F) -> RequestId {
        let id = RequestId(self.next_request.get());
        self.next_request.set(id.0 + 1);
        self.pending.borrow_mut().insert(id, Box::new(on_complete));
        id
    }

    /// Register a request whose completion is recorded in the returned cell.
    pub fn request_flag(&self) -> (RequestId, Rc<Cell<Option<Completion>>>) {
        let flag = Rc::new(Cell::new(None));
        let id = {
            let flag = flag.clone();
            self.request(move |c| flag.set(Some(c)))
        };
        (id, flag)
    }

    /// Complete `id` with `Completion::Done` once `delay` has passed.
    pub fn arm_timer(&self, id: RequestId, delay: Duration) {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        self.timers
            .borrow_mut()
            .push(Reverse((Instant::now() + delay, seq, id)));
    }

    /// Register a request completed by a timer after `delay`.
    pub fn after<F: FnOnce(Completion) + 'static>(&self, delay: Duration, f: F) -> RequestId {
        let id = self.request(f);
        self.arm_timer(id, delay);
        id
    }

    /// Cancel a pending request. Its callback runs with `Completion::Cancelled`.
    ///
    /// Returns `false` if the request was not pending.
    pub fn cancel(&self, id: RequestId) -> bool {
        let callback = self.pending.borrow_mut().remove(&id);
        match callback {
            Some(callback) => {
                callback(Completion::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.borrow().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    fn complete_local(&self, id: RequestId, status: Completion) -> bool {
        let callback = self.pending.borrow_mut().remove(&id);
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => false,
        }
    }

    fn next_expired_timer(&self, now: Instant) -> Option<RequestId> {
        let mut timers = self.timers.borrow_mut();
        match timers.peek() {
            Some(Reverse((deadline, _, _))) if *deadline <= now => {
                timers.pop().map(|Reverse((_, _, id))| id)
            }
            _ => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        // drop timers whose requests were cancelled
        while let Some(Reverse((_, _, id))) = timers.peek() {
            if self.pending.borrow().contains_key(id) {
                break;
            }
            timers.pop();
        }
        timers.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Run every completion that is ready now: expired timers first, then the inbox in arrival
    /// order. Returns how many callbacks ran.
    pub fn dispatch_ready(&self) -> usize {
        let mut ran = 0;
        let now = Instant::now();
        while let Some(id) = self.next_expired_timer(now) {
            if self.complete_local(id, Completion::Done) {
                ran += 1;
            }
        }

        let queued = self.inbox.queue.lock().unwrap().completed.len();
        for _ in 0..queued {
            let next = self.inbox.queue.lock().unwrap().completed.pop_front();
            match next {
                Some((id, status)) => {
                    if self.complete_local(id, status) {
                        ran += 1;
                    }
                }
                None => break,
            }
        }
        ran
    }

    /// Run the loop until `done` returns true, blocking while nothing is ready.
    pub fn run_until<F: FnMut() -> bool>(&self, mut done: F) {
        loop {
            self.dispatch_ready();
            if done() {
                return;
            }
            self.park();
        }
    }

    fn park(&self) {
        let deadline = self.next_deadline();
        let mut queue = self.inbox.queue.lock().unwrap();
        while queue.completed.is_empty() {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return;
                    }
                    queue = self.inbox.ready.wait_timeout(queue, deadline - now).unwrap().0;
                }
                None => queue = self.inbox.ready.wait(queue).unwrap(),
            }
        }
    }

    /// Run the loop until the request behind `flag` completes.
    pub fn wait_flag(&self, flag: &Cell<Option<Completion>>) -> Completion {
        let mut result = flag.take();
        while result.is_none() {
            self.dispatch_ready();
            result = flag.take();
            if result.is_none() {
                self.park();
            }
        }
        result.unwrap_or(Completion::Cancelled)
    }

    /// Run everything that is ready without blocking. Returns how many callbacks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.dispatch_ready();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }

    /// Run the loop for `duration`.
    pub fn run_for(&self, duration: Duration) {
        let (id, flag) = self.request_flag();
        self.arm_timer(id, duration);
        self.wait_flag(&flag);
    }

    fn shut_down(&self) {
        self.inbox.queue.lock().unwrap().open = false;
        let dropped = std::mem::take(&mut *self.pending.borrow_mut());
        self.timers.borrow_mut().clear();
        if !dropped.is_empty() {
            tracing::debug!(
                "{} pending requests dropped at scheduler shutdown on {}",
                dropped.len(),
                self.owner
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn timers_fire_in_deadline_order() {
        let sched = install();
        let order = Rc::new(RefCell::new(vec![]));
        for (name, ms) in &[("slow", 30u64), ("fast", 5)] {
            let order = order.clone();
            let name = *name;
            sched.after(Duration::from_millis(*ms), move |c| {
                assert_eq!(c, Completion::Done);
                order.borrow_mut().push(name);
            });
        }
        sched.run_for(Duration::from_millis(60));
        assert_eq!(*order.borrow(), vec!["fast", "slow"]);
    }

    #[test]
    fn remote_completion_wakes_loop() {
        let sched = install();
        let (id, flag) = sched.request_flag();
        let remote = sched.remote();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete(id, Completion::Done).unwrap();
        });
        let start = Instant::now();
        assert_eq!(sched.wait_flag(&flag), Completion::Done);
        assert!(start.elapsed() >= Duration::from_millis(15));
        t.join().unwrap();
    }

    #[test]
    fn cancel_runs_callback_once() {
        let sched = install();
        let seen = Rc::new(Cell::new(None));
        let id = {
            let seen = seen.clone();
            sched.after(Duration::from_millis(1), move |c| seen.set(Some(c)))
        };
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));
        assert_eq!(seen.get(), Some(Completion::Cancelled));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sched.run_until_idle(), 0);
    }

    #[test]
    fn remote_fails_after_shutdown() {
        let remote = {
            let sched = install();
            sched.request(|_| ());
            sched.remote()
        };
        assert!(current().is_none());
        assert!(matches!(
            remote.complete(RequestId(1), Completion::Done),
            Err(Error::SchedulerGone)
        ));
    }

    #[test]
    fn nested_installs_share_a_scheduler() {
        let outer = install();
        {
            let inner = install();
            assert!(Rc::ptr_eq(outer.scheduler(), inner.scheduler()));
        }
        assert!(current().is_some());
        drop(outer);
        assert!(current().is_none());
    }
}
