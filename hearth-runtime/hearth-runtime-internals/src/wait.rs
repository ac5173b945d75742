//! A binary signal for cooperative threads.
//!
//! A [`WaitPrimitive`] belongs to the thread that created it. Only that thread may `wait()`;
//! any thread may `signal()`. A signal with no waiter is remembered, so a `signal()` that races
//! ahead of the matching `wait()` is never lost, but signals do not accumulate: two signals before
//! a wait satisfy exactly one wait.

use crate::error::Error;
use crate::lease::suspend_lease;
use crate::scheduler::{self, Completion, Remote, RequestId};
use crate::thread::{self, ThreadId};
use std::sync::Mutex;

pub struct WaitPrimitive {
    owner: ThreadId,
    remote: Remote,
    state: Mutex<WaitState>,
}

#[derive(Default)]
struct WaitState {
    signaled: bool,
    pending: Option<RequestId>,
}

impl WaitPrimitive {
    /// Create a primitive owned by the calling thread, which must have a scheduler installed.
    pub fn new() -> Result<WaitPrimitive, Error> {
        let sched = scheduler::current().ok_or(Error::NoScheduler)?;
        Ok(WaitPrimitive {
            owner: sched.owner(),
            remote: sched.remote(),
            state: Mutex::new(WaitState::default()),
        })
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Whether a signal is stored and not yet consumed.
    pub fn is_signaled(&self) -> bool {
        self.state.lock().unwrap().signaled
    }

    /// Whether the owner is currently suspended in `wait()`.
    pub fn has_waiter(&self) -> bool {
        self.state.lock().unwrap().pending.is_some()
    }

    /// Wait until signalled, consuming the signal.
    ///
    /// While suspended the caller's execution lease is released and its loop keeps dispatching
    /// other ready completions.
    pub fn wait(&self) -> Result<(), Error> {
        if thread::current_ident() != self.owner {
            return Err(Error::WaitOwnership(self.owner));
        }
        let sched = scheduler::current().ok_or(Error::SchedulerGone)?;

        let flag = {
            let mut state = self.state.lock().unwrap();
            if state.pending.is_some() {
                return Err(Error::WaitInProgress);
            }
            if state.signaled {
                state.signaled = false;
                return Ok(());
            }
            let (id, flag) = sched.request_flag();
            state.pending = Some(id);
            flag
        };

        #[cfg(feature = "concurrent_testpoints")]
        {
            if let Some(block) = crate::registry::registry().try_current() {
                block.lock_testpoints().wait_before_suspend.check();
            }
        }

        match suspend_lease(|| sched.wait_flag(&flag)) {
            Completion::Done => Ok(()),
            Completion::Cancelled => {
                self.state.lock().unwrap().pending = None;
                Err(Error::SchedulerGone)
            }
        }
    }

    /// Wake the owner if it is waiting; otherwise store the signal for its next `wait()`.
    ///
    /// Callable from any thread.
    pub fn signal(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.pending.take() {
            Some(id) => self.remote.complete(id, Completion::Done),
            None => {
                state.signaled = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::install;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn requires_a_scheduler() {
        assert!(matches!(WaitPrimitive::new(), Err(Error::NoScheduler)));
    }

    #[test]
    fn signal_before_wait_is_not_lost() {
        let _sched = install();
        let w = WaitPrimitive::new().unwrap();
        w.signal().unwrap();
        assert!(w.is_signaled());
        let start = Instant::now();
        w.wait().unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(!w.is_signaled());
    }

    #[test]
    fn signal_from_other_thread_wakes_owner() {
        let _sched = install();
        let w = Arc::new(WaitPrimitive::new().unwrap());
        let t = {
            let w = w.clone();
            std::thread::spawn(move || {
                while !w.has_waiter() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                w.signal().unwrap();
            })
        };
        w.wait().unwrap();
        t.join().unwrap();
        assert!(!w.has_waiter());
        assert!(!w.is_signaled());
    }

    #[test]
    fn wait_from_non_owner_is_rejected() {
        let _sched = install();
        let w = Arc::new(WaitPrimitive::new().unwrap());
        let owner = w.owner();
        let res = {
            let w = w.clone();
            std::thread::spawn(move || w.wait()).join().unwrap()
        };
        assert!(matches!(res, Err(Error::WaitOwnership(o)) if o == owner));
    }

    #[test]
    fn nested_wait_is_rejected() {
        let sched = install();
        let w = Arc::new(WaitPrimitive::new().unwrap());
        let nested = Arc::new(Mutex::new(None));
        {
            let w = w.clone();
            let nested = nested.clone();
            sched.after(Duration::from_millis(5), move |_| {
                *nested.lock().unwrap() = Some(w.wait());
                w.signal().unwrap();
            });
        }
        w.wait().unwrap();
        let nested = nested.lock().unwrap().take();
        assert!(matches!(nested, Some(Err(Error::WaitInProgress))));
    }
}
