//! Sleeps, yields and deferred calls on the calling thread's loop.
//!
//! Everything here suspends or re-takes the execution lease of the calling thread's instance, so
//! other threads of the instance run while this one waits.

use super::{current, Completion, RequestId, Scheduler};
use crate::error::Error;
use crate::lease::{suspend_lease, with_lease};
use crate::registry::registry;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

fn scheduler() -> Result<Rc<Scheduler>, Error> {
    current().ok_or(Error::NoScheduler)
}

/// Suspend the calling thread for `duration`, running its loop in the meantime.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    let sched = scheduler()?;
    let (id, flag) = sched.request_flag();
    sched.arm_timer(id, duration);
    suspend_lease(|| sched.wait_flag(&flag));
    Ok(())
}

/// Let every completion that is already ready on this thread's loop run, then continue.
pub fn yield_now() -> Result<(), Error> {
    let sched = scheduler()?;
    let (id, flag) = sched.request_flag();
    sched.remote().complete(id, Completion::Done)?;
    suspend_lease(|| sched.wait_flag(&flag));
    Ok(())
}

/// Run `f` after `delay`, inside the runtime of the calling thread's instance.
///
/// `f` runs from this thread's loop, so it only fires while the thread is waiting, sleeping or
/// pumping its loop. It is dropped without running if the instance is gone by then.
pub fn call_after<F: FnOnce() + 'static>(delay: Duration, f: F) -> Result<RequestId, Error> {
    let sched = scheduler()?;
    let block = Arc::downgrade(&registry().current());
    Ok(sched.after(delay, move |status| {
        if status == Completion::Done && with_lease(&block, f).is_none() {
            tracing::debug!("deferred call dropped: its instance is gone");
        }
    }))
}

/// Cancel a call registered with [`call_after`]. Returns `false` if it already ran.
pub fn cancel(id: RequestId) -> Result<bool, Error> {
    Ok(scheduler()?.cancel(id))
}

/// A reusable one-shot timer bound to the creating thread's loop.
pub struct Timer {
    scheduler: Rc<Scheduler>,
    pending: Rc<Cell<Option<RequestId>>>,
}

impl Timer {
    pub fn new() -> Result<Timer, Error> {
        Ok(Timer {
            scheduler: scheduler()?,
            pending: Rc::new(Cell::new(None)),
        })
    }

    pub fn is_active(&self) -> bool {
        self.pending.get().is_some()
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        if self.is_active() {
            return Err(Error::InvalidArgument("timer pending - cancel first"));
        }
        Ok(())
    }

    /// Sleep for `delay`. Returns early if the timer is cancelled from a callback meanwhile.
    pub fn after(&self, delay: Duration) -> Result<(), Error> {
        self.ensure_idle()?;
        let (id, flag) = self.scheduler.request_flag();
        self.scheduler.arm_timer(id, delay);
        self.pending.set(Some(id));
        suspend_lease(|| self.scheduler.wait_flag(&flag));
        self.pending.set(None);
        Ok(())
    }

    /// Run `f` inside the runtime of the calling thread's instance once `delay` has passed.
    pub fn after_call<F: FnOnce() + 'static>(&self, delay: Duration, f: F) -> Result<(), Error> {
        self.ensure_idle()?;
        let block = Arc::downgrade(&registry().current());
        let pending = self.pending.clone();
        let id = self.scheduler.after(delay, move |status| {
            pending.set(None);
            if status == Completion::Done {
                with_lease(&block, f);
            }
        });
        self.pending.set(Some(id));
        Ok(())
    }

    /// Cancel the pending sleep or call. Returns `false` if nothing was pending.
    pub fn cancel(&self) -> bool {
        match self.pending.take() {
            Some(id) => self.scheduler.cancel(id),
            None => false,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::install;
    use std::time::Instant;

    #[test]
    fn sleep_without_scheduler_fails() {
        assert!(matches!(sleep(Duration::from_millis(1)), Err(Error::NoScheduler)));
    }

    #[test]
    fn yield_runs_ready_completions_first() {
        let sched = install();
        let ran = Rc::new(Cell::new(false));
        let id = {
            let ran = ran.clone();
            sched.request(move |_| ran.set(true))
        };
        sched.remote().complete(id, Completion::Done).unwrap();
        yield_now().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn timer_sleeps_for_delay() {
        let _sched = install();
        let timer = Timer::new().unwrap();
        let start = Instant::now();
        timer.after(Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!timer.is_active());
        assert!(!timer.cancel());
    }
}
