use hearth_concurrency_tests::{join, new_instance, spawn_waiter};
use hearth_runtime::{registry, thread, Error, ExitStatus};
use hearth_runtime_tests::helpers::test_nonex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A signal that lands after the waiter has registered, but before it has let go of the lease,
/// still wakes it.
#[test]
fn signal_between_registration_and_suspend() {
    test_nonex(|| {
        let mut inst = new_instance();
        let testpoints = inst.globals().lock_testpoints().clone();
        let waiter = testpoints.wait_before_suspend.wait_at();

        let (worker, w) = spawn_waiter(&mut inst);
        waiter.wait_and_then(|| {
            assert!(w.has_waiter());
            w.signal().unwrap();
            assert!(!w.is_signaled());
        });

        assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
        inst.destroy().unwrap();
    })
}

/// A worker that has bound but not yet taken the lease does not hold the instance up.
#[test]
fn bound_worker_does_not_hold_the_lease() {
    test_nonex(|| {
        let mut inst = new_instance();
        let testpoints = inst.globals().lock_testpoints().clone();
        let bound = testpoints.worker_after_bind.wait_at();

        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let worker = inst
            .run_with(move || thread::spawn(move || r.store(true, Ordering::SeqCst)))
            .unwrap()
            .unwrap();

        let stopped = bound.pause();
        assert_eq!(inst.globals().bound_threads(), 2);
        let id = inst
            .run_with(|| registry().current().id())
            .expect("the home thread gets the lease");
        assert_eq!(id, inst.id());
        assert!(matches!(inst.destroy(), Err(Error::InstanceBusy(1))));
        assert!(!ran.load(Ordering::SeqCst));
        stopped.resume();

        assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
        assert!(ran.load(Ordering::SeqCst));
        inst.destroy().unwrap();
    })
}

/// While a worker is running its exit handlers it still counts as live, and still holds the lease.
#[test]
fn exiting_worker_is_still_live() {
    test_nonex(|| {
        let mut inst = new_instance();
        let testpoints = inst.globals().lock_testpoints().clone();
        let exiting = testpoints.worker_before_exit_handlers.wait_at();

        let worker = inst
            .run_with(|| thread::spawn(|| ()))
            .unwrap()
            .unwrap();
        let block = inst.globals().clone();
        exiting.wait_and_then(|| {
            assert_eq!(inst.live_workers(), 1);
            assert!(block.lease().is_held());
            assert!(!block.lease().try_acquire());
        });

        assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
        assert_eq!(inst.live_workers(), 0);
        inst.destroy().unwrap();
    })
}

/// A thread blocked in `acquire` gets the lease as soon as the holder releases it.
#[test]
fn lease_handoff_to_blocked_acquirer() {
    test_nonex(|| {
        let mut inst = new_instance();
        let testpoints = inst.globals().lock_testpoints().clone();
        let before_release = testpoints.lease_before_release.wait_at();
        let block = inst.globals().clone();

        let orchestrator = std::thread::spawn(move || {
            // the home thread is parked inside `release`, still holding the lease
            let stopped = before_release.pause();
            let b = block.clone();
            let contender = std::thread::spawn(move || {
                b.lease().acquire();
                let held = b.lease().is_held_by_current();
                b.lease().release();
                held
            });
            while block.lease().waiters() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(block.lease().is_held());
            stopped.resume();
            contender.join().unwrap()
        });

        inst.run_with(|| ()).unwrap();
        assert!(orchestrator.join().unwrap());
        inst.destroy().unwrap();
    })
}
