//! Cooperative waits, timers and call gates.
#[macro_export]
macro_rules! wait_tests {
    ( $TestRuntime:path ) => {
        use hearth_runtime::{
            registry, thread, timer, CallGate, Error, ExitStatus, InstanceBuilder,
            InstanceHandle, WaitPrimitive,
        };
        use std::cell::{Cell, RefCell};
        use std::rc::Rc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::mpsc;
        use std::sync::Arc;
        use std::time::{Duration, Instant};
        use $TestRuntime as TestRuntime;
        use $crate::helpers::test_nonex;

        fn new_instance() -> InstanceHandle {
            InstanceBuilder::new(Arc::new(TestRuntime::new()))
                .build()
                .expect("instance can be created")
        }

        fn signal_later(w: Arc<WaitPrimitive>, delay: Duration) -> std::thread::JoinHandle<()> {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                w.signal().expect("signal is delivered");
            })
        }

        #[test]
        fn signal_before_wait_is_observed() {
            test_nonex(|| {
                let mut inst = new_instance();
                inst.run_with(|| {
                    let w = WaitPrimitive::new().unwrap();
                    w.signal().unwrap();
                    assert!(w.is_signaled());
                    let start = Instant::now();
                    w.wait().unwrap();
                    assert!(start.elapsed() < Duration::from_millis(500));
                    assert!(!w.is_signaled());
                })
                .unwrap();
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn two_signals_satisfy_one_wait() {
            test_nonex(|| {
                let mut inst = new_instance();
                inst.run_with(|| {
                    let w = Arc::new(WaitPrimitive::new().unwrap());
                    w.signal().unwrap();
                    w.signal().unwrap();
                    w.wait().unwrap();
                    assert!(!w.is_signaled());

                    let signaller = signal_later(w.clone(), Duration::from_millis(50));
                    let start = Instant::now();
                    w.wait().unwrap();
                    assert!(start.elapsed() >= Duration::from_millis(40));
                    signaller.join().unwrap();
                })
                .unwrap();
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn waiting_releases_the_lease() {
            test_nonex(|| {
                let mut inst = new_instance();
                inst.run_with(|| {
                    let block = registry().current();
                    let w = Arc::new(WaitPrimitive::new().unwrap());
                    let w2 = w.clone();
                    let b2 = block.clone();
                    let other = std::thread::spawn(move || {
                        while !w2.has_waiter() {
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        // the waiter is suspended, so the lease is free to take
                        b2.lease().acquire();
                        b2.lease().release();
                        w2.signal().unwrap();
                    });
                    w.wait().unwrap();
                    assert!(block.lease().is_held_by_current());
                    other.join().unwrap();
                })
                .unwrap();
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn worker_waits_for_home_signal() {
            test_nonex(|| {
                let mut inst = new_instance();
                let handled = Arc::new(AtomicUsize::new(0));
                let h = handled.clone();
                let (tx, rx) = mpsc::channel();
                let (woke_tx, woke_rx) = mpsc::channel();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            thread::register_exit_handler(move || {
                                h.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                            let w = Arc::new(WaitPrimitive::new().unwrap());
                            tx.send(w.clone()).unwrap();
                            w.wait().unwrap();
                            woke_tx.send(Instant::now()).unwrap();
                        })
                    })
                    .unwrap()
                    .unwrap();

                let w = rx.recv().unwrap();
                std::thread::sleep(Duration::from_millis(50));
                assert!(!w.is_signaled());
                let signalled_at = Instant::now();
                w.signal().unwrap();
                let woke_at = woke_rx.recv().unwrap();
                assert!(
                    woke_at.duration_since(signalled_at) < Duration::from_millis(20),
                    "worker woke {:?} after the signal",
                    woke_at.duration_since(signalled_at)
                );

                let status = inst.run_with(|| thread::wait_for_exit(worker)).unwrap();
                assert_eq!(status.unwrap(), ExitStatus::Returned);
                assert_eq!(handled.load(Ordering::SeqCst), 1);
                inst.destroy().unwrap();
                assert_eq!(handled.load(Ordering::SeqCst), 1);
            })
        }

        #[test]
        fn only_the_owner_waits() {
            test_nonex(|| {
                let mut inst = new_instance();
                let w = inst
                    .run_with(|| Arc::new(WaitPrimitive::new().unwrap()))
                    .unwrap();
                let owner = w.owner();
                assert_eq!(owner, thread::current_ident());
                let w2 = w.clone();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            assert!(matches!(w2.wait(), Err(Error::WaitOwnership(t)) if t == owner));
                            w2.signal().unwrap();
                        })
                    })
                    .unwrap()
                    .unwrap();
                let status = inst
                    .run_with(|| {
                        let status = thread::wait_for_exit(worker);
                        w.wait().unwrap();
                        status
                    })
                    .unwrap();
                assert_eq!(status.unwrap(), ExitStatus::Returned);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn sleep_releases_and_retakes_the_lease() {
            test_nonex(|| {
                let mut inst = new_instance();
                inst.run_with(|| {
                    let start = Instant::now();
                    timer::sleep(Duration::from_millis(30)).unwrap();
                    assert!(start.elapsed() >= Duration::from_millis(30));
                    assert!(registry().current().lease().is_held_by_current());
                    timer::yield_now().unwrap();
                })
                .unwrap();
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn deferred_calls_run_under_the_lease() {
            test_nonex(|| {
                let mut inst = new_instance();
                let fired = Rc::new(Cell::new(false));
                let cancelled = Rc::new(Cell::new(false));
                let (f, c) = (fired.clone(), cancelled.clone());
                inst.run_with(move || {
                    timer::call_after(Duration::from_millis(20), move || {
                        assert!(registry().current().lease().is_held_by_current());
                        f.set(true);
                    })
                    .unwrap();
                    let id = timer::call_after(Duration::from_millis(10), move || c.set(true))
                        .unwrap();
                    assert!(timer::cancel(id).unwrap());
                })
                .unwrap();
                assert!(!fired.get());
                inst.run_for(Duration::from_millis(100));
                assert!(fired.get());
                assert!(!cancelled.get());
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn deferred_calls_fire_during_waits() {
            test_nonex(|| {
                let mut inst = new_instance();
                inst.run_with(|| {
                    let w = Rc::new(WaitPrimitive::new().unwrap());
                    let w2 = w.clone();
                    timer::call_after(Duration::from_millis(10), move || w2.signal().unwrap())
                        .unwrap();
                    w.wait().unwrap();
                })
                .unwrap();
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn timers_refuse_to_double_book() {
            test_nonex(|| {
                let mut inst = new_instance();
                let fired = Rc::new(Cell::new(0));
                let f = fired.clone();
                let t = inst
                    .run_with(move || {
                        let t = timer::Timer::new().unwrap();
                        let f2 = f.clone();
                        t.after_call(Duration::from_millis(10), move || f2.set(f2.get() + 1))
                            .unwrap();
                        assert!(t.is_active());
                        assert!(matches!(
                            t.after_call(Duration::from_millis(10), move || f.set(100)),
                            Err(Error::InvalidArgument(_))
                        ));
                        t
                    })
                    .unwrap();
                inst.run_for(Duration::from_millis(60));
                assert_eq!(fired.get(), 1);
                assert!(!t.is_active());

                let cancelled = Rc::new(Cell::new(false));
                let c = cancelled.clone();
                inst.run_with(|| {
                    t.after_call(Duration::from_millis(10), move || c.set(true))
                        .unwrap();
                    assert!(t.cancel());
                    assert!(!t.cancel());
                })
                .unwrap();
                inst.run_for(Duration::from_millis(40));
                assert!(!cancelled.get());
                drop(t);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn call_gate_delivers_in_order_on_the_owner() {
            test_nonex(|| {
                let mut inst = new_instance();
                let home = thread::current_ident();
                let log = Rc::new(RefCell::new(vec![]));
                let l = log.clone();
                let gate = inst
                    .run_with(move || {
                        CallGate::new(move |n: u32| {
                            assert_eq!(thread::current_ident(), home);
                            assert!(registry().current().lease().is_held_by_current());
                            l.borrow_mut().push(n);
                        })
                        .unwrap()
                    })
                    .unwrap();
                assert_eq!(gate.owner(), home);

                let caller = gate.caller();
                std::thread::spawn(move || {
                    for n in 1..=5 {
                        caller.call(n).unwrap();
                    }
                })
                .join()
                .unwrap();

                let deadline = Instant::now() + Duration::from_secs(5);
                while log.borrow().len() < 5 && Instant::now() < deadline {
                    inst.run_for(Duration::from_millis(10));
                }
                assert_eq!(*log.borrow(), vec![1, 2, 3, 4, 5]);

                let caller = gate.caller();
                drop(gate);
                assert!(matches!(caller.call(6), Err(Error::SchedulerGone)));
                inst.destroy().unwrap();
            })
        }
    };
}
