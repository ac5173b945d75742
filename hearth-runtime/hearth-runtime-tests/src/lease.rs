//! Execution lease exclusion.
#[macro_export]
macro_rules! lease_tests {
    ( $TestRuntime:path ) => {
        use hearth_runtime::{registry, thread, timer, ExecutionLease, ExitStatus, InstanceBuilder};
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Arc, Barrier};
        use std::time::{Duration, Instant};
        use $TestRuntime as TestRuntime;
        use $crate::helpers::test_nonex;

        const WORKER_COUNTS: &[usize] = &[1, 2, 4, 8];
        const ITERATIONS: usize = 100;

        #[derive(Default)]
        struct Counter(usize);

        /// Run `workers` threads that each bump a shared counter `ITERATIONS` times, and return
        /// the final count.
        fn count_with_workers(workers: usize) -> usize {
            let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                .with_type_object(Counter::default())
                .build()
                .unwrap();

            let ids = inst
                .run_with(|| {
                    (0..workers)
                        .map(|_| {
                            thread::spawn(|| {
                                let block = registry().current();
                                for _ in 0..ITERATIONS {
                                    // read and write in separate critical sections of the
                                    // globals, with no lease handoff in between
                                    let seen = block.with_mut(|g| {
                                        g.types.get::<Counter>().map(|c| c.0).unwrap_or(0)
                                    });
                                    std::thread::yield_now();
                                    block.with_mut(|g| {
                                        if let Some(c) = g.types.get_mut::<Counter>() {
                                            c.0 = seen + 1;
                                        }
                                    });
                                    timer::yield_now().unwrap();
                                }
                            })
                            .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap();

            for worker in ids {
                let status = inst.run_with(|| thread::wait_for_exit(worker)).unwrap();
                assert_eq!(status.unwrap(), ExitStatus::Returned);
            }
            let total = inst
                .run_with(|| {
                    registry()
                        .current()
                        .with_mut(|g| g.types.get::<Counter>().map(|c| c.0))
                })
                .unwrap();
            inst.destroy().unwrap();
            total.expect("counter is installed")
        }

        #[test]
        fn workers_lose_no_updates() {
            test_nonex(|| {
                for &workers in WORKER_COUNTS {
                    assert_eq!(
                        count_with_workers(workers),
                        workers * ITERATIONS,
                        "lost updates with {} workers",
                        workers
                    );
                }
            })
        }

        #[test]
        fn lease_has_one_holder() {
            test_nonex(|| {
                let lease = Arc::new(ExecutionLease::new());
                assert!(!lease.is_held());
                lease.acquire();
                assert!(lease.is_held_by_current());

                let l = lease.clone();
                let other = std::thread::spawn(move || {
                    assert!(!l.try_acquire());
                    assert!(!l.is_held_by_current());
                })
                .join();
                assert!(other.is_ok());

                lease.release();
                assert!(!lease.is_held());
                assert!(lease.try_acquire());
                lease.release();
            })
        }

        #[test]
        fn release_hands_the_lease_to_a_waiter() {
            test_nonex(|| {
                let lease = Arc::new(ExecutionLease::new());
                let barrier = Arc::new(Barrier::new(2));
                let got_it = Arc::new(AtomicBool::new(false));

                lease.acquire();
                let (l, b, g) = (lease.clone(), barrier.clone(), got_it.clone());
                let waiter = std::thread::spawn(move || {
                    b.wait();
                    let start = Instant::now();
                    l.acquire();
                    g.store(true, Ordering::SeqCst);
                    l.release();
                    start.elapsed()
                });
                barrier.wait();
                std::thread::sleep(Duration::from_millis(50));
                assert!(!got_it.load(Ordering::SeqCst));
                lease.release();

                let blocked_for = waiter.join().unwrap();
                assert!(got_it.load(Ordering::SeqCst));
                assert!(blocked_for >= Duration::from_millis(40));
                assert_eq!(lease.waiters(), 0);
            })
        }
    };
}
