//! Instance creation, script execution and teardown.
#[macro_export]
macro_rules! lifecycle_tests {
    ( $TestRuntime:path ) => {
        use hearth_runtime::{
            registry, thread, BuildInfo, Error, InstanceBuilder, Limits, ScriptStatus,
            WaitPrimitive,
        };
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{mpsc, Arc, Mutex};
        use std::time::Duration;
        use $TestRuntime as TestRuntime;
        use $crate::helpers::{script_file, test_nonex};

        #[test]
        fn create_and_destroy() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let mut inst = InstanceBuilder::new(rt.clone())
                    .build()
                    .expect("instance can be created");
                let id = inst.id();
                assert!(registry().is_live(id));
                assert_eq!(rt.initialized(), 1);
                assert_eq!(rt.entered_serial(), None);

                let report = inst.destroy().expect("instance can be destroyed");
                assert!(report.is_clean());
                assert!(!registry().is_live(id));
                assert_eq!(rt.finalized(), 1);
                assert!(!registry().is_bound(id));

                match inst.destroy() {
                    Err(Error::UnknownInstance(gone)) => assert_eq!(gone, id),
                    res => panic!("unexpected second destroy: {:?}", res.map(|_| ())),
                }
                assert!(matches!(registry().lookup(id), Err(Error::UnknownInstance(_))));
            })
        }

        #[test]
        fn dropping_the_handle_destroys() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let inst = InstanceBuilder::new(rt.clone()).build().unwrap();
                let id = inst.id();
                drop(inst);
                assert!(!registry().is_live(id));
                assert_eq!(rt.finalized(), 1);
            })
        }

        #[test]
        fn dropping_a_busy_handle_waits_for_workers() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let mut inst = InstanceBuilder::new(rt.clone()).build().unwrap();
                let id = inst.id();
                let exited = Arc::new(AtomicUsize::new(0));
                let e = exited.clone();
                let (tx, rx) = mpsc::channel();
                inst.run_with(move || {
                    thread::spawn(move || {
                        thread::register_exit_handler(move || {
                            e.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                        let w = Arc::new(WaitPrimitive::new().unwrap());
                        tx.send(w.clone()).unwrap();
                        w.wait().unwrap();
                    })
                })
                .unwrap()
                .unwrap();

                let w = rx.recv().unwrap();
                assert_eq!(inst.live_workers(), 1);
                let signaller = std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    w.signal().unwrap();
                });
                drop(inst);
                signaller.join().unwrap();

                assert_eq!(exited.load(Ordering::SeqCst), 1);
                assert!(!registry().is_live(id));
                assert!(!registry().is_bound(id));
                assert_eq!(rt.finalized(), 1);
            })
        }

        #[test]
        fn failed_initialization_leaves_nothing_behind() {
            test_nonex(|| {
                let before = registry().current_instance();
                let res = InstanceBuilder::new(Arc::new(TestRuntime::failing())).build();
                assert!(matches!(res, Err(Error::InvalidArgument(_))));
                assert_eq!(registry().current_instance(), before);
            })
        }

        #[test]
        fn invalid_limits_are_rejected() {
            test_nonex(|| {
                let res = hearth_runtime::create_instance(0, Arc::new(TestRuntime::new()));
                assert!(matches!(res, Err(Error::InvalidArgument(_))));

                let res = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .with_limits(Limits::default().with_worker_stack_size(1024))
                    .build();
                assert!(matches!(res, Err(Error::InvalidArgument(_))));
            })
        }

        #[test]
        fn unobtainable_heap_is_an_allocation_error() {
            test_nonex(|| {
                let before = registry().current_instance();
                let res = hearth_runtime::create_instance(usize::MAX, Arc::new(TestRuntime::new()));
                assert!(matches!(res, Err(Error::Allocation(n)) if n == usize::MAX));
                assert_eq!(registry().current_instance(), before);
            })
        }

        #[test]
        fn instances_never_share_globals() {
            test_nonex(|| {
                let mut live = vec![];
                for round in 0..4 {
                    for _ in 0..3 {
                        live.push(
                            InstanceBuilder::new(Arc::new(TestRuntime::new()))
                                .build()
                                .unwrap(),
                        );
                    }
                    // destroy from the middle so that ids and blocks get recycled out of order
                    let mut victim = live.remove(round % live.len());
                    victim.destroy().unwrap();

                    let mut seen: Vec<Arc<hearth_runtime::GlobalsBlock>> = vec![];
                    for inst in live.iter_mut() {
                        let id = inst.id();
                        let block = inst
                            .run_with(|| {
                                let block = registry().current();
                                assert_eq!(block.id(), id);
                                block
                            })
                            .unwrap();
                        assert!(seen.iter().all(|other| !Arc::ptr_eq(other, &block)));
                        assert!(seen.iter().all(|other| other.id() != block.id()));
                        seen.push(block);
                    }
                }
                for mut inst in live {
                    inst.destroy().unwrap();
                }
            })
        }

        #[test]
        fn run_script_passes_arguments() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let mut inst = InstanceBuilder::new(rt.clone()).build().unwrap();
                let script = script_file("# greeting\nprint hello\n\nargv\n");
                let status = inst.run_script(script.path(), &["a", "b"]).unwrap();
                assert_eq!(status, ScriptStatus::Completed);
                assert_eq!(
                    rt.output(),
                    vec![
                        "hello".to_owned(),
                        format!("{} a b", script.path().display())
                    ]
                );
                assert_eq!(inst.report_last_error().unwrap(), None);
                inst.destroy().unwrap();
                assert_eq!(rt.enters(), rt.leaves());
            })
        }

        #[test]
        fn script_errors_are_reported_once() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let mut inst = InstanceBuilder::new(rt.clone()).build().unwrap();
                let bad = script_file("print before\nraise ValueError: nope\nprint after\n");
                assert_eq!(
                    inst.run_script(bad.path(), &[]).unwrap(),
                    ScriptStatus::Failed
                );

                let report = inst
                    .report_last_error()
                    .unwrap()
                    .expect("an error is pending");
                assert!(report.starts_with("Traceback (most recent call last):"));
                assert!(report.contains("line 2"));
                assert!(report.ends_with("ValueError: nope"));
                assert_eq!(inst.report_last_error().unwrap(), None);

                let good = script_file("print again\n");
                assert_eq!(
                    inst.run_script(good.path(), &[]).unwrap(),
                    ScriptStatus::Completed
                );
                assert_eq!(rt.output(), vec!["before".to_owned(), "again".to_owned()]);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn missing_script_is_not_found() {
            test_nonex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let res = inst.run_script("/nonexistent/hearth/script.hs", &[]);
                assert!(matches!(res, Err(Error::ScriptNotFound(_))));
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn instance_exit_handlers_run_lifo_at_destroy() {
            test_nonex(|| {
                let order = Arc::new(Mutex::new(vec![]));
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let o = order.clone();
                inst.run_with(move || {
                    for n in 1..=3 {
                        let o = o.clone();
                        thread::register_exit_handler(move || o.lock().unwrap().push(n)).unwrap();
                    }
                    registry().current().with_mut(|g| g.exit_handler_count())
                })
                .map(|count| assert_eq!(count, 3))
                .unwrap();
                assert!(order.lock().unwrap().is_empty());
                inst.destroy().unwrap();
                assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
            })
        }

        #[test]
        fn exit_handler_limit_is_enforced() {
            test_nonex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .with_limits(Limits::default().with_max_exit_handlers(2))
                    .build()
                    .unwrap();
                let res = inst
                    .run_with(|| {
                        thread::register_exit_handler(|| ()).unwrap();
                        thread::register_exit_handler(|| ()).unwrap();
                        thread::register_exit_handler(|| ())
                    })
                    .unwrap();
                assert!(matches!(res, Err(Error::LimitsExceeded(_))));
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn type_objects_are_per_instance() {
            #[derive(Debug, PartialEq)]
            struct Marker(u32);

            test_nonex(|| {
                let mut a = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .with_type_object(Marker(1))
                    .build()
                    .unwrap();
                let mut b = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let seen_a = a
                    .run_with(|| registry().current().with_mut(|g| g.types.get::<Marker>().map(|m| m.0)))
                    .unwrap();
                let seen_b = b
                    .run_with(|| registry().current().with_mut(|g| g.types.get::<Marker>().map(|m| m.0)))
                    .unwrap();
                assert_eq!(seen_a, Some(1));
                assert_eq!(seen_b, None);
                a.destroy().unwrap();
                b.destroy().unwrap();
            })
        }

        #[test]
        fn globals_carry_build_info_and_heap() {
            test_nonex(|| {
                let mut inst = hearth_runtime::create_instance(1 << 20, Arc::new(TestRuntime::new()))
                    .unwrap();
                let (version, capacity) = inst
                    .run_with(|| {
                        registry()
                            .current()
                            .with_mut(|g| (g.build.version_string(), g.heap.capacity()))
                    })
                    .unwrap();
                assert_eq!(version, BuildInfo::current().version_string());
                assert!(version.starts_with("hearth "));
                assert!(capacity >= 1 << 20);
                inst.destroy().unwrap();
            })
        }
    };
}
