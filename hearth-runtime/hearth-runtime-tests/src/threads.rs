//! Worker threads: spawning, joining, exit statuses and exit handlers.
#[macro_export]
macro_rules! thread_tests {
    ( $TestRuntime:path ) => {
        use hearth_runtime::{
            registry, thread, Error, ExitStatus, InstanceBuilder, InstanceHandle, Limits,
            WaitPrimitive,
        };
        use std::sync::mpsc;
        use std::sync::{Arc, Mutex};
        use $TestRuntime as TestRuntime;
        use $crate::helpers::{script_file, test_nonex};

        fn new_instance() -> InstanceHandle {
            InstanceBuilder::new(Arc::new(TestRuntime::new()))
                .build()
                .expect("instance can be created")
        }

        fn join(inst: &mut InstanceHandle, worker: thread::ThreadId) -> ExitStatus {
            inst.run_with(|| thread::wait_for_exit(worker))
                .unwrap()
                .expect("worker can be joined")
        }

        #[test]
        fn worker_runs_inside_the_instance() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let mut inst = InstanceBuilder::new(rt.clone()).build().unwrap();
                let id = inst.id();
                let seen = Arc::new(Mutex::new(None));
                let s = seen.clone();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            let block = registry().current();
                            *s.lock().unwrap() =
                                Some((block.id(), block.lease().is_held_by_current()));
                        })
                    })
                    .unwrap()
                    .unwrap();
                assert_ne!(worker, thread::current_ident());
                assert_eq!(thread::worker_instance(worker), Some(id));

                assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
                assert_eq!(*seen.lock().unwrap(), Some((id, true)));
                assert_eq!(inst.live_workers(), 0);
                // home thread state plus the worker's
                assert_eq!(rt.thread_states(), 2);
                inst.destroy().unwrap();
                assert_eq!(rt.enters(), rt.leaves());
            })
        }

        #[test]
        fn workers_can_be_spawned_from_scripts() {
            test_nonex(|| {
                let spawned = Arc::new(Mutex::new(vec![]));
                let s = spawned.clone();
                let rt = Arc::new(TestRuntime::new().with_hook("spawn", move |args| {
                    let label = args.join(" ");
                    let worker = thread::spawn(|| ())?;
                    s.lock().unwrap().push((label, worker));
                    Ok(())
                }));
                let mut inst = InstanceBuilder::new(rt).build().unwrap();
                let script = script_file("call spawn first\ncall spawn second\n");
                inst.run_script(script.path(), &[]).unwrap();

                let workers = spawned.lock().unwrap().clone();
                assert_eq!(workers.len(), 2);
                assert_eq!(workers[0].0, "first");
                for (_, worker) in workers {
                    assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
                }
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn exit_thread_runs_handlers_lifo() {
            test_nonex(|| {
                let mut inst = new_instance();
                let order = Arc::new(Mutex::new(vec![]));
                let o = order.clone();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            for n in 1..=3 {
                                let o = o.clone();
                                thread::register_exit_handler(move || o.lock().unwrap().push(n))
                                    .unwrap();
                            }
                            thread::exit_thread();
                        })
                    })
                    .unwrap()
                    .unwrap();
                assert_eq!(join(&mut inst, worker), ExitStatus::Exited);
                assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn worker_handlers_do_not_join_the_instance_list() {
            test_nonex(|| {
                let mut inst = new_instance();
                let worker = inst
                    .run_with(|| {
                        thread::spawn(|| {
                            thread::register_exit_handler(|| ()).unwrap();
                        })
                    })
                    .unwrap()
                    .unwrap();
                join(&mut inst, worker);
                let count = inst
                    .run_with(|| registry().current().with_mut(|g| g.exit_handler_count()))
                    .unwrap();
                assert_eq!(count, 0);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn panicking_worker_reports_its_message() {
            test_nonex(|| {
                let mut inst = new_instance();
                let ran = Arc::new(Mutex::new(false));
                let r = ran.clone();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            thread::register_exit_handler(move || *r.lock().unwrap() = true)
                                .unwrap();
                            panic!("worker gave up");
                        })
                    })
                    .unwrap()
                    .unwrap();
                assert_eq!(
                    join(&mut inst, worker),
                    ExitStatus::Panicked("worker gave up".to_owned())
                );
                assert!(*ran.lock().unwrap());
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn joining_is_once_and_never_self() {
            test_nonex(|| {
                let mut inst = new_instance();
                let worker = inst
                    .run_with(|| thread::spawn(|| ()))
                    .unwrap()
                    .unwrap();
                assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
                let again = inst.run_with(|| thread::wait_for_exit(worker)).unwrap();
                assert!(matches!(again, Err(Error::UnknownThread(t)) if t == worker));

                let me = inst
                    .run_with(|| thread::wait_for_exit(thread::current_ident()))
                    .unwrap();
                assert!(matches!(me, Err(Error::InvalidArgument(_))));
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn workers_take_turns_with_the_home_thread() {
            test_nonex(|| {
                let mut inst = new_instance();
                let (tx, rx) = mpsc::channel();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            let w = Arc::new(WaitPrimitive::new().unwrap());
                            tx.send(w.clone()).unwrap();
                            w.wait().unwrap();
                        })
                    })
                    .unwrap()
                    .unwrap();
                let w = rx.recv().unwrap();
                // the worker is suspended in `wait`, so the home thread can get back in
                let held = inst
                    .run_with(|| registry().current().lease().is_held_by_current())
                    .unwrap();
                assert!(held);
                assert_eq!(inst.live_workers(), 1);
                w.signal().unwrap();
                assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn destroy_with_live_worker_is_busy() {
            test_nonex(|| {
                let rt = Arc::new(TestRuntime::new());
                let mut inst = InstanceBuilder::new(rt.clone()).build().unwrap();
                let (tx, rx) = mpsc::channel();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            let w = Arc::new(WaitPrimitive::new().unwrap());
                            tx.send(w.clone()).unwrap();
                            w.wait().unwrap();
                        })
                    })
                    .unwrap()
                    .unwrap();
                let w = rx.recv().unwrap();

                assert!(matches!(inst.destroy(), Err(Error::InstanceBusy(1))));
                assert!(registry().is_live(inst.id()));
                assert_eq!(rt.finalized(), 0);

                w.signal().unwrap();
                assert_eq!(join(&mut inst, worker), ExitStatus::Returned);
                inst.destroy().unwrap();
                assert_eq!(rt.finalized(), 1);
            })
        }

        #[test]
        #[cfg(target_pointer_width = "64")]
        fn impossible_stack_is_resource_exhaustion() {
            test_nonex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .with_limits(Limits::default().with_worker_stack_size(1 << 50))
                    .build()
                    .unwrap();
                let res = inst.run_with(|| thread::spawn(|| ())).unwrap();
                assert!(matches!(res, Err(Error::ResourceExhausted(_))));
                assert_eq!(inst.live_workers(), 0);
                // the failed spawn left the instance usable
                let ok = inst.run_with(|| registry().current().id()).unwrap();
                assert_eq!(ok, inst.id());
                inst.destroy().unwrap();
            })
        }
    };
}
