//! Usage contract violations abort the process.
//!
//! Each test forks, breaks a contract in the child, and checks that the child died of `SIGABRT`.
#[macro_export]
macro_rules! contract_tests {
    ( $TestRuntime:path ) => {
        use hearth_runtime::{registry, thread, ExecutionLease, InstanceBuilder};
        use nix::sys::signal::Signal;
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};
        use std::sync::Arc;
        use $TestRuntime as TestRuntime;
        use $crate::helpers::test_ex;

        fn expect_abort<F: FnOnce()>(f: F) {
            match fork().expect("can fork") {
                ForkResult::Child => {
                    f();
                    std::process::exit(0);
                }
                ForkResult::Parent { child } => {
                    match waitpid(Some(child), None).expect("can wait on child") {
                        WaitStatus::Signaled(_, sig, _) => {
                            assert_eq!(sig, Signal::SIGABRT);
                        }
                        ws => panic!("child did not abort: {:?}", ws),
                    }
                }
            }
        }

        #[test]
        fn unbound_thread_cannot_reach_the_runtime() {
            test_ex(|| {
                assert_eq!(registry().current_instance(), None);
                expect_abort(|| {
                    registry().current();
                });
            })
        }

        #[test]
        fn release_by_non_holder_aborts() {
            test_ex(|| {
                expect_abort(|| {
                    let lease = ExecutionLease::new();
                    lease.release();
                });
            })
        }

        #[test]
        fn globals_need_the_lease() {
            test_ex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let block = inst.globals().clone();
                expect_abort(|| {
                    block.with_mut(|g| g.types.len());
                });
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn globals_are_not_reentrant() {
            test_ex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let block = inst.globals().clone();
                expect_abort(|| {
                    inst.run_with(|| {
                        block.with_mut(|_| block.with_mut(|g| g.types.len()));
                    })
                    .ok();
                });
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn destroy_needs_the_lease() {
            test_ex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let id = inst.id();
                expect_abort(|| {
                    registry().destroy_instance(id).ok();
                });
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn only_workers_exit_threads() {
            test_ex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                expect_abort(|| {
                    inst.run_with(|| thread::exit_thread()).ok();
                });
                inst.destroy().unwrap();
            })
        }

        #[test]
        #[cfg(debug_assertions)]
        fn nested_acquire_aborts() {
            test_ex(|| {
                expect_abort(|| {
                    let lease = ExecutionLease::new();
                    lease.acquire();
                    lease.acquire();
                });
            })
        }
    };
}
