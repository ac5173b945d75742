//! Extension image loading, promotion and finalization.
//!
//! Images are served by a `MockLoader`, except for the tests that go through the platform
//! loader with files known to exist on the host.
#[macro_export]
macro_rules! loader_tests {
    ( $TestRuntime:path ) => {
        use hearth_runtime::c_api::{
            hearth_current_instance, hearth_register_exit_handler, hearth_register_module,
            HEARTH_EINVAL, HEARTH_OK,
        };
        use hearth_runtime::loader::{self, MockImageBuilder, MockLoader};
        use hearth_runtime::{
            registry, thread, DlLoader, Error, ExitStatus, InstanceBuilder, InstanceHandle,
            Limits, ModuleError, ModuleMetadata, Ordinal, OwnershipScope,
        };
        use lazy_static::lazy_static;
        use std::path::PathBuf;
        use std::sync::{Arc, Mutex};
        use $TestRuntime as TestRuntime;
        use $crate::helpers::{system_library, test_ex, test_nonex};

        lazy_static! {
            static ref EVENTS: Mutex<Vec<String>> = Mutex::new(vec![]);
        }

        fn event<S: Into<String>>(e: S) {
            EVENTS.lock().unwrap().push(e.into());
        }

        fn take_events() -> Vec<String> {
            std::mem::take(&mut *EVENTS.lock().unwrap())
        }

        extern "C" fn init_a() {
            event("init a");
        }

        extern "C" fn fini_a() -> libc::c_int {
            event("fini a");
            0
        }

        extern "C" fn init_b() {
            event("init b");
        }

        extern "C" fn fini_b() -> libc::c_int {
            event("fini b");
            0
        }

        extern "C" fn fini_c() -> libc::c_int {
            event("fini c");
            0
        }

        extern "C" fn fini_broken() -> libc::c_int {
            event("fini broken");
            3
        }

        extern "C" fn init_nothing() {}

        extern "C" fn on_instance_exit() {
            event("instance exit");
        }

        extern "C" fn init_json() {
            let status = unsafe { hearth_register_module(b"json\0".as_ptr() as *const libc::c_char) };
            event(format!("register json: {}", status));
            let status = hearth_register_exit_handler(Some(on_instance_exit));
            event(format!("register exit: {}", status));
        }

        fn mock_loader() -> Arc<MockLoader> {
            Arc::new(
                MockLoader::new()
                    .with_image("a.so", MockImageBuilder::new().with_init(init_a).with_fini(fini_a))
                    .with_image("b.so", MockImageBuilder::new().with_init(init_b).with_fini(fini_b))
                    .with_image(
                        "c.so",
                        MockImageBuilder::new().with_init(init_nothing).with_fini(fini_c),
                    )
                    .with_image("plain.so", MockImageBuilder::new().with_init(init_nothing))
                    .with_image("no-init.so", MockImageBuilder::new())
                    .with_image(
                        "needs-fini.so",
                        MockImageBuilder::new()
                            .with_init(init_nothing)
                            .with_fini_required(),
                    )
                    .with_image(
                        "future.so",
                        MockImageBuilder::new()
                            .with_init(init_nothing)
                            .with_metadata(ModuleMetadata {
                                abi_version: hearth_runtime::ABI_VERSION + 1,
                                flags: 0,
                            }),
                    )
                    .with_image(
                        "broken-fini.so",
                        MockImageBuilder::new()
                            .with_init(init_nothing)
                            .with_fini(fini_broken),
                    )
                    .with_image(
                        "sticky.so",
                        MockImageBuilder::new()
                            .with_init(init_nothing)
                            .with_failing_close(),
                    )
                    .with_image("ext/json.so", MockImageBuilder::new().with_init(init_json)),
            )
        }

        fn instance_with(loader: &Arc<MockLoader>, limits: Limits) -> InstanceHandle {
            InstanceBuilder::new(Arc::new(TestRuntime::new()))
                .with_loader(loader.clone())
                .with_limits(limits)
                .build()
                .expect("instance can be created")
        }

        #[test]
        fn finalizers_run_once_in_reverse_load_order() {
            test_ex(|| {
                take_events();
                let loader = mock_loader();
                let mut inst = instance_with(&loader, Limits::default());
                inst.run_with(|| {
                    loader::import("a.so").unwrap();
                    loader::load("b.so").unwrap();
                    loader::load("c.so").unwrap();
                    assert_eq!(loader::loaded_count(), 3);
                    assert_eq!(
                        loader::loaded_paths(),
                        vec![PathBuf::from("a.so"), PathBuf::from("b.so"), PathBuf::from("c.so")]
                    );
                })
                .unwrap();
                assert_eq!(loader.open_handles(), 3);

                let report = inst.destroy().unwrap();
                assert!(report.is_clean());
                assert_eq!(take_events(), vec!["init a", "fini c", "fini b", "fini a"]);
                assert_eq!(loader.open_handles(), 0);
            })
        }

        #[test]
        fn failed_loads_register_nothing() {
            test_nonex(|| {
                let loader = mock_loader();
                let mut inst = instance_with(&loader, Limits::default());
                inst.run_with(|| {
                    loader::load("plain.so").unwrap();
                    let handles = loader.open_handles();
                    let opens = loader.opens();

                    let res = loader::load("missing.module");
                    assert!(matches!(
                        res,
                        Err(Error::ModuleError(ModuleError::NotFound(ref p))) if p == &PathBuf::from("missing.module")
                    ));
                    assert_eq!(loader.opens(), opens);

                    let res = loader::load("no-init.so");
                    assert!(matches!(
                        res,
                        Err(Error::ModuleError(ModuleError::BadEntryPoint { ordinal, .. })) if ordinal == Ordinal::INIT
                    ));

                    let res = loader::load("needs-fini.so");
                    assert!(matches!(
                        res,
                        Err(Error::ModuleError(ModuleError::BadEntryPoint { ordinal, .. })) if ordinal == Ordinal::FINI
                    ));

                    let res = loader::load("future.so");
                    assert!(matches!(
                        res,
                        Err(Error::ModuleError(ModuleError::AbiMismatch { found, expected, .. }))
                            if found == expected + 1
                    ));

                    // every rejected image was opened, then closed again
                    assert_eq!(loader.opens(), opens + 3);
                    assert_eq!(loader.open_handles(), handles);
                    assert_eq!(loader::loaded_count(), 1);
                })
                .unwrap();
                inst.destroy().unwrap();
                assert_eq!(loader.open_handles(), 0);
            })
        }

        #[test]
        fn promotion_is_idempotent() {
            test_ex(|| {
                take_events();
                let loader = mock_loader();
                let mut inst =
                    instance_with(&loader, Limits::default().with_promote_worker_loads(false));
                let l = loader.clone();
                let worker = inst
                    .run_with(move || {
                        thread::spawn(move || {
                            let me = thread::current_ident();
                            let handle = loader::load("a.so").unwrap();
                            assert_eq!(loader::scope_of(handle).unwrap(), OwnershipScope::Thread(me));
                            let opens = l.opens();

                            loader::promote(handle).unwrap();
                            assert_eq!(loader::scope_of(handle).unwrap(), OwnershipScope::Process);
                            assert_eq!(l.opens(), opens + 1);
                            assert_eq!(l.open_handles(), 1);

                            loader::promote(handle).unwrap();
                            assert_eq!(loader::scope_of(handle).unwrap(), OwnershipScope::Process);
                            assert_eq!(l.opens(), opens + 1);
                        })
                    })
                    .unwrap()
                    .unwrap();
                let status = inst.run_with(|| thread::wait_for_exit(worker)).unwrap();
                assert_eq!(status.unwrap(), ExitStatus::Returned);

                // the promoted image outlives the thread that loaded it
                assert_eq!(inst.run_with(loader::loaded_count).unwrap(), 1);
                assert!(take_events().is_empty());
                inst.destroy().unwrap();
                assert_eq!(take_events(), vec!["fini a"]);
                assert_eq!(loader.open_handles(), 0);
            })
        }

        #[test]
        fn unpromoted_worker_images_close_at_thread_exit() {
            test_ex(|| {
                take_events();
                let loader = mock_loader();
                let mut inst =
                    instance_with(&loader, Limits::default().with_promote_worker_loads(false));
                let worker = inst
                    .run_with(|| {
                        thread::spawn(|| {
                            loader::load("b.so").unwrap();
                        })
                    })
                    .unwrap()
                    .unwrap();
                inst.run_with(|| thread::wait_for_exit(worker))
                    .unwrap()
                    .unwrap();
                assert_eq!(inst.run_with(loader::loaded_count).unwrap(), 0);
                assert_eq!(take_events(), vec!["fini b"]);
                assert_eq!(loader.open_handles(), 0);
                inst.destroy().unwrap();
                assert!(take_events().is_empty());
            })
        }

        #[test]
        fn worker_loads_are_promoted_by_default() {
            test_nonex(|| {
                let loader = mock_loader();
                let mut inst = instance_with(&loader, Limits::default());
                let worker = inst
                    .run_with(|| {
                        thread::spawn(|| {
                            let handle = loader::load("plain.so").unwrap();
                            assert_eq!(loader::scope_of(handle).unwrap(), OwnershipScope::Process);
                        })
                    })
                    .unwrap()
                    .unwrap();
                let status = inst.run_with(|| thread::wait_for_exit(worker)).unwrap();
                assert_eq!(status.unwrap(), ExitStatus::Returned);
                assert_eq!(inst.run_with(loader::loaded_count).unwrap(), 1);
                assert_eq!(loader.open_handles(), 1);
                inst.destroy().unwrap();
                assert_eq!(loader.open_handles(), 0);
            })
        }

        #[test]
        fn home_thread_loads_are_process_scoped() {
            test_nonex(|| {
                let loader = mock_loader();
                let mut inst = instance_with(&loader, Limits::default());
                let scope = inst
                    .run_with(|| loader::scope_of(loader::load("plain.so").unwrap()).unwrap())
                    .unwrap();
                assert_eq!(scope, OwnershipScope::Process);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn import_attributes_registrations_to_the_image() {
            test_ex(|| {
                take_events();
                let loader = mock_loader();
                let mut inst = instance_with(&loader, Limits::default());
                let id = inst.id();
                let (origin, current, pending_origin) = inst
                    .run_with(|| {
                        loader::import("ext/json.so").unwrap();
                        let block = registry().current();
                        let (origin, pending_origin) = block.with_mut(|g| {
                            (
                                g.modules.get("json").and_then(|m| m.origin.clone()),
                                g.loading_origin().map(|p| p.to_path_buf()),
                            )
                        });
                        (origin, hearth_current_instance(), pending_origin)
                    })
                    .unwrap();
                assert_eq!(origin, Some(PathBuf::from("ext/json.so")));
                assert_eq!(pending_origin, None);
                assert_eq!(current, id.as_u64());
                assert_eq!(
                    take_events(),
                    vec![
                        format!("register json: {}", HEARTH_OK),
                        format!("register exit: {}", HEARTH_OK)
                    ]
                );

                inst.destroy().unwrap();
                assert_eq!(take_events(), vec!["instance exit"]);
            })
        }

        #[test]
        fn extension_callbacks_reject_bad_arguments() {
            test_nonex(|| {
                let mut inst = instance_with(&mock_loader(), Limits::default());
                let (null_name, no_handler) = inst
                    .run_with(|| unsafe {
                        (
                            hearth_register_module(std::ptr::null()),
                            hearth_register_exit_handler(None),
                        )
                    })
                    .unwrap();
                assert_eq!(null_name, HEARTH_EINVAL);
                assert_eq!(no_handler, HEARTH_EINVAL);
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn teardown_collects_finalizer_failures() {
            test_ex(|| {
                take_events();
                let loader = mock_loader();
                let mut inst = instance_with(&loader, Limits::default());
                inst.run_with(|| {
                    loader::load("a.so").unwrap();
                    loader::load("broken-fini.so").unwrap();
                    loader::load("sticky.so").unwrap();
                })
                .unwrap();

                let report = inst.destroy().unwrap();
                assert!(!report.is_clean());
                assert_eq!(report.finalizer_errors.len(), 2);
                assert!(matches!(
                    report.finalizer_errors[0],
                    ModuleError::Loader { ref path, .. } if path == &PathBuf::from("sticky.so")
                ));
                assert!(matches!(
                    report.finalizer_errors[1],
                    ModuleError::FinalizerFailed { status: 3, .. }
                ));
                // a failure does not stop the walk
                assert_eq!(take_events(), vec!["fini broken", "fini a"]);
                assert_eq!(loader.open_handles(), 0);
            })
        }

        #[test]
        fn platform_loader_reports_missing_files() {
            test_nonex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .with_loader(Arc::new(DlLoader::new()))
                    .build()
                    .unwrap();
                let res = inst
                    .run_with(|| loader::load("/nonexistent/hearth/missing.module"))
                    .unwrap();
                assert!(matches!(res, Err(Error::ModuleError(ModuleError::NotFound(_)))));
                inst.destroy().unwrap();
            })
        }

        #[test]
        fn platform_loader_rejects_foreign_libraries() {
            let lib = match system_library() {
                Some(lib) => lib,
                None => return,
            };
            test_nonex(|| {
                let mut inst = InstanceBuilder::new(Arc::new(TestRuntime::new()))
                    .build()
                    .unwrap();
                let (res, count) = inst
                    .run_with(|| (loader::load(lib), loader::loaded_count()))
                    .unwrap();
                assert!(matches!(
                    res,
                    Err(Error::ModuleError(ModuleError::BadEntryPoint { ordinal, .. })) if ordinal == Ordinal::INIT
                ));
                assert_eq!(count, 0);
                inst.destroy().unwrap();
            })
        }
    };
}
