use hearth_runtime_tests::thread_tests;

thread_tests!(hearth_runtime_tests::runtime::TestRuntime);
