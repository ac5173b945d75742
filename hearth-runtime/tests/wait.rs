use hearth_runtime_tests::wait_tests;

wait_tests!(hearth_runtime_tests::runtime::TestRuntime);
