use hearth_runtime_tests::lifecycle_tests;

lifecycle_tests!(hearth_runtime_tests::runtime::TestRuntime);
