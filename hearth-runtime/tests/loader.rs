use hearth_runtime_tests::loader_tests;

loader_tests!(hearth_runtime_tests::runtime::TestRuntime);
