use hearth_runtime_tests::lease_tests;

lease_tests!(hearth_runtime_tests::runtime::TestRuntime);
