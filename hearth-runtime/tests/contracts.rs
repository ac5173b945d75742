use hearth_runtime_tests::contract_tests;

contract_tests!(hearth_runtime_tests::runtime::TestRuntime);
