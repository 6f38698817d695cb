// Environment variables
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
pub const INST_RATIO_VAR: &str = "AFL_INST_RATIO";
pub const INST_LIBS_VAR: &str = "AFL_INST_LIBS";
pub const TSL_RELAY_VAR: &str = "AFL_SHIM_TSL_RELAY";
pub const FORKSRV_PACE_VAR: &str = "AFL_SHIM_FORKSRV_PACE_MS";

// Exit statuses, one per fatal failure point so that the fuzzer logs can
// tell them apart.
pub const SETUP_FAILED_CODE: i32 = 1;
pub const PARENT_GONE_CODE: i32 = 2;
pub const RELAY_SETUP_FAILED_CODE: i32 = 3;
pub const FORK_FAILED_CODE: i32 = 4;
pub const PID_WRITE_FAILED_CODE: i32 = 5;
pub const WAIT_FAILED_CODE: i32 = 6;
pub const STATUS_WRITE_FAILED_CODE: i32 = 7;
