// Compile-time layout shared with the fuzzer. Changing any of these breaks
// compatibility with the orchestrator side.

pub const MAP_SIZE_POW2: usize = 16;
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Descriptor the orchestrator writes commands to. Status messages go to
/// `FORKSRV_FD + 1`.
pub const FORKSRV_FD: i32 = 198;

/// Side channel used by forked children to relay translation requests.
pub const TSL_FD: i32 = FORKSRV_FD - 1;

/// Written once on start-up to tell the orchestrator the fork server is alive.
pub const FORKSRV_HELLO: [u8; 4] = *b"1234";
