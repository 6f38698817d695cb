//! C ABI used by the execution engine.

use crate::{
    setup::TargetLayout,
    shim::{Engine, Shim},
};

use afl_shim_common::tsl::TranslationRequest;
use libc::c_void;
use once_cell::sync::OnceCell;
use std::process;

/// Engine callbacks, any of them may be null.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AflShimCallbacks {
    pub data: *mut c_void,
    pub disable_atfork: Option<extern "C" fn(data: *mut c_void)>,
    pub warm_translation:
        Option<extern "C" fn(data: *mut c_void, pc: u64, cs_base: u64, flags: u64)>,
}

// `data` is only ever handed back to the engine, which owns it.
unsafe impl Send for AflShimCallbacks {}
unsafe impl Sync for AflShimCallbacks {}

impl Engine for AflShimCallbacks {
    fn suppress_atfork(&mut self) {
        if let Some(disable_atfork) = self.disable_atfork {
            disable_atfork(self.data);
        }
    }

    fn warm_translation(&mut self, request: &TranslationRequest) {
        if let Some(warm_translation) = self.warm_translation {
            warm_translation(self.data, request.pc, request.cs_base, request.flags);
        }
    }
}

static SHIM: OnceCell<(Shim, AflShimCallbacks)> = OnceCell::new();

/// Registers the target layout and the engine callbacks. Must be called
/// before the first block is executed.
#[no_mangle]
pub extern "C" fn afl_shim_init(
    entry_point: u64,
    start_code: u64,
    end_code: u64,
    callbacks: AflShimCallbacks,
) {
    env_logger::try_init().ok();

    let layout = TargetLayout {
        entry_point,
        start_code,
        end_code,
    };
    log::debug!("Target layout: {:x?}", layout);

    if SHIM.set((Shim::new(layout), callbacks)).is_err() {
        log::warn!("afl_shim_init called more than once, ignoring");
    }
}

#[no_mangle]
pub extern "C" fn afl_shim_on_block_entry(address: u64) {
    let (shim, callbacks) = match SHIM.get() {
        Some(shim) => shim,
        None => return,
    };

    let mut engine = *callbacks;
    if let Err(error) = shim.on_block_entry(address, &mut engine) {
        if error.is_parent_gone() {
            log::debug!("Fuzzer is gone, exiting fork server");
        } else {
            log::error!("{}", error);
        }
        process::exit(error.exit_code());
    }
}

#[no_mangle]
pub extern "C" fn afl_shim_on_missing_translation(pc: u64, cs_base: u64, flags: u64) {
    if let Some((shim, _)) = SHIM.get() {
        shim.on_missing_translation(pc, cs_base, flags);
    }
}
