use crate::bitmap::SharedBitmap;

use afl_shim_common::{
    config::{MAP_SIZE, TSL_FD},
    defs,
    fork_server::ForkServerOptions,
    shm,
};
use snafu::{ResultExt, Snafu};
use std::{env, num::ParseIntError, ops::RangeInclusive, result, time::Duration};

/// Where the target lives, as reported by the engine's loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLayout {
    /// Entry point of the target, where the fork server is started.
    pub entry_point: u64,
    /// Start of the `.text` section.
    pub start_code: u64,
    /// End of the `.text` section.
    pub end_code: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationConfig {
    /// Scrambled locations at or above this value are not recorded.
    pub sampling_threshold: usize,
    pub instrument_all_code: bool,
    /// Code region of interest. Recorded for diagnostics only, sampling
    /// already bounds the overhead so blocks are never filtered by address.
    pub code_range: RangeInclusive<u64>,
}

impl InstrumentationConfig {
    /// Configuration recording `ratio` percent of the locations, `ratio` is
    /// clamped to `[1, 100]`.
    pub fn with_ratio(ratio: usize) -> Self {
        let ratio = ratio.max(1).min(100);
        Self {
            sampling_threshold: MAP_SIZE * ratio / 100,
            ..Self::default()
        }
    }
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            sampling_threshold: MAP_SIZE,
            instrument_all_code: false,
            code_range: 0..=u64::MAX,
        }
    }
}

/// Everything the hooks need, built once when the entry point is reached.
#[derive(Debug)]
pub struct InstrumentationContext {
    pub bitmap: SharedBitmap,
    pub config: InstrumentationConfig,
    pub fork_server: ForkServerOptions,
}

impl InstrumentationContext {
    pub fn new(
        bitmap: SharedBitmap,
        config: InstrumentationConfig,
        fork_server: ForkServerOptions,
    ) -> Self {
        Self {
            bitmap,
            config,
            fork_server,
        }
    }

    pub fn from_env(layout: &TargetLayout) -> Result<Self> {
        Self::from_lookup(layout, |name| env::var(name).ok())
    }

    /// Builds the context reading variables through `lookup`.
    pub fn from_lookup<F>(layout: &TargetLayout, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let inst_ratio = lookup(defs::INST_RATIO_VAR).map(|value| parse_ratio(&value));
        let mut config = match inst_ratio {
            Some(ratio) => InstrumentationConfig::with_ratio(ratio),
            None => InstrumentationConfig::default(),
        };

        let bitmap = match lookup(defs::SHM_ENV_VAR) {
            Some(shm_id) => {
                let id = shm_id
                    .trim()
                    .parse::<i32>()
                    .context(ParseShmIdFailed { var_value: shm_id })?;
                let bitmap = SharedBitmap::attach(id).context(AttachFailed)?;

                // With a low ratio the map could stay empty, touch it so that
                // the fuzzer does not give up on us.
                if inst_ratio.is_some() {
                    bitmap.mark_alive();
                }
                bitmap
            },
            None => {
                log::debug!("{} not set, coverage disabled", defs::SHM_ENV_VAR);
                SharedBitmap::unattached()
            },
        };

        if lookup(defs::INST_LIBS_VAR).is_some() {
            config.instrument_all_code = true;
            config.code_range = 0..=u64::MAX;
        } else {
            config.code_range = layout.start_code..=layout.end_code;
        }

        let fork_server = ForkServerOptions {
            relay_fd: lookup(defs::TSL_RELAY_VAR).map(|_| TSL_FD),
            pace: lookup(defs::FORKSRV_PACE_VAR).and_then(|value| parse_pace(&value)),
        };

        log::debug!(
            "Instrumentation: threshold {}/{}, all code: {}, range {:#x}..={:#x}",
            config.sampling_threshold,
            MAP_SIZE,
            config.instrument_all_code,
            config.code_range.start(),
            config.code_range.end(),
        );
        log::debug!("Fork server: {:?}", fork_server);

        if log::log_enabled!(log::Level::Trace) {
            log_mapped_memory();
        }

        Ok(Self::new(bitmap, config, fork_server))
    }
}

fn parse_ratio(value: &str) -> usize {
    match value.trim().parse::<usize>() {
        Ok(ratio) => ratio,
        Err(error) => {
            log::warn!(
                "Ignoring {}={:?}: {}",
                defs::INST_RATIO_VAR,
                value,
                error
            );
            0
        },
    }
}

fn parse_pace(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(millis) => Some(Duration::from_millis(millis)),
        Err(error) => {
            log::warn!(
                "Ignoring {}={:?}: {}",
                defs::FORKSRV_PACE_VAR,
                value,
                error
            );
            None
        },
    }
}

fn log_mapped_memory() {
    let me = match procfs::process::Process::myself() {
        Ok(me) => me,
        Err(error) => {
            log::trace!("Could not inspect own process: {}", error);
            return;
        },
    };

    if let Ok(stat) = me.stat() {
        log::trace!("process rss: {} pages", stat.rss);
    }

    let maps = match me.smaps() {
        Ok(maps) => maps,
        Err(error) => {
            log::trace!("Could not read smaps: {}", error);
            return;
        },
    };

    let mut total_rss = 0;
    log::trace!("maps:");
    for (map, map_data) in maps {
        if let Some(rss) = map_data.map.get("Rss") {
            total_rss += *rss;
            log::trace!(
                "  rss: {} pages,\tperms: {}, addr: ({:#14x},{:#14x})\tpath: {:?}",
                rss / 4096,
                map.perms,
                map.address.0,
                map.address.1,
                map.pathname
            );
        }
    }
    log::trace!("total rss: {} pages", total_rss / 4096);
}

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not parse {:?} as shared memory ID: {}", var_value, source))]
    ParseShmIdFailed {
        var_value: String,
        source: ParseIntError,
    },
    #[snafu(display("Could not map coverage bitmap: {}", source))]
    AttachFailed { source: shm::Error },
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        defs::SETUP_FAILED_CODE
    }
}
