//! AFL-style edge logging, invoked on every executed block.

use crate::{context, setup::InstrumentationContext};

use afl_shim_common::config::MAP_SIZE;

/// Block addresses are often aligned, mangle them into something
/// quasi-uniform over the map.
#[inline(always)]
pub fn scramble(address: u64) -> usize {
    (((address >> 4) ^ (address << 8)) as usize) & (MAP_SIZE - 1)
}

/// Whether a scrambled location is part of this run's instrumentation.
///
/// Depends on the location only, so the decision for a given block is the
/// same across runs.
#[inline(always)]
pub fn is_sampled(context: &InstrumentationContext, cur_loc: usize) -> bool {
    cur_loc < context.config.sampling_threshold
}

#[inline(always)]
pub fn edge_index(cur_loc: usize, prev_loc: usize) -> usize {
    cur_loc ^ prev_loc
}

/// Records the edge ending at the block starting at `address`.
#[inline]
pub fn log_block(context: &InstrumentationContext, address: u64) {
    if !context.bitmap.is_attached() {
        return;
    }

    let cur_loc = scramble(address);
    if !is_sampled(context, cur_loc) {
        return;
    }

    context.bitmap.bump(edge_index(cur_loc, context::prev_loc()));
    // The shift keeps A->B and B->A apart.
    context::set_prev_loc(cur_loc >> 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitmap::{MapBuf, SharedBitmap},
        setup::InstrumentationConfig,
    };
    use afl_shim_common::{fork_server::ForkServerOptions, shm};

    fn context_with_ratio(ratio: usize) -> InstrumentationContext {
        let mut mem = shm::SHM::<MapBuf>::new().unwrap();
        mem.clear();
        InstrumentationContext::new(
            SharedBitmap::from_shm(mem),
            InstrumentationConfig::with_ratio(ratio),
            ForkServerOptions::default(),
        )
    }

    fn hits(context: &InstrumentationContext) -> Vec<(usize, u8)> {
        (0..MAP_SIZE)
            .filter_map(|index| match context.bitmap.get(index) {
                Some(0) | None => None,
                Some(count) => Some((index, count)),
            })
            .collect()
    }

    #[test]
    fn test_scramble() {
        assert_eq!(0x100, scramble(0x1000));
        assert_eq!(0x200, scramble(0x2000));
        assert!(scramble(u64::MAX) < MAP_SIZE);
    }

    #[test]
    fn test_logs_edges() {
        let context = context_with_ratio(100);
        context::reset_edge_state();

        log_block(&context, 0x1000);
        log_block(&context, 0x2000);

        // 0 -> 0x100, then 0x100 -> 0x200 stored at 0x200 ^ (0x100 >> 1).
        assert_eq!(vec![(0x100, 1), (0x280, 1)], hits(&context));
        assert_eq!(0x100, context::prev_loc());
    }

    #[test]
    fn test_edges_are_directional() {
        let forward = context_with_ratio(100);
        context::reset_edge_state();
        log_block(&forward, 0x1000);
        log_block(&forward, 0x2000);

        let backward = context_with_ratio(100);
        context::reset_edge_state();
        log_block(&backward, 0x2000);
        log_block(&backward, 0x1000);

        assert_eq!(vec![(0x100, 1), (0x280, 1)], hits(&forward));
        assert_eq!(vec![(0, 1), (0x200, 1)], hits(&backward));
    }

    #[test]
    fn test_repeated_block_counts() {
        let context = context_with_ratio(100);
        for _ in 0..3 {
            context::reset_edge_state();
            log_block(&context, 0x1000);
        }
        assert_eq!(vec![(0x100, 3)], hits(&context));
    }

    #[test]
    fn test_sampling_is_stable() {
        let context = context_with_ratio(20);
        for address in (0x40_0000u64..0x40_4000).step_by(0x10) {
            let cur_loc = scramble(address);
            let first = is_sampled(&context, cur_loc);
            for _ in 0..3 {
                assert_eq!(first, is_sampled(&context, scramble(address)));
            }
        }
    }

    #[test]
    fn test_sampling_ratio_converges() {
        for &ratio in &[1usize, 10, 37, 50, 100] {
            let context = context_with_ratio(ratio);
            // Aligned addresses covering every scrambled location once.
            let sampled = (0..MAP_SIZE as u64)
                .filter(|index| is_sampled(&context, scramble(index << 4)))
                .count();
            let fraction = sampled as f64 / MAP_SIZE as f64;
            assert!(
                (fraction - ratio as f64 / 100.0).abs() < 0.01,
                "ratio {}: sampled {}",
                ratio,
                fraction
            );
        }
    }

    #[test]
    fn test_skipped_location_leaves_state_alone() {
        let context = context_with_ratio(1);
        context::set_prev_loc(0x42);

        // Scrambles to 0xffff, far above the 1% threshold.
        let address = 0xfff0;
        assert!(!is_sampled(&context, scramble(address)));
        log_block(&context, address);

        assert!(hits(&context).is_empty());
        assert_eq!(0x42, context::prev_loc());
    }

    #[test]
    fn test_unattached_is_noop() {
        let context = InstrumentationContext::new(
            SharedBitmap::unattached(),
            InstrumentationConfig::default(),
            ForkServerOptions::default(),
        );
        context::set_prev_loc(0x42);
        log_block(&context, 0x1000);
        assert_eq!(0x42, context::prev_loc());
    }
}
