//! Static wear leveling.
//!
//! Periodically swaps cold data out of hot, heavily-erased blocks into
//! empty, lightly-erased ones. The leveler owns nothing but its own
//! checkpoint state; every pass borrows the FTL, so there is no ownership
//! cycle between the two.

#[cfg(test)]
use std::{println as info, println as warn, println as debug};

#[cfg(not(test))]
use log::{debug, info, warn};

use crate::config::{BlockId, Counter};
use crate::error::Result;
use crate::flash::PageState;
use crate::ftl::Ftl;

#[derive(Default)]
pub struct WearLeveler {
    /// Operation-counter stamp of the last pass that actually moved data.
    last_leveling_operation: Counter,
}

impl WearLeveler {
    pub fn new() -> Self {
        WearLeveler::default()
    }

    /// Gate for the periodic checkpoint: enough operations since the last
    /// pass, and enough recently-active blocks for leveling to be
    /// worthwhile on a busy device.
    pub fn should_trigger(&self, ftl: &Ftl) -> bool {
        let cfg = ftl.config();
        let operation_count = ftl.flash().operation_count();

        let since_last = operation_count - self.last_leveling_operation;
        if since_last < cfg.static_wear_level_check_interval {
            debug!(
                "skipping static wear leveling, only {} operations since last pass",
                since_last
            );
            return false;
        }

        let blocks = ftl.flash().blocks();
        let recently_active = blocks
            .iter()
            .filter(|b| b.was_recently_active(operation_count, cfg.activity_window))
            .count();
        let active_fraction = recently_active as f64 / blocks.len() as f64;
        debug!(
            "active block fraction {:.2} (threshold {:.2})",
            active_fraction, cfg.active_block_fraction
        );
        active_fraction >= cfg.active_block_fraction
    }

    /// One leveling pass: pair hot with cold blocks and migrate data.
    /// Returns whether any pair was actually leveled.
    pub fn run(&mut self, ftl: &mut Ftl) -> Result<bool> {
        let pairs = self.candidates(ftl);
        if pairs.is_empty() {
            return Ok(false);
        }

        let mut performed = false;
        for (hot, cold) in pairs {
            // Block state may have changed since candidate generation; the
            // cold side must still be completely empty.
            if !ftl.flash().block(cold).is_completely_erased() {
                continue;
            }
            if self.move_block_contents(ftl, hot, cold)? {
                info!("static wear leveling moved block {} into block {}", hot, cold);
                performed = true;
            }
        }

        if performed {
            self.last_leveling_operation = ftl.flash().operation_count();
        }
        Ok(performed)
    }

    /// Pair candidates around the median erase count: hot blocks come from
    /// the upper half (recently active, holding programmed data, most-worn
    /// first), cold blocks from the lower half (completely erased,
    /// least-worn first). Positional pairing, keeping only pairs whose wear
    /// gap exceeds the configured threshold.
    pub fn candidates(&self, ftl: &Ftl) -> Vec<(BlockId, BlockId)> {
        let cfg = ftl.config();
        let flash = ftl.flash();
        let operation_count = flash.operation_count();

        let mut by_wear: Vec<(BlockId, Counter)> = flash
            .blocks()
            .iter()
            .map(|b| (b.id, b.erase_count))
            .collect();
        by_wear.sort_by_key(|&(_, wear)| wear);

        let (lower, upper) = by_wear.split_at(by_wear.len() / 2);

        let mut hot: Vec<(BlockId, Counter)> = upper
            .iter()
            .copied()
            .filter(|&(id, _)| {
                let block = flash.block(id);
                block.was_recently_active(operation_count, cfg.activity_window)
                    && block.pages().iter().any(|p| p.state == PageState::Programmed)
            })
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1));

        // The lower half is already sorted by ascending wear.
        let cold: Vec<(BlockId, Counter)> = lower
            .iter()
            .copied()
            .filter(|&(id, _)| flash.block(id).is_completely_erased())
            .collect();

        let mut pairs = Vec::new();
        for (&(hot_id, hot_wear), &(cold_id, cold_wear)) in hot.iter().zip(cold.iter()) {
            // Halves are disjoint, but a block must never pair with itself.
            if hot_id == cold_id {
                continue;
            }
            if hot_wear - cold_wear > cfg.pe_cycle_difference_threshold {
                pairs.push((hot_id, cold_id));
            }
        }
        pairs
    }

    /// Move every programmed page from `source` to `target`, keeping the
    /// intra-block page offset. Each page's relocation (read, program,
    /// remap, invalidate) completes before anything else runs; the
    /// single-threaded model makes the sequence atomic to observers.
    ///
    /// A programmed page without a logical owner is an inconsistency and is
    /// repaired by invalidating it.
    fn move_block_contents(&self, ftl: &mut Ftl, source: BlockId, target: BlockId) -> Result<bool> {
        if !ftl.flash().block(target).is_completely_erased() {
            return Ok(false);
        }

        let pages_per_block = ftl.config().pages_per_block;
        let mut moved_any = false;

        for page_id in 0..pages_per_block {
            if ftl.flash().block(source).page(page_id).state != PageState::Programmed {
                continue;
            }
            let source_addr = source * pages_per_block + page_id;

            let Some(logical_addr) = ftl.find_logical_address(source, page_id) else {
                warn!(
                    "programmed page {} has no logical owner, invalidating",
                    source_addr
                );
                ftl.invalidate_physical(source_addr)?;
                continue;
            };

            let target_addr = target * pages_per_block + page_id;
            ftl.clear_mappings_to(target_addr);

            let Some(data) = ftl.flash_mut().read(source, page_id)? else {
                continue;
            };
            if !ftl.flash_mut().write(target, page_id, &data)? {
                warn!("target page {} declined program during leveling", target_addr);
                continue;
            }
            ftl.flash_mut().mark_moved(target, page_id)?;
            ftl.note_physical_write(target_addr);
            ftl.set_mapping(logical_addr, target_addr);
            ftl.invalidate_physical(source_addr)?;
            moved_any = true;

            if cfg!(debug_assertions) {
                ftl.verify_mapping()?;
            }
        }

        Ok(moved_any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flash::PageState;

    fn small_config() -> Config {
        Config {
            page_size: 16,
            logical_blocks: 2,
            physical_blocks: 4,
            pages_per_block: 4,
            max_pe_cycles: 100,
            pe_cycle_difference_threshold: 2,
            static_wear_level_check_interval: 0,
            activity_window: 1000,
            active_block_fraction: 0.1,
            workload_data_size: 8,
            ..Config::default()
        }
    }

    fn worn_ftl() -> Ftl {
        // Block 0 heavily erased, then programmed again: the hot block.
        let mut ftl = Ftl::new(small_config(), false).unwrap();
        for _ in 0..5 {
            ftl.erase_block(0).unwrap();
        }
        assert!(ftl.write(0, b"cold dat").unwrap());
        assert_eq!(ftl.mapped_physical(0), Some(0));
        ftl
    }

    #[test]
    fn pairs_hottest_with_coldest() {
        let ftl = worn_ftl();
        let leveler = WearLeveler::new();
        // Sorted by wear: blocks 1,2,3 (0 erases) below, block 0 (5) above.
        assert_eq!(leveler.candidates(&ftl), vec![(0, 1)]);
    }

    #[test]
    fn pairs_require_significant_wear_gap() {
        let mut ftl = worn_ftl();
        // Close the gap: wear the cold half up to the threshold.
        for block in 1..4 {
            for _ in 0..3 {
                ftl.erase_block(block).unwrap();
            }
        }
        let leveler = WearLeveler::new();
        assert!(leveler.candidates(&ftl).is_empty());
    }

    #[test]
    fn run_moves_data_and_remaps_at_same_offset() {
        let mut ftl = worn_ftl();
        let mut leveler = WearLeveler::new();

        assert!(leveler.run(&mut ftl).unwrap());

        // Same intra-block offset, one block over.
        assert_eq!(ftl.mapped_physical(0), Some(4));
        assert_eq!(ftl.read(0).unwrap().unwrap(), b"cold dat");
        assert_eq!(ftl.flash().block(0).page(0).state, PageState::Invalid);
        assert_eq!(ftl.flash().block(1).page(0).state, PageState::Programmed);
        assert!(ftl.verify_mapping().is_ok());
    }

    #[test]
    fn run_repairs_orphaned_programmed_page() {
        let mut ftl = worn_ftl();
        // Orphan the hot page by clearing its mapping behind the engine.
        ftl.clear_mappings_to(0);
        let mut leveler = WearLeveler::new();

        assert!(!leveler.run(&mut ftl).unwrap());
        assert_eq!(ftl.flash().block(0).page(0).state, PageState::Invalid);
    }

    #[test]
    fn trigger_respects_check_interval() {
        let cfg = Config {
            static_wear_level_check_interval: 1000,
            ..small_config()
        };
        let mut ftl = Ftl::new(cfg, false).unwrap();
        ftl.write(0, b"x").unwrap();
        let leveler = WearLeveler::new();
        assert!(!leveler.should_trigger(&ftl));
    }

    #[test]
    fn trigger_requires_recent_activity() {
        let cfg = Config {
            activity_window: 1,
            ..small_config()
        };
        let mut ftl = Ftl::new(cfg, false).unwrap();
        // Advance the operation counter past every activity stamp.
        for logical in 0..3 {
            ftl.write(logical, b"x").unwrap();
        }
        let leveler = WearLeveler::new();
        assert!(!leveler.should_trigger(&ftl));
    }

    #[test]
    fn trigger_fires_on_busy_device() {
        let mut ftl = Ftl::new(small_config(), false).unwrap();
        ftl.write(0, b"x").unwrap();
        let leveler = WearLeveler::new();
        assert!(leveler.should_trigger(&ftl));
    }
}
