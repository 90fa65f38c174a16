//! Simulation runner.
//!
//! Feeds a generated workload through the FTL, drives the periodic static
//! wear-leveling checkpoint, and returns the device's dead-page history.

#[cfg(test)]
use std::{println as info, println as warn};

#[cfg(not(test))]
use log::{info, warn};

use crate::config::{Config, Time};
use crate::error::{Error, Result};
use crate::ftl::Ftl;
use crate::wear::WearLeveler;
use crate::workload::{OpKind, WorkloadGenerator};

/// Run one simulation over a freshly generated workload.
///
/// With `use_wear_leveling` both strategies are active: dynamic wear
/// leveling inside the FTL's allocator and static wear leveling at the
/// periodic checkpoint. Returns the `(time, dead_pages)` history.
pub fn run(cfg: &Config, use_wear_leveling: bool, seed: Option<u64>) -> Result<Vec<(Time, usize)>> {
    cfg.validate()?;

    let mut ftl = Ftl::new(*cfg, use_wear_leveling)?;
    let mut wear_leveler = use_wear_leveling.then(WearLeveler::new);

    let workload = WorkloadGenerator::new(*cfg, seed).generate(cfg.simulation_time_units);

    for op in workload {
        ftl.set_time(op.time);

        match op.kind {
            // Idle advances simulation time only; no wear, no sample.
            OpKind::Idle => continue,
            OpKind::Write => match ftl.write(op.addr, &op.data) {
                Ok(_) => {}
                Err(Error::OutOfSpace) => {
                    warn!("device full at time {}, ending run", op.time);
                    break;
                }
                Err(e) => return Err(e),
            },
            OpKind::Read => {
                ftl.read(op.addr)?;
            }
            OpKind::Erase => match ftl.erase_block(op.addr) {
                // An exhausted block reports Ok(false); the run continues.
                Ok(_) => {}
                Err(Error::OutOfSpace) => {
                    warn!("no headroom to relocate block {} at time {}, ending run", op.addr, op.time);
                    break;
                }
                Err(e) => return Err(e),
            },
        }

        ftl.flash_mut().record_history_sample();

        if let Some(leveler) = wear_leveler.as_mut() {
            let operation_count = ftl.flash().operation_count();
            let interval = cfg.static_wear_level_check_interval.max(1);
            if operation_count % interval == 0
                && leveler.should_trigger(&ftl)
                && leveler.run(&mut ftl)?
            {
                info!(
                    "static wear leveling performed at operation {} (time {})",
                    operation_count, op.time
                );
            }
        }

        let status = ftl.flash().get_memory_status();
        let dead_fraction = status.dead_pages as f64 / status.physical_pages as f64;
        if dead_fraction > cfg.simulation_end_threshold {
            info!(
                "run ended early at time {}: {:.0}% of pages are dead",
                op.time,
                dead_fraction * 100.0
            );
            break;
        }
    }

    Ok(ftl.flash().history().to_vec())
}
