use crate::error::{Error, Result};

pub type BaseType = usize;

pub type Addr = BaseType;
pub type PageId = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;
pub type Time = BaseType;

/// Geometry, endurance and policy knobs for one simulated device.
///
/// Every field is a read-only scalar consumed at construction time; nothing
/// in the engine mutates the config after `Ftl::new`.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Bytes per page. Typical NAND page size is 2 KiB.
    pub page_size: usize,
    /// Blocks visible to the host.
    pub logical_blocks: usize,
    /// Total blocks including over-provisioning.
    pub physical_blocks: usize,
    pub pages_per_block: usize,

    /// Program/erase cycles a page or block endures before it is retired.
    pub max_pe_cycles: Counter,

    /// Ratio of invalid to reclaimable pages above which a block becomes a
    /// garbage collection candidate.
    pub gc_threshold: f64,

    /// Minimum erase-count gap between a hot and a cold block before static
    /// wear leveling will pair them.
    pub pe_cycle_difference_threshold: Counter,
    /// Static wear leveling is considered every this many device operations.
    pub static_wear_level_check_interval: Counter,
    /// Fraction of blocks that must be recently active for static wear
    /// leveling to be worthwhile.
    pub active_block_fraction: f64,
    /// Erase-count distance from the least-worn free block within which a
    /// block still qualifies for dynamic-wear-leveled allocation.
    pub dynamic_wear_window: Counter,
    /// Operation distance under which a block counts as recently active.
    pub activity_window: Counter,

    /// Probability that a workload slot is idle.
    pub idle_probability: f64,
    pub write_weight: u32,
    pub read_weight: u32,
    pub erase_weight: u32,
    /// Payload size for generated writes.
    pub workload_data_size: usize,
    /// Time units per simulation run, one operation per unit.
    pub simulation_time_units: Time,
    /// Stop a run once this fraction of pages is dead.
    pub simulation_end_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: 2048,
            logical_blocks: 1024,
            physical_blocks: 1096,
            pages_per_block: 64,
            max_pe_cycles: 10_000,
            gc_threshold: 0.7,
            pe_cycle_difference_threshold: 200,
            static_wear_level_check_interval: 1000,
            active_block_fraction: 0.1,
            dynamic_wear_window: 100,
            activity_window: 1000,
            idle_probability: 0.3,
            write_weight: 40,
            read_weight: 40,
            erase_weight: 20,
            workload_data_size: 128,
            simulation_time_units: 10_000,
            simulation_end_threshold: 0.2,
        }
    }
}

impl Config {
    /// Pages visible to the host.
    pub fn logical_pages(&self) -> usize {
        self.logical_blocks * self.pages_per_block
    }

    /// Total pages including over-provisioning.
    pub fn physical_pages(&self) -> usize {
        self.physical_blocks * self.pages_per_block
    }

    pub fn total_memory_size(&self) -> usize {
        self.page_size * self.physical_pages()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pages_per_block == 0 || self.physical_blocks == 0 {
            return Err(Error::Config("device geometry must be non-empty"));
        }
        if self.logical_blocks > self.physical_blocks {
            return Err(Error::Config("logical blocks exceed physical blocks"));
        }
        if self.page_size == 0 {
            return Err(Error::Config("page size must be non-zero"));
        }
        if self.workload_data_size > self.page_size {
            return Err(Error::Config("workload payload larger than a page"));
        }
        if !(0.0..=1.0).contains(&self.idle_probability) {
            return Err(Error::Config("idle probability outside [0, 1]"));
        }
        if self.gc_threshold <= 0.0 {
            return Err(Error::Config("gc threshold must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.logical_pages(), 1024 * 64);
        assert_eq!(cfg.physical_pages(), 1096 * 64);
        assert_eq!(cfg.total_memory_size(), 2048 * 1096 * 64);
    }

    #[test]
    fn rejects_more_logical_than_physical_blocks() {
        let cfg = Config {
            logical_blocks: 8,
            physical_blocks: 4,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_oversized_workload_payload() {
        let cfg = Config {
            page_size: 64,
            workload_data_size: 128,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
