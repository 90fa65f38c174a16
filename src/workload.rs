//! Workload generation.
//!
//! Produces the ordered operation stream the simulation feeds to the FTL:
//! one operation per discrete time unit, idle slots included. Time advances
//! uniformly; only non-idle operations end up wearing the device.

use rand::prelude::*;

use crate::config::{Addr, Config, Time};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Erase,
    /// Advances simulation time only.
    Idle,
}

#[derive(Clone, Debug)]
pub struct Operation {
    pub time: Time,
    pub kind: OpKind,
    /// Logical page for reads and writes, physical block index for erases,
    /// zero for idle slots.
    pub addr: Addr,
    pub data: Vec<u8>,
}

pub struct WorkloadGenerator {
    cfg: Config,
    rng: SmallRng,
}

impl WorkloadGenerator {
    /// A fixed seed reproduces the exact same operation stream.
    pub fn new(cfg: Config, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        WorkloadGenerator { cfg, rng }
    }

    fn random_data(&mut self) -> Vec<u8> {
        (0..self.cfg.workload_data_size)
            .map(|_| self.rng.gen::<u8>())
            .collect()
    }

    /// One operation per time unit: idle with the configured probability,
    /// otherwise read/write/erase picked by weight.
    pub fn generate(&mut self, total_time_units: Time) -> Vec<Operation> {
        let mut workload = Vec::with_capacity(total_time_units);
        let total_weight = self.cfg.write_weight + self.cfg.read_weight + self.cfg.erase_weight;

        for time in 0..total_time_units {
            if self.rng.gen::<f64>() < self.cfg.idle_probability {
                workload.push(Operation {
                    time,
                    kind: OpKind::Idle,
                    addr: 0,
                    data: Vec::new(),
                });
                continue;
            }

            let pick = self.rng.gen_range(0..total_weight);
            let op = if pick < self.cfg.write_weight {
                Operation {
                    time,
                    kind: OpKind::Write,
                    addr: self.rng.gen_range(0..self.cfg.logical_pages()),
                    data: self.random_data(),
                }
            } else if pick < self.cfg.write_weight + self.cfg.read_weight {
                Operation {
                    time,
                    kind: OpKind::Read,
                    addr: self.rng.gen_range(0..self.cfg.logical_pages()),
                    data: Vec::new(),
                }
            } else {
                Operation {
                    time,
                    kind: OpKind::Erase,
                    addr: self.rng.gen_range(0..self.cfg.physical_blocks),
                    data: Vec::new(),
                }
            };
            workload.push(op);
        }

        workload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            page_size: 16,
            logical_blocks: 2,
            physical_blocks: 4,
            pages_per_block: 4,
            workload_data_size: 8,
            ..Config::default()
        }
    }

    #[test]
    fn same_seed_reproduces_the_stream() {
        let cfg = small_config();
        let a = WorkloadGenerator::new(cfg, Some(7)).generate(200);
        let b = WorkloadGenerator::new(cfg, Some(7)).generate(200);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.kind, y.kind);
            assert_eq!(x.addr, y.addr);
            assert_eq!(x.data, y.data);
        }
    }

    #[test]
    fn addresses_stay_in_range() {
        let cfg = small_config();
        for op in WorkloadGenerator::new(cfg, Some(3)).generate(500) {
            match op.kind {
                OpKind::Read | OpKind::Write => assert!(op.addr < cfg.logical_pages()),
                OpKind::Erase => assert!(op.addr < cfg.physical_blocks),
                OpKind::Idle => assert_eq!(op.addr, 0),
            }
            if op.kind == OpKind::Write {
                assert_eq!(op.data.len(), cfg.workload_data_size);
            }
        }
    }

    #[test]
    fn zero_idle_probability_never_idles() {
        let cfg = Config {
            idle_probability: 0.0,
            ..small_config()
        };
        let ops = WorkloadGenerator::new(cfg, Some(11)).generate(300);
        assert!(ops.iter().all(|op| op.kind != OpKind::Idle));
    }

    #[test]
    fn time_advances_one_unit_per_slot() {
        let ops = WorkloadGenerator::new(small_config(), Some(1)).generate(50);
        for (i, op) in ops.iter().enumerate() {
            assert_eq!(op.time, i);
        }
    }
}
