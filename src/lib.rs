//! Discrete-event simulation of a NAND flash device and its Flash
//! Translation Layer: page/block state machines, logical-to-physical
//! mapping, garbage collection, and dynamic plus static wear leveling.

pub mod config;
pub mod error;
pub mod flash;
pub mod ftl;
pub mod sim;
pub mod wear;
pub mod workload;

pub use config::{Addr, BlockId, Config, Counter, PageId, Time};
pub use error::{Error, Result};
pub use flash::{Block, BlockStatus, FlashMemory, MemoryStatus, Page, PageState};
pub use ftl::Ftl;
pub use wear::WearLeveler;
pub use workload::{OpKind, Operation, WorkloadGenerator};
