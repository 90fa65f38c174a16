use thiserror::Error;

use crate::config::{Addr, BlockId};

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the engine.
///
/// Addressing and mapping-consistency faults are fatal to the operation that
/// raised them. Resource exhaustion is an ordinary operation failure the
/// caller decides how to treat. Declined reads/writes and exhausted blocks
/// are not errors at all; they surface as `Ok(None)` / `Ok(false)`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("logical address {addr} exceeds maximum logical address {max}")]
    LogicalAddressOutOfRange { addr: Addr, max: Addr },

    #[error("physical address {addr} exceeds maximum physical address {max}")]
    PhysicalAddressOutOfRange { addr: Addr, max: Addr },

    #[error("block id {block} exceeds maximum block id {max}")]
    BlockOutOfRange { block: BlockId, max: BlockId },

    /// Two or more logical addresses resolved to the same physical page.
    #[error("physical address {addr} is mapped by multiple logical addresses")]
    MappingConflict { addr: Addr },

    /// Logical addresses still resolved into a block after its programmed
    /// pages were relocated.
    #[error("logical addresses still mapped into block {block} after relocation")]
    StaleMappings { block: BlockId },

    #[error("no free pages available after garbage collection")]
    OutOfSpace,

    #[error("configuration error: {0}")]
    Config(&'static str),
}
