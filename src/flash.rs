//! Physical layer: pages, blocks and the flash device itself.
//!
//! The device knows nothing about logical addresses. It exposes
//! page-granular program/read/invalidate and block-granular erase, and keeps
//! the wear bookkeeping (P/E cycle counts, dead pages) that the FTL and the
//! wear levelers query through `get_block_status` / `get_memory_status`.

#[cfg(test)]
use std::{println as warn, println as debug};

#[cfg(not(test))]
use log::{debug, warn};

use crate::config::{BlockId, Config, Counter, PageId, Time};
use crate::error::{Error, Result};

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum PageState {
    Erased,
    Programmed,
    Invalid,
    /// Terminal. A dead page never changes state again.
    Dead,
}

#[derive(Clone, Debug)]
pub struct Page {
    pub state: PageState,
    pub data: Option<Vec<u8>>,
    pub pe_cycles: Counter,
    pub last_write_time: Time,
    pub last_moved_time: Time,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            state: PageState::Erased,
            data: None,
            pe_cycles: 0,
            last_write_time: 0,
            last_moved_time: 0,
        }
    }
}

/// Per-block page-state census, the primitive both GC and wear leveling
/// build their candidate selection on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockStatus {
    pub erase_count: Counter,
    pub erased_pages: usize,
    pub programmed_pages: usize,
    pub invalid_pages: usize,
    pub dead_pages: usize,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pages: Vec<Page>,
    pub erase_count: Counter,
    /// Operation-counter stamp of the last access, used for the
    /// recent-activity gate of static wear leveling.
    pub last_operation_number: Counter,
    pub last_operation_time: Time,
}

impl Block {
    fn new(id: BlockId, pages_per_block: usize) -> Self {
        Block {
            id,
            pages: vec![Page::default(); pages_per_block],
            erase_count: 0,
            last_operation_number: 0,
            last_operation_time: 0,
        }
    }

    pub fn page(&self, page_id: PageId) -> &Page {
        &self.pages[page_id]
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn was_recently_active(&self, current_operation: Counter, activity_window: Counter) -> bool {
        current_operation - self.last_operation_number < activity_window
    }

    pub fn is_completely_erased(&self) -> bool {
        self.pages.iter().all(|p| p.state == PageState::Erased)
    }

    pub fn status(&self) -> BlockStatus {
        let mut status = BlockStatus {
            erase_count: self.erase_count,
            erased_pages: 0,
            programmed_pages: 0,
            invalid_pages: 0,
            dead_pages: 0,
        };
        for page in &self.pages {
            match page.state {
                PageState::Erased => status.erased_pages += 1,
                PageState::Programmed => status.programmed_pages += 1,
                PageState::Invalid => status.invalid_pages += 1,
                PageState::Dead => status.dead_pages += 1,
            }
        }
        status
    }

    /// Erase every non-dead page. Returns false once the block has reached
    /// its endurance limit; from then on every attempt fails and the
    /// remaining pages are retired.
    fn erase(&mut self, operation_number: Counter, max_pe_cycles: Counter) -> bool {
        if self.erase_count >= max_pe_cycles {
            for page in &mut self.pages {
                if page.state != PageState::Dead {
                    page.state = PageState::Dead;
                    page.data = None;
                }
            }
            warn!("block {} has exceeded its P/E cycle limit", self.id);
            return false;
        }

        if self.pages.iter().all(|p| p.state == PageState::Dead) {
            debug!("all pages in block {} are dead, erase is a no-op", self.id);
            return true;
        }

        self.erase_count += 1;
        self.last_operation_number = operation_number;

        let mut pages_erased = 0;
        for page in &mut self.pages {
            if page.state == PageState::Dead {
                continue;
            }
            page.data = None;
            page.pe_cycles += 1;
            page.state = if page.pe_cycles >= max_pe_cycles {
                PageState::Dead
            } else {
                PageState::Erased
            };
            pages_erased += 1;
        }

        pages_erased > 0
    }
}

/// Aggregate page-state counts for the whole device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryStatus {
    pub erased_pages: usize,
    pub programmed_pages: usize,
    pub invalid_pages: usize,
    pub dead_pages: usize,
    pub physical_pages: usize,
}

pub struct FlashMemory {
    cfg: Config,
    blocks: Vec<Block>,
    /// Completed read/write/erase operations. Idle and declined operations
    /// never advance this counter; wear depends on operations, not time.
    operation_count: Counter,
    /// Caller-supplied clock, only used to stamp page and block activity.
    simulation_time: Time,
    /// Append-only `(time, dead_page_count)` series.
    history: Vec<(Time, usize)>,
}

impl FlashMemory {
    pub fn new(cfg: Config) -> Self {
        FlashMemory {
            blocks: (0..cfg.physical_blocks)
                .map(|id| Block::new(id, cfg.pages_per_block))
                .collect(),
            cfg,
            operation_count: 0,
            simulation_time: 0,
            history: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn block(&self, block_id: BlockId) -> &Block {
        &self.blocks[block_id]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn operation_count(&self) -> Counter {
        self.operation_count
    }

    pub fn set_time(&mut self, time: Time) {
        self.simulation_time = time;
    }

    pub fn history(&self) -> &[(Time, usize)] {
        &self.history
    }

    fn check_address(&self, block_id: BlockId, page_id: PageId) -> Result<()> {
        self.check_block(block_id)?;
        if page_id >= self.cfg.pages_per_block {
            return Err(Error::PhysicalAddressOutOfRange {
                addr: block_id * self.cfg.pages_per_block + page_id,
                max: self.cfg.physical_pages() - 1,
            });
        }
        Ok(())
    }

    fn check_block(&self, block_id: BlockId) -> Result<()> {
        if block_id >= self.cfg.physical_blocks {
            return Err(Error::BlockOutOfRange {
                block: block_id,
                max: self.cfg.physical_blocks - 1,
            });
        }
        Ok(())
    }

    /// Program one page. Declined (`Ok(false)`) unless the page is currently
    /// erased.
    pub fn write(&mut self, block_id: BlockId, page_id: PageId, data: &[u8]) -> Result<bool> {
        self.check_address(block_id, page_id)?;
        debug_assert!(data.len() <= self.cfg.page_size, "payload exceeds page size");

        let time = self.simulation_time;
        let operation = self.operation_count;
        let block = &mut self.blocks[block_id];
        let page = &mut block.pages[page_id];

        if page.state != PageState::Erased {
            return Ok(false);
        }

        page.data = Some(data.to_vec());
        page.state = PageState::Programmed;
        page.last_write_time = time;

        block.last_operation_number = operation;
        block.last_operation_time = time;

        // The checkpoint logic reads operation_count, so the increment must
        // be the last visible effect of the call.
        self.operation_count += 1;

        Ok(true)
    }

    /// Read one page. `Ok(None)` unless the page is programmed.
    pub fn read(&mut self, block_id: BlockId, page_id: PageId) -> Result<Option<Vec<u8>>> {
        self.check_address(block_id, page_id)?;

        let time = self.simulation_time;
        let operation = self.operation_count;
        let block = &mut self.blocks[block_id];
        if block.pages[page_id].state != PageState::Programmed {
            return Ok(None);
        }

        block.last_operation_number = operation;
        block.last_operation_time = time;

        let data = block.pages[page_id].data.clone();
        self.operation_count += 1;

        Ok(data)
    }

    pub fn invalidate_page(&mut self, block_id: BlockId, page_id: PageId) -> Result<()> {
        self.check_address(block_id, page_id)?;
        let page = &mut self.blocks[block_id].pages[page_id];
        page.state = PageState::Invalid;
        page.data = None;
        Ok(())
    }

    /// Stamp a page as relocated by wear leveling.
    pub fn mark_moved(&mut self, block_id: BlockId, page_id: PageId) -> Result<()> {
        self.check_address(block_id, page_id)?;
        self.blocks[block_id].pages[page_id].last_moved_time = self.simulation_time;
        Ok(())
    }

    /// Erase a whole block. `Ok(false)` means the block has reached its
    /// endurance limit and is now exhausted; that is a terminal state, not
    /// an error.
    pub fn erase_block(&mut self, block_id: BlockId) -> Result<bool> {
        self.check_block(block_id)?;

        let time = self.simulation_time;
        let operation = self.operation_count;
        let block = &mut self.blocks[block_id];
        block.last_operation_time = time;

        if block.erase(operation, self.cfg.max_pe_cycles) {
            self.operation_count += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn get_block_status(&self, block_id: BlockId) -> Result<BlockStatus> {
        self.check_block(block_id)?;
        Ok(self.blocks[block_id].status())
    }

    pub fn get_memory_status(&self) -> MemoryStatus {
        let mut status = MemoryStatus {
            erased_pages: 0,
            programmed_pages: 0,
            invalid_pages: 0,
            dead_pages: 0,
            physical_pages: self.cfg.physical_pages(),
        };
        for block in &self.blocks {
            let s = block.status();
            status.erased_pages += s.erased_pages;
            status.programmed_pages += s.programmed_pages;
            status.invalid_pages += s.invalid_pages;
            status.dead_pages += s.dead_pages;
        }
        status
    }

    pub fn dead_pages(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| b.pages.iter())
            .filter(|p| p.state == PageState::Dead)
            .count()
    }

    /// Append one `(time, dead_pages)` sample. The simulation loop calls
    /// this once per processed non-idle operation.
    pub fn record_history_sample(&mut self) {
        let sample = (self.simulation_time, self.dead_pages());
        self.history.push(sample);
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
            max_pe_cycles: 2,
            workload_data_size: 8,
            ..Config::default()
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut flash = FlashMemory::new(small_config());
        assert!(flash.write(1, 2, b"payload!").unwrap());
        assert_eq!(flash.read(1, 2).unwrap().unwrap(), b"payload!");
        assert_eq!(flash.block(1).page(2).state, PageState::Programmed);
    }

    #[test]
    fn write_declines_on_programmed_page() {
        let mut flash = FlashMemory::new(small_config());
        assert!(flash.write(0, 0, b"first").unwrap());
        assert!(!flash.write(0, 0, b"second").unwrap());
        assert_eq!(flash.read(0, 0).unwrap().unwrap(), b"first");
    }

    #[test]
    fn read_of_unprogrammed_page_is_none() {
        let mut flash = FlashMemory::new(small_config());
        assert_eq!(flash.read(0, 0).unwrap(), None);
        flash.invalidate_page(0, 0).unwrap();
        assert_eq!(flash.read(0, 0).unwrap(), None);
    }

    #[test]
    fn out_of_range_addresses_are_hard_faults() {
        let mut flash = FlashMemory::new(small_config());
        assert!(matches!(
            flash.read(4, 0),
            Err(Error::BlockOutOfRange { .. })
        ));
        assert!(matches!(
            flash.write(0, 4, b"x"),
            Err(Error::PhysicalAddressOutOfRange { .. })
        ));
    }

    #[test]
    fn operation_count_increments_after_timestamps() {
        let mut flash = FlashMemory::new(small_config());
        flash.set_time(5);
        assert!(flash.write(0, 0, b"x").unwrap());
        // The block saw the pre-increment counter.
        assert_eq!(flash.block(0).last_operation_number, 0);
        assert_eq!(flash.operation_count(), 1);
        // Declined operations never advance the counter.
        assert!(!flash.write(0, 0, b"y").unwrap());
        assert_eq!(flash.operation_count(), 1);
    }

    #[test]
    fn erase_resets_pages_and_bumps_cycles() {
        let mut flash = FlashMemory::new(small_config());
        assert!(flash.write(0, 0, b"x").unwrap());
        assert!(flash.write(0, 1, b"y").unwrap());
        assert!(flash.erase_block(0).unwrap());

        let status = flash.get_block_status(0).unwrap();
        assert_eq!(status.erase_count, 1);
        assert_eq!(status.erased_pages, 4);
        assert_eq!(flash.block(0).page(0).pe_cycles, 1);
        assert_eq!(flash.read(0, 0).unwrap(), None);
    }

    #[test]
    fn block_dies_at_endurance_limit_and_fails_thereafter() {
        // max_pe_cycles = 2: two erases wear the block out, the third fails.
        let mut flash = FlashMemory::new(small_config());
        assert!(flash.erase_block(0).unwrap());
        assert!(flash.erase_block(0).unwrap());

        let status = flash.get_block_status(0).unwrap();
        assert_eq!(status.dead_pages, 4);

        assert!(!flash.erase_block(0).unwrap());
        let status = flash.get_block_status(0).unwrap();
        assert_eq!(status.dead_pages, 4);
        assert_eq!(status.erase_count, 2);
    }

    #[test]
    fn pe_cycles_never_decrease() {
        let mut flash = FlashMemory::new(small_config());
        let mut last = 0;
        for _ in 0..4 {
            flash.erase_block(0).unwrap();
            let now = flash.block(0).page(0).pe_cycles;
            assert!(now >= last);
            last = now;
        }
        // Once dead, stays dead.
        assert_eq!(flash.block(0).page(0).state, PageState::Dead);
        flash.erase_block(0).unwrap();
        assert_eq!(flash.block(0).page(0).state, PageState::Dead);
    }

    #[test]
    fn history_samples_append_in_order() {
        let mut flash = FlashMemory::new(small_config());
        flash.set_time(1);
        flash.record_history_sample();
        flash.erase_block(0).unwrap();
        flash.erase_block(0).unwrap();
        flash.set_time(2);
        flash.record_history_sample();
        assert_eq!(flash.history(), &[(1, 0), (2, 4)]);
    }
}
