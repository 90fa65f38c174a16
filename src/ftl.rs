//! Flash Translation Layer.
//!
//! Owns the logical-to-physical mapping table and the free-page/free-block
//! caches, and coordinates garbage collection and dynamic wear leveling
//! around every host write. The flash device never sees a logical address.

#[cfg(test)]
use std::{println as info, println as trace, println as debug};

#[cfg(not(test))]
use log::{debug, info, trace};

use std::collections::{BTreeSet, HashMap};

use byte_unit::Byte;
use num_integer::Integer;

use crate::config::{Addr, BlockId, Config, PageId};
use crate::error::{Error, Result};
use crate::flash::{FlashMemory, PageState};

pub struct Ftl {
    flash: FlashMemory,
    cfg: Config,
    /// Logical-to-physical mapping, indexed by logical page address.
    /// `None` means unmapped. The FTL is the only mutator of this table.
    l2p: Vec<Option<Addr>>,
    /// Physical addresses whose page is currently erased. Derived cache,
    /// reconstructible from page state via `reconcile_free_sets`. A BTreeSet
    /// gives the allocator its deterministic lowest-address-first order.
    free_pages: BTreeSet<Addr>,
    /// Blocks with at least one free page. Same derived-cache discipline.
    free_blocks: BTreeSet<BlockId>,
    dynamic_wear_leveling: bool,
}

impl Ftl {
    pub fn new(cfg: Config, dynamic_wear_leveling: bool) -> Result<Self> {
        cfg.validate()?;

        trace!(
            "physical capacity: {} bytes, {}",
            cfg.total_memory_size(),
            Byte::from(cfg.total_memory_size())
                .get_appropriate_unit(true)
                .to_string()
        );
        trace!(
            "user capacity: {} bytes, {}",
            cfg.page_size * cfg.logical_pages(),
            Byte::from(cfg.page_size * cfg.logical_pages())
                .get_appropriate_unit(true)
                .to_string()
        );

        // Host-visible pages start mapped one-to-one onto the first
        // logical_pages physical pages; the over-provisioned tail is free.
        let l2p = (0..cfg.logical_pages()).map(Some).collect();

        Ok(Ftl {
            flash: FlashMemory::new(cfg),
            l2p,
            free_pages: (0..cfg.physical_pages()).collect(),
            free_blocks: (0..cfg.physical_blocks).collect(),
            dynamic_wear_leveling,
            cfg,
        })
    }

    pub fn flash(&self) -> &FlashMemory {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashMemory {
        &mut self.flash
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn set_time(&mut self, time: crate::config::Time) {
        self.flash.set_time(time);
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    /// Physical address currently backing a logical page, if any.
    pub fn mapped_physical(&self, logical_addr: Addr) -> Option<Addr> {
        self.l2p.get(logical_addr).copied().flatten()
    }

    fn split(&self, physical_addr: Addr) -> (BlockId, PageId) {
        physical_addr.div_rem(&self.cfg.pages_per_block)
    }

    fn join(&self, block_id: BlockId, page_id: PageId) -> Addr {
        block_id * self.cfg.pages_per_block + page_id
    }

    fn validate_logical(&self, logical_addr: Addr) -> Result<()> {
        if logical_addr >= self.cfg.logical_pages() {
            return Err(Error::LogicalAddressOutOfRange {
                addr: logical_addr,
                max: self.cfg.logical_pages() - 1,
            });
        }
        Ok(())
    }

    fn validate_physical(&self, physical_addr: Addr) -> Result<()> {
        if physical_addr >= self.cfg.physical_pages() {
            return Err(Error::PhysicalAddressOutOfRange {
                addr: physical_addr,
                max: self.cfg.physical_pages() - 1,
            });
        }
        Ok(())
    }

    pub fn read(&mut self, logical_addr: Addr) -> Result<Option<Vec<u8>>> {
        self.validate_logical(logical_addr)?;

        let Some(physical_addr) = self.l2p[logical_addr] else {
            return Ok(None);
        };
        self.validate_physical(physical_addr)?;

        let (block_id, page_id) = self.split(physical_addr);
        self.flash.read(block_id, page_id)
    }

    /// Host write entry point. `Ok(false)` means the device declined the
    /// physical program; exhaustion after a GC attempt is `Err(OutOfSpace)`.
    pub fn write(&mut self, logical_addr: Addr, data: &[u8]) -> Result<bool> {
        if self.dynamic_wear_leveling {
            self.write_with_dynamic_wear_leveling(logical_addr, data)
        } else {
            self.write_without_wear_leveling(logical_addr, data)
        }
    }

    fn write_without_wear_leveling(&mut self, logical_addr: Addr, data: &[u8]) -> Result<bool> {
        self.validate_logical(logical_addr)?;
        self.invalidate_current_mapping(logical_addr)?;

        let physical_addr = match self.next_free_page() {
            Some(addr) => addr,
            None => self.collect_then_allocate(Self::next_free_page)?,
        };

        if !self.write_to_physical(physical_addr, data)? {
            return Ok(false);
        }
        self.l2p[logical_addr] = Some(physical_addr);
        self.check_mapping()?;
        debug!(
            "op={} wrote logical {} to physical {}",
            self.flash.operation_count(),
            logical_addr,
            physical_addr
        );
        Ok(true)
    }

    fn write_with_dynamic_wear_leveling(&mut self, logical_addr: Addr, data: &[u8]) -> Result<bool> {
        self.validate_logical(logical_addr)?;
        self.invalidate_current_mapping(logical_addr)?;

        let physical_addr = match self.wear_leveled_page() {
            Some(addr) => addr,
            None => self.collect_then_allocate(Self::wear_leveled_page)?,
        };

        if !self.write_to_physical(physical_addr, data)? {
            return Ok(false);
        }
        self.l2p[logical_addr] = Some(physical_addr);
        self.check_mapping()?;
        debug!(
            "op={} wear-leveled write of logical {} to physical {}",
            self.flash.operation_count(),
            logical_addr,
            physical_addr
        );
        Ok(true)
    }

    /// One GC pass, then one retry of the allocator. No further fallback:
    /// if the retry also comes up empty the device is full.
    fn collect_then_allocate(
        &mut self,
        allocate: fn(&mut Self) -> Option<Addr>,
    ) -> Result<Addr> {
        self.garbage_collect()?;
        allocate(self).ok_or(Error::OutOfSpace)
    }

    /// Decouple the previous mapping before a rewrite: if the logical page
    /// currently points at a programmed page, that page becomes invalid.
    fn invalidate_current_mapping(&mut self, logical_addr: Addr) -> Result<()> {
        if let Some(current) = self.l2p[logical_addr] {
            if self.is_page_programmed(current) {
                self.invalidate_physical(current)?;
            }
        }
        Ok(())
    }

    /// Program a physical page and maintain the free caches. The address has
    /// already been taken out of `free_pages` by the allocator; a declined
    /// write puts it back.
    fn write_to_physical(&mut self, physical_addr: Addr, data: &[u8]) -> Result<bool> {
        self.validate_physical(physical_addr)?;
        let (block_id, page_id) = self.split(physical_addr);

        if self.flash.write(block_id, page_id, data)? {
            self.free_pages.remove(&physical_addr);
            self.update_block_free_status(block_id);
            Ok(true)
        } else {
            self.free_pages.insert(physical_addr);
            self.free_blocks.insert(block_id);
            Ok(false)
        }
    }

    /// Lowest-address-first allocator. Clears any logical address still
    /// pointing at the handed-out page; callers never do this themselves.
    fn next_free_page(&mut self) -> Option<Addr> {
        let page = *self.free_pages.iter().next()?;
        self.free_pages.remove(&page);
        self.unmap_physical(page);
        Some(page)
    }

    /// Relocation variant of the allocator: never hands out a page inside
    /// the block currently being evacuated.
    fn next_free_page_outside(&mut self, block_id: BlockId) -> Option<Addr> {
        let start = self.join(block_id, 0);
        let end = start + self.cfg.pages_per_block;
        let page = self
            .free_pages
            .iter()
            .copied()
            .find(|&p| !(start..end).contains(&p))?;
        self.free_pages.remove(&page);
        self.unmap_physical(page);
        Some(page)
    }

    /// Dynamic-wear-leveling allocator: bounded-greedy pick of the first
    /// free page within `dynamic_wear_window` erase cycles of the least-worn
    /// free block.
    fn wear_leveled_page(&mut self) -> Option<Addr> {
        if self.free_pages.is_empty() || self.free_blocks.is_empty() {
            return None;
        }

        // Block erase counts are read live from the device; there is no
        // cached copy to fall out of sync.
        let min_wear = self
            .free_blocks
            .iter()
            .map(|&b| self.flash.block(b).erase_count)
            .min()?;
        let candidates: BTreeSet<BlockId> = self
            .free_blocks
            .iter()
            .copied()
            .filter(|&b| self.flash.block(b).erase_count <= min_wear + self.cfg.dynamic_wear_window)
            .collect();

        let page = self
            .free_pages
            .iter()
            .copied()
            .find(|&p| candidates.contains(&(p / self.cfg.pages_per_block)))?;
        self.free_pages.remove(&page);
        self.unmap_physical(page);
        Some(page)
    }

    /// Clear every mapping entry that points at a physical page.
    fn unmap_physical(&mut self, physical_addr: Addr) {
        for entry in self.l2p.iter_mut() {
            if *entry == Some(physical_addr) {
                trace!("unmapping stale entry to physical {}", physical_addr);
                *entry = None;
            }
        }
    }

    /// Reclaim every qualifying block, in block-index order. Returns whether
    /// any space was freed; the write path treats `Ok(false)` as exhaustion.
    pub fn garbage_collect(&mut self) -> Result<bool> {
        info!("garbage collecting...");
        let candidates = self.find_gc_candidates();
        if candidates.is_empty() {
            info!("no blocks qualified for garbage collection");
            return Ok(false);
        }

        let mut space_freed = false;
        for block_id in candidates {
            if self.erase_block(block_id)? {
                space_freed = true;
            }
        }
        info!("garbage collection freed space: {}", space_freed);
        Ok(space_freed)
    }

    /// A block qualifies when it is pure garbage (invalid pages, nothing
    /// programmed or erased) or when its invalid-to-reclaimable ratio
    /// crosses the configured threshold.
    pub fn find_gc_candidates(&self) -> Vec<BlockId> {
        let mut candidates = Vec::new();
        for block_id in 0..self.cfg.physical_blocks {
            let status = self.flash.block(block_id).status();
            let reclaimable = status.programmed_pages + status.erased_pages;

            if status.invalid_pages > 0 && reclaimable == 0 {
                trace!("block {} selected for GC (pure garbage)", block_id);
                candidates.push(block_id);
                continue;
            }

            if reclaimable > 0 {
                let ratio = status.invalid_pages as f64 / reclaimable as f64;
                if ratio > self.cfg.gc_threshold {
                    trace!("block {} selected for GC (ratio {:.2})", block_id, ratio);
                    candidates.push(block_id);
                }
            }
        }
        candidates
    }

    /// Erase a block through the FTL: relocate its programmed pages, prove
    /// no logical address still resolves into the block, erase physically,
    /// then fold the now-erased pages back into the free caches.
    ///
    /// `Ok(false)` means the physical erase failed because the block is
    /// exhausted; its pages are dead and stay out of the free caches.
    pub fn erase_block(&mut self, block_id: BlockId) -> Result<bool> {
        if block_id >= self.cfg.physical_blocks {
            return Err(Error::BlockOutOfRange {
                block: block_id,
                max: self.cfg.physical_blocks - 1,
            });
        }

        self.relocate_programmed_pages(block_id)?;

        let start = self.join(block_id, 0);
        let end = start + self.cfg.pages_per_block;
        if self
            .l2p
            .iter()
            .flatten()
            .any(|&physical| start <= physical && physical < end)
        {
            // Relocation must have detached every owner; anything left is a
            // latent bug in the engine, not a recoverable condition.
            return Err(Error::StaleMappings { block: block_id });
        }

        let erased = self.flash.erase_block(block_id)?;

        // Only pages that actually came back erased are allocatable; an
        // exhausted block leaves dead pages behind and those must fall out
        // of the free caches.
        let mut any_free = false;
        for page_id in 0..self.cfg.pages_per_block {
            let addr = self.join(block_id, page_id);
            if self.flash.block(block_id).page(page_id).state == PageState::Erased {
                self.free_pages.insert(addr);
                any_free = true;
            } else {
                self.free_pages.remove(&addr);
            }
        }
        if any_free {
            self.free_blocks.insert(block_id);
        } else {
            self.free_blocks.remove(&block_id);
        }

        self.check_mapping()?;
        if erased {
            debug!("erased block {}", block_id);
        }
        Ok(erased)
    }

    /// Move every programmed page out of a block, preserving its logical
    /// mapping. Mapped-but-unprogrammed entries are lazily unmapped here.
    /// Running out of free pages mid-relocation is fatal to the pass; GC
    /// assumes enough headroom exists to make forward progress.
    fn relocate_programmed_pages(&mut self, block_id: BlockId) -> Result<()> {
        let start = self.join(block_id, 0);
        let end = start + self.cfg.pages_per_block;

        let mapped_entries: Vec<(Addr, Addr)> = self
            .l2p
            .iter()
            .enumerate()
            .filter_map(|(logical, &physical)| match physical {
                Some(p) if start <= p && p < end => Some((logical, p)),
                _ => None,
            })
            .collect();

        let mut programmed = Vec::new();
        for (logical_addr, physical_addr) in mapped_entries {
            let (_, page_id) = self.split(physical_addr);
            match self.flash.read(block_id, page_id)? {
                Some(data) => programmed.push((logical_addr, data)),
                // Mapped but not programmed: stale entry, lazily unmapped.
                None => self.l2p[logical_addr] = None,
            }
        }

        for (logical_addr, data) in programmed {
            let new_physical = self
                .next_free_page_outside(block_id)
                .ok_or(Error::OutOfSpace)?;
            if !self.write_to_physical(new_physical, &data)? {
                return Err(Error::OutOfSpace);
            }
            let old_physical = self.l2p[logical_addr];
            self.l2p[logical_addr] = Some(new_physical);
            debug!(
                "relocated logical {} from physical {:?} to {}",
                logical_addr, old_physical, new_physical
            );
            self.check_mapping()?;
        }

        Ok(())
    }

    pub fn is_page_programmed(&self, physical_addr: Addr) -> bool {
        let (block_id, page_id) = self.split(physical_addr);
        self.flash.block(block_id).page(page_id).state == PageState::Programmed
    }

    /// Invalidate a physical page: detach its logical owner(s), flip the
    /// page state on the device, and refresh the free caches.
    pub fn invalidate_physical(&mut self, physical_addr: Addr) -> Result<()> {
        self.validate_physical(physical_addr)?;
        let (block_id, page_id) = self.split(physical_addr);

        self.unmap_physical(physical_addr);
        self.flash.invalidate_page(block_id, page_id)?;
        self.free_pages.remove(&physical_addr);
        self.update_block_free_status(block_id);
        Ok(())
    }

    /// Reverse lookup by scanning the mapping table. Linear, but the table
    /// is small at simulation scale.
    pub fn find_logical_address(&self, block_id: BlockId, page_id: PageId) -> Option<Addr> {
        let physical_addr = self.join(block_id, page_id);
        self.l2p
            .iter()
            .position(|&entry| entry == Some(physical_addr))
    }

    /// Record a mapping established outside the write path (wear leveling
    /// programs the device directly to keep intra-block page offsets).
    pub(crate) fn set_mapping(&mut self, logical_addr: Addr, physical_addr: Addr) {
        self.l2p[logical_addr] = Some(physical_addr);
    }

    /// Take a physical page out of the free caches after a direct device
    /// write that bypassed `write_to_physical`.
    pub(crate) fn note_physical_write(&mut self, physical_addr: Addr) {
        self.free_pages.remove(&physical_addr);
        let (block_id, _) = self.split(physical_addr);
        self.update_block_free_status(block_id);
    }

    pub(crate) fn clear_mappings_to(&mut self, physical_addr: Addr) {
        self.unmap_physical(physical_addr);
    }

    fn update_block_free_status(&mut self, block_id: BlockId) {
        let start = self.join(block_id, 0);
        let end = start + self.cfg.pages_per_block;
        if self.free_pages.range(start..end).next().is_some() {
            self.free_blocks.insert(block_id);
        } else {
            self.free_blocks.remove(&block_id);
        }
    }

    /// Mapping-table consistency check.
    ///
    /// Duplicate physical ownership is a fatal fault. A programmed page with
    /// no logical owner is repaired by invalidating it; that is the policy
    /// this engine commits to for orphaned pages.
    pub fn verify_mapping(&mut self) -> Result<()> {
        let mut owners: HashMap<Addr, Addr> = HashMap::new();
        for (logical_addr, &entry) in self.l2p.iter().enumerate() {
            let Some(physical_addr) = entry else { continue };
            if let Some(previous) = owners.insert(physical_addr, logical_addr) {
                info!(
                    "mapping conflict: logical {} and {} both map physical {}",
                    previous, logical_addr, physical_addr
                );
                return Err(Error::MappingConflict { addr: physical_addr });
            }
        }

        for block_id in 0..self.cfg.physical_blocks {
            for page_id in 0..self.cfg.pages_per_block {
                if self.flash.block(block_id).page(page_id).state != PageState::Programmed {
                    continue;
                }
                let physical_addr = self.join(block_id, page_id);
                if !owners.contains_key(&physical_addr) {
                    info!(
                        "programmed page {} has no logical owner, invalidating",
                        physical_addr
                    );
                    self.flash.invalidate_page(block_id, page_id)?;
                }
            }
        }

        Ok(())
    }

    /// Rebuild both free caches from page state. The caches are never the
    /// source of truth; call this whenever consistency is in doubt.
    pub fn reconcile_free_sets(&mut self) {
        self.free_pages.clear();
        self.free_blocks.clear();
        for block_id in 0..self.cfg.physical_blocks {
            for page_id in 0..self.cfg.pages_per_block {
                if self.flash.block(block_id).page(page_id).state == PageState::Erased {
                    self.free_pages.insert(self.join(block_id, page_id));
                    self.free_blocks.insert(block_id);
                }
            }
        }
    }

    /// The consistency check runs after every mapping mutation in debug
    /// builds only; release builds pay for it on demand.
    fn check_mapping(&mut self) -> Result<()> {
        if cfg!(debug_assertions) {
            self.verify_mapping()?;
        }
        Ok(())
    }
}
