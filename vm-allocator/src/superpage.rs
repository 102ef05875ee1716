// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use hypervisor::{DomainId, Hypervisor, HypervisorError, PAGE_SHIFT};
use thiserror::Error;
use vm_memory::GuestAddress;

use crate::bitmap::{Bitmap, BitmapError};

pub const SUPERPAGE_2MB_SHIFT: u32 = 9;
pub const SUPERPAGE_2MB_NR_PFNS: u64 = 1 << SUPERPAGE_2MB_SHIFT;
pub const SUPERPAGE_1GB_SHIFT: u32 = 18;
pub const SUPERPAGE_1GB_NR_PFNS: u64 = 1 << SUPERPAGE_1GB_SHIFT;

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Unable to allocate memory for pfn bitmaps")]
    Bitmap(#[source] BitmapError),

    #[error("No room to allocate pfn {pfn:#x}: {tot_pages} of {max_pages} pages in use")]
    OutOfQuota {
        pfn: u64,
        tot_pages: u64,
        max_pages: u64,
    },

    #[error("Failed to populate pfn {pfn:#x}")]
    Populate {
        pfn: u64,
        #[source]
        source: HypervisorError,
    },

    #[error("Hypervisor declined to populate pfn {0:#x}")]
    NoMemory(u64),

    #[error("Failed to release pfn {pfn:#x}")]
    Release {
        pfn: u64,
        #[source]
        source: HypervisorError,
    },
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

/// An extent successfully populated for a pfn.
struct Extent {
    base_pfn: u64,
    count: u64,
}

/// Backs the pfns of an HVM guest with memory, preferring 1 GiB then 2 MiB
/// extents, and hands memory back when the stream shows it is not used.
///
/// Pfns are expected in increasing order within one pass over guest memory.
/// A pass restarting is only detected by a batch starting below the
/// previous one, so "first pass" is a heuristic. Gaps seen during the first
/// pass are reclaimed in full; later passes only reclaim within the 2 MiB
/// region of the pfn being populated.
#[derive(Debug)]
pub struct SuperpageAllocator {
    domid: DomainId,
    attempted_1g: Bitmap,
    attempted_2m: Bitmap,
    allocated_pfns: Bitmap,
    populated_pfns: Bitmap,
    prev_populated_pfn: u64,
    iteration: u64,
    iteration_tracker_pfn: u64,
    tot_pages: u64,
    max_pages: u64,
}

impl SuperpageAllocator {
    /// Create an allocator with bitmaps sized for `max_pfn`.
    pub fn new(domid: DomainId, max_pfn: u64, tot_pages: u64, max_pages: u64) -> Result<Self> {
        let mut allocator = SuperpageAllocator {
            domid,
            attempted_1g: Bitmap::new(),
            attempted_2m: Bitmap::new(),
            allocated_pfns: Bitmap::new(),
            populated_pfns: Bitmap::new(),
            prev_populated_pfn: 0,
            iteration: 0,
            iteration_tracker_pfn: 0,
            tot_pages,
            max_pages,
        };
        allocator.expand(max_pfn)?;
        Ok(allocator)
    }

    fn expand(&mut self, max_pfn: u64) -> Result<()> {
        self.populated_pfns
            .ensure(max_pfn)
            .and_then(|_| self.attempted_1g.ensure(max_pfn >> SUPERPAGE_1GB_SHIFT))
            .and_then(|_| self.attempted_2m.ensure(max_pfn >> SUPERPAGE_2MB_SHIFT))
            .and_then(|_| self.allocated_pfns.ensure(max_pfn))
            .map_err(AllocatorError::Bitmap)
    }

    /// Never use a superpage for the 1 GiB and 2 MiB regions containing `addr`.
    pub fn no_superpage(&mut self, addr: GuestAddress) -> Result<()> {
        let pfn = addr.0 >> PAGE_SHIFT;
        self.attempted_1g
            .set(pfn >> SUPERPAGE_1GB_SHIFT)
            .and_then(|_| self.attempted_2m.set(pfn >> SUPERPAGE_2MB_SHIFT))
            .map_err(AllocatorError::Bitmap)
    }

    pub fn tot_pages(&self) -> u64 {
        self.tot_pages
    }

    pub fn max_pages(&self) -> u64 {
        self.max_pages
    }

    /// Number of passes over guest memory observed so far, minus one.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn is_populated(&self, pfn: u64) -> bool {
        self.populated_pfns.test(pfn)
    }

    pub fn is_allocated(&self, pfn: u64) -> bool {
        self.allocated_pfns.test(pfn)
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated_pfns.count_ones()
    }

    /// Bring one batch of `(pfn, needs_backing)` pairs into effect.
    pub fn populate_pfns(
        &mut self,
        hv: &dyn Hypervisor,
        pfns: &[(u64, bool)],
    ) -> Result<()> {
        let (Some(&(min_pfn, _)), Some(max_pfn)) =
            (pfns.first(), pfns.iter().map(|&(pfn, _)| pfn).max())
        else {
            return Ok(());
        };
        debug!(
            "batch of {} pfns between {:#x} {:#x}",
            pfns.len(),
            min_pfn,
            max_pfn
        );

        self.expand(max_pfn)?;

        // A lower pfn than the previous batch started with means the sender
        // began a new pass over guest memory.
        if min_pfn < self.iteration_tracker_pfn {
            self.iteration += 1;
        }
        self.iteration_tracker_pfn = min_pfn;

        for &(pfn, to_populate) in pfns {
            let populated = self.populated_pfns.test(pfn);
            if to_populate && !populated {
                self.populate_page(hv, pfn)?;
            } else if !to_populate && populated {
                self.unpopulate_page(hv, pfn)?;
            }
        }

        Ok(())
    }

    fn populate_page(&mut self, hv: &dyn Hypervisor, pfn: u64) -> Result<()> {
        let gap_start = self.prev_populated_pfn + 1;
        let has_gap = gap_start < pfn;

        // Only the first pass walks every pfn, so only then does a gap
        // reliably mean the memory behind it is unused.
        if has_gap && self.iteration == 0 {
            self.punch_hole(hv, gap_start, pfn - 1)?;
        }

        self.allocate_pfn(hv, pfn)?;
        self.populated_pfns.set(pfn).map_err(AllocatorError::Bitmap)?;

        // Later passes only carry dirty pages. Trim what a fresh extent left
        // unused below this pfn, without looking past its 2 MiB region.
        if has_gap && self.iteration > 0 {
            let start = gap_start.max(pfn & !(SUPERPAGE_2MB_NR_PFNS - 1));
            if start < pfn {
                self.release_unpopulated(hv, start, pfn - 1)?;
            }
        }

        self.prev_populated_pfn = pfn;
        Ok(())
    }

    fn unpopulate_page(&mut self, hv: &dyn Hypervisor, pfn: u64) -> Result<()> {
        self.populated_pfns.clear(pfn);
        self.punch_hole(hv, pfn, pfn)
    }

    /// Release every allocated but unpopulated pfn in `gap_start..=gap_end`.
    ///
    /// An optimistic superpage may extend past `gap_end`; that part is left
    /// for a later, higher pfn to release.
    fn punch_hole(&mut self, hv: &dyn Hypervisor, gap_start: u64, gap_end: u64) -> Result<()> {
        for index in (gap_start >> SUPERPAGE_1GB_SHIFT)..=(gap_end >> SUPERPAGE_1GB_SHIFT) {
            self.attempted_1g.set(index).map_err(AllocatorError::Bitmap)?;
        }
        for index in (gap_start >> SUPERPAGE_2MB_SHIFT)..=(gap_end >> SUPERPAGE_2MB_SHIFT) {
            self.attempted_2m.set(index).map_err(AllocatorError::Bitmap)?;
        }

        self.release_unpopulated(hv, gap_start, gap_end)
    }

    fn release_unpopulated(&mut self, hv: &dyn Hypervisor, first: u64, last: u64) -> Result<()> {
        let stale: Vec<u64> = self
            .allocated_pfns
            .ones_in_range(first, last)
            .filter(|&pfn| !self.populated_pfns.test(pfn))
            .collect();

        for &pfn in &stale {
            hv.decrease_reservation(self.domid, 0, &[pfn])
                .map_err(|source| AllocatorError::Release { pfn, source })?;
            self.allocated_pfns.clear(pfn);
            self.tot_pages -= 1;
        }

        if !stale.is_empty() {
            debug!("freed {} between {:#x} {:#x}", stale.len(), first, last);
        }
        Ok(())
    }

    fn allocate_pfn(&mut self, hv: &dyn Hypervisor, pfn: u64) -> Result<()> {
        if self.allocated_pfns.test(pfn) {
            return Ok(());
        }

        let extent = match self.alloc_1g(hv, pfn)? {
            Some(extent) => extent,
            None => match self.alloc_2m(hv, pfn)? {
                Some(extent) => extent,
                None => self.alloc_4k(hv, pfn)?,
            },
        };

        self.allocated_pfns
            .set_range(extent.base_pfn, extent.count)
            .map_err(AllocatorError::Bitmap)?;
        self.tot_pages += extent.count;
        Ok(())
    }

    fn has_room(&self, count: u64) -> bool {
        self.tot_pages + count <= self.max_pages
    }

    /// One extent of `2^order` pages covering `pfn`. Failures only mean
    /// falling back to a smaller order.
    fn try_extent(&self, hv: &dyn Hypervisor, pfn: u64, order: u32, label: &str) -> Option<Extent> {
        let base_pfn = (pfn >> order) << order;
        let mut extent = [base_pfn];
        match hv.populate_physmap(self.domid, order, &mut extent) {
            Ok(0) => None,
            Ok(_) => {
                debug!("{} {:#x}", label, base_pfn);
                Some(Extent {
                    base_pfn,
                    count: 1 << order,
                })
            }
            Err(e) => {
                error!("populate_physmap failed: {}", e);
                None
            }
        }
    }

    fn alloc_1g(&mut self, hv: &dyn Hypervisor, pfn: u64) -> Result<Option<Extent>> {
        // Only one attempt per region to avoid overlapping allocations.
        let attempted = self
            .attempted_1g
            .test_and_set(pfn >> SUPERPAGE_1GB_SHIFT)
            .map_err(AllocatorError::Bitmap)?;
        if attempted || !self.has_room(SUPERPAGE_1GB_NR_PFNS) {
            return Ok(None);
        }

        let Some(extent) = self.try_extent(hv, pfn, SUPERPAGE_1GB_SHIFT, "1G") else {
            return Ok(None);
        };
        let first_2m = extent.base_pfn >> SUPERPAGE_2MB_SHIFT;
        self.attempted_2m
            .set_range(first_2m, SUPERPAGE_1GB_NR_PFNS / SUPERPAGE_2MB_NR_PFNS)
            .map_err(AllocatorError::Bitmap)?;
        Ok(Some(extent))
    }

    fn alloc_2m(&mut self, hv: &dyn Hypervisor, pfn: u64) -> Result<Option<Extent>> {
        let attempted = self
            .attempted_2m
            .test_and_set(pfn >> SUPERPAGE_2MB_SHIFT)
            .map_err(AllocatorError::Bitmap)?;
        if attempted || !self.has_room(SUPERPAGE_2MB_NR_PFNS) {
            return Ok(None);
        }

        Ok(self.try_extent(hv, pfn, SUPERPAGE_2MB_SHIFT, "2M"))
    }

    fn alloc_4k(&mut self, hv: &dyn Hypervisor, pfn: u64) -> Result<Extent> {
        if !self.has_room(1) {
            return Err(AllocatorError::OutOfQuota {
                pfn,
                tot_pages: self.tot_pages,
                max_pages: self.max_pages,
            });
        }

        let mut extent = [pfn];
        let done = hv
            .populate_physmap(self.domid, 0, &mut extent)
            .map_err(|source| AllocatorError::Populate { pfn, source })?;
        if done == 0 {
            return Err(AllocatorError::NoMemory(pfn));
        }

        debug!("4K {:#x}", pfn);
        Ok(Extent {
            base_pfn: pfn,
            count: 1,
        })
    }
}
