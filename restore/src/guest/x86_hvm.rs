// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::cmp;

use byteorder::{ByteOrder, LittleEndian};
use hypervisor::{GrantTableSeed, PAGE_SIZE};
use vm_allocator::SuperpageAllocator;
use vm_memory::GuestAddress;
use vm_migration::{GuestType, PageType, PfnEntry, Record, RecordType};

use super::x86::{expect_min_length, X86Common};
use super::{GuestRestoreOps, RecordDisposition};
use crate::callbacks::MissingStaticData;
use crate::context::RestoreContext;
use crate::{RestoreError, Result};

pub const HVM_PARAM_STORE_PFN: u32 = 1;
pub const HVM_PARAM_STORE_EVTCHN: u32 = 2;
pub const HVM_PARAM_PAE_ENABLED: u32 = 4;
pub const HVM_PARAM_IOREQ_PFN: u32 = 5;
pub const HVM_PARAM_BUFIOREQ_PFN: u32 = 6;
pub const HVM_PARAM_CONSOLE_PFN: u32 = 17;
pub const HVM_PARAM_CONSOLE_EVTCHN: u32 = 18;

const HVM_PARAMS_HEADER_SIZE: u32 = 8;
const HVM_PARAMS_ENTRY_SIZE: u64 = 16;

// Regions which must never be covered by a superpage.
const VGA_HOLE_START: u64 = 0xa_0000;
const LAPIC_BASE_ADDRESS: u64 = 0xfee0_0000;
const ACPI_INFO_PHYSICAL_ADDRESS: u64 = 0xfc00_0000;

pub struct X86HvmOps {
    x86: X86Common,
    allocator: Option<SuperpageAllocator>,
    context: Option<Vec<u8>>,
}

impl X86HvmOps {
    pub fn new() -> Self {
        X86HvmOps {
            x86: X86Common::default(),
            allocator: None,
            context: None,
        }
    }

    fn handle_hvm_params(&mut self, ctx: &mut RestoreContext, record: &Record) -> Result<()> {
        expect_min_length(record, HVM_PARAMS_HEADER_SIZE)?;

        let count = LittleEndian::read_u32(&record.data[0..4]);
        let expected = HVM_PARAMS_HEADER_SIZE as u64 + count as u64 * HVM_PARAMS_ENTRY_SIZE;
        if record.length() as u64 != expected {
            return Err(RestoreError::RecordLength {
                rtype: record.rtype,
                length: record.length(),
                expected,
            });
        }

        if count == 0 {
            debug!("Skipping empty HVM_PARAMS record");
            return Ok(());
        }

        for entry in record.data[HVM_PARAMS_HEADER_SIZE as usize..].chunks_exact(16) {
            let raw_index = LittleEndian::read_u64(&entry[0..8]);
            let value = LittleEndian::read_u64(&entry[8..16]);
            let index =
                u32::try_from(raw_index).map_err(|_| RestoreError::HvmParamIndex(raw_index))?;

            match index {
                HVM_PARAM_CONSOLE_PFN => {
                    ctx.console.gfn = value;
                    clear_special_page(ctx, index, value);
                }
                HVM_PARAM_STORE_PFN => {
                    ctx.store.gfn = value;
                    clear_special_page(ctx, index, value);
                }
                HVM_PARAM_IOREQ_PFN | HVM_PARAM_BUFIOREQ_PFN => {
                    clear_special_page(ctx, index, value);
                }
                // Obsolete, only ever fed the CPUID policy.
                HVM_PARAM_PAE_ENABLED => continue,
                _ => {}
            }

            ctx.hv.set_hvm_param(ctx.domid, index, value)?;
        }

        Ok(())
    }
}

// Best effort, a page that cannot be cleared keeps its stale contents.
fn clear_special_page(ctx: &RestoreContext, index: u32, pfn: u64) {
    if let Err(e) = ctx.hv.clear_domain_page(ctx.domid, pfn) {
        warn!("Failed to clear pfn {:#x} of HVM param {}: {}", pfn, index, e);
    }
}

impl Default for X86HvmOps {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestRestoreOps for X86HvmOps {
    fn pfn_is_valid(&self, _ctx: &RestoreContext, _pfn: u64) -> bool {
        true
    }

    fn pfn_to_frame(&self, pfn: u64) -> Option<u64> {
        Some(pfn)
    }

    fn set_page_type(&mut self, _pfn: u64, _page_type: PageType) {}

    fn localise_page(
        &mut self,
        _ctx: &mut RestoreContext,
        _page_type: PageType,
        _page: &mut [u8],
    ) -> Result<()> {
        Ok(())
    }

    fn setup(&mut self, ctx: &mut RestoreContext) -> Result<()> {
        if ctx.guest_type != GuestType::X86Hvm {
            return Err(RestoreError::GuestTypeMismatch {
                stream: ctx.guest_type,
                domain: GuestType::X86Hvm,
            });
        }

        if ctx.page_size != PAGE_SIZE as u64 {
            return Err(RestoreError::PageSize(ctx.page_size));
        }

        let max_pfn = cmp::max(ctx.p2m_size, ctx.max_pages);
        let mut allocator =
            SuperpageAllocator::new(ctx.domid, max_pfn, ctx.tot_pages, ctx.max_pages)?;

        allocator.no_superpage(GuestAddress(VGA_HOLE_START))?;
        allocator.no_superpage(GuestAddress(LAPIC_BASE_ADDRESS))?;
        allocator.no_superpage(GuestAddress(ACPI_INFO_PHYSICAL_ADDRESS))?;

        self.allocator = Some(allocator);
        Ok(())
    }

    fn populate_pfns(&mut self, ctx: &mut RestoreContext, entries: &[PfnEntry]) -> Result<()> {
        let allocator = self.allocator.as_mut().ok_or(RestoreError::NotSetUp)?;
        let pfns: Vec<(u64, bool)> = entries
            .iter()
            .map(|e| (e.pfn, e.page_type.needs_population()))
            .collect();

        let res = allocator.populate_pfns(ctx.hv, &pfns);
        ctx.tot_pages = allocator.tot_pages();
        res.map_err(RestoreError::from)
    }

    fn process_record(
        &mut self,
        ctx: &mut RestoreContext,
        record: &Record,
    ) -> Result<RecordDisposition> {
        match record.rtype {
            RecordType::HVM_CONTEXT => {
                self.context = Some(record.data.clone());
                Ok(RecordDisposition::Processed)
            }
            RecordType::HVM_PARAMS => {
                self.handle_hvm_params(ctx, record)?;
                Ok(RecordDisposition::Processed)
            }
            _ => self.x86.process_record(ctx, record),
        }
    }

    fn static_data_complete(&mut self, ctx: &mut RestoreContext) -> Result<MissingStaticData> {
        self.x86.static_data_complete(ctx)
    }

    fn stream_complete(&mut self, ctx: &mut RestoreContext) -> Result<()> {
        ctx.hv
            .set_hvm_param(ctx.domid, HVM_PARAM_STORE_EVTCHN, ctx.store.evtchn as u64)?;
        ctx.hv
            .set_hvm_param(ctx.domid, HVM_PARAM_CONSOLE_EVTCHN, ctx.console.evtchn as u64)?;

        match &self.context {
            Some(blob) => ctx.hv.set_hvm_context(ctx.domid, blob)?,
            None => warn!("No HVM context in stream, devices keep their reset state"),
        }

        ctx.hv.seed_grant_table(
            ctx.domid,
            &GrantTableSeed {
                console_gfn: ctx.console.gfn,
                store_gfn: ctx.store.gfn,
                console_domid: ctx.console.domid,
                store_domid: ctx.store.domid,
            },
        )?;

        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut RestoreContext) {
        self.allocator = None;
        self.context = None;
        self.x86.cleanup();
    }
}
