// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest type specific halves of the restore.

use vm_migration::{PageType, PfnEntry, Record};

use crate::callbacks::MissingStaticData;
use crate::context::RestoreContext;
use crate::Result;

mod x86;
pub mod x86_hvm;
pub mod x86_pv;

pub use x86_hvm::X86HvmOps;
pub use x86_pv::X86PvOps;

/// Whether a guest specific handler recognised a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordDisposition {
    Processed,
    NotProcessed,
}

pub trait GuestRestoreOps {
    /// Whether `pfn` may appear in the stream for this guest.
    fn pfn_is_valid(&self, ctx: &RestoreContext, pfn: u64) -> bool;

    /// Frame to map for `pfn`, or `None` if nothing backs it yet.
    fn pfn_to_frame(&self, pfn: u64) -> Option<u64>;

    fn set_page_type(&mut self, pfn: u64, page_type: PageType);

    /// Fix up a freshly received page so it makes sense in this domain.
    fn localise_page(
        &mut self,
        ctx: &mut RestoreContext,
        page_type: PageType,
        page: &mut [u8],
    ) -> Result<()>;

    /// Check the stream is compatible with the domain and prepare any
    /// per-guest state.
    fn setup(&mut self, ctx: &mut RestoreContext) -> Result<()>;

    /// Make sure every entry that needs memory has some.
    fn populate_pfns(&mut self, ctx: &mut RestoreContext, entries: &[PfnEntry]) -> Result<()>;

    fn process_record(
        &mut self,
        ctx: &mut RestoreContext,
        record: &Record,
    ) -> Result<RecordDisposition>;

    /// Apply the CPU policy gathered so far, reporting what never arrived.
    fn static_data_complete(&mut self, ctx: &mut RestoreContext) -> Result<MissingStaticData>;

    /// Load everything held back until the end of the stream.
    fn stream_complete(&mut self, ctx: &mut RestoreContext) -> Result<()>;

    fn cleanup(&mut self, ctx: &mut RestoreContext);
}

/// Pick the operations matching the domain being restored into.
pub fn guest_ops(hvm: bool) -> Box<dyn GuestRestoreOps> {
    if hvm {
        Box::new(X86HvmOps::new())
    } else {
        Box::new(X86PvOps::new())
    }
}
