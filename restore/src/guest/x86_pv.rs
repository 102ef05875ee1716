// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Paravirtualised guests see real machine frames: their page tables and
//! their own p2m hold mfns, which change across a restore.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use byteorder::{ByteOrder, LittleEndian};
use hypervisor::{GrantTableSeed, VcpuStateKind, PAGE_SHIFT, PAGE_SIZE};
use vm_migration::{GuestType, PageType, PfnEntry, Record, RecordType};

use super::x86::{expect_length, expect_min_length, X86Common};
use super::{GuestRestoreOps, RecordDisposition};
use crate::callbacks::MissingStaticData;
use crate::context::RestoreContext;
use crate::{RestoreError, Result};

pub const INVALID_MFN: u64 = u64::MAX;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;
const PTE_SIZE: usize = 8;

const PV_INFO_SIZE: u32 = 8;
const P2M_FRAMES_HEADER_SIZE: u32 = 8;
const VCPU_HEADER_SIZE: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PvInfo {
    /// Size in bytes of a guest p2m entry.
    width: u8,
    levels: u8,
}

impl PvInfo {
    fn p2m_entries_per_frame(&self) -> u64 {
        PAGE_SIZE as u64 / self.width as u64
    }
}

/// The frames holding the guest's own pfn to mfn table.
#[derive(Debug)]
struct P2mFrames {
    start: u64,
    pfns: Vec<u64>,
}

pub struct X86PvOps {
    x86: X86Common,
    info: Option<PvInfo>,
    /// pfn to mfn, `INVALID_MFN` for holes.
    p2m: Vec<u64>,
    page_types: BTreeMap<u64, PageType>,
    p2m_frames: Option<P2mFrames>,
    vcpus: Vec<(u32, VcpuStateKind, Vec<u8>)>,
    shared_info: Option<Vec<u8>>,
}

impl X86PvOps {
    pub fn new() -> Self {
        X86PvOps {
            x86: X86Common::default(),
            info: None,
            p2m: Vec::new(),
            page_types: BTreeMap::new(),
            p2m_frames: None,
            vcpus: Vec::new(),
            shared_info: None,
        }
    }

    fn info(&self) -> Result<PvInfo> {
        self.info
            .ok_or(RestoreError::MissingRecord(RecordType::X86_PV_INFO))
    }

    fn mfn(&self, pfn: u64) -> Option<u64> {
        self.p2m
            .get(pfn as usize)
            .copied()
            .filter(|&mfn| mfn != INVALID_MFN)
    }

    fn set_mfn(&mut self, pfn: u64, mfn: u64) {
        let index = pfn as usize;
        if index >= self.p2m.len() {
            self.p2m.resize(index + 1, INVALID_MFN);
        }
        self.p2m[index] = mfn;
    }

    /// Back every pfn in `pfns` which has no frame yet, in a single call.
    fn populate_missing(
        &mut self,
        ctx: &mut RestoreContext,
        pfns: impl IntoIterator<Item = u64>,
    ) -> Result<()> {
        let missing: BTreeSet<u64> = pfns
            .into_iter()
            .filter(|&pfn| self.mfn(pfn).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let pfns: Vec<u64> = missing.into_iter().collect();
        let mut extents = pfns.clone();
        let count = extents.len();
        let done = ctx
            .hv
            .populate_physmap(ctx.domid, 0, &mut extents)
            .map_err(|source| RestoreError::Populate { count, source })?;
        if done != count {
            return Err(RestoreError::PartialPopulate { count, done });
        }

        for (pfn, mfn) in pfns.into_iter().zip(extents) {
            self.set_mfn(pfn, mfn);
        }
        ctx.tot_pages += count as u64;
        Ok(())
    }

    fn handle_pv_info(&mut self, record: &Record) -> Result<()> {
        expect_length(record, PV_INFO_SIZE)?;
        if self.info.is_some() {
            return Err(RestoreError::DuplicateRecord(record.rtype));
        }

        let width = record.data[0];
        let levels = record.data[1];
        match (width, levels) {
            (8, 4) | (4, 3) => {}
            _ => return Err(RestoreError::PvInfo { width, levels }),
        }

        debug!("{}-bit PV guest, {} page table levels", width * 8, levels);
        self.info = Some(PvInfo { width, levels });
        Ok(())
    }

    fn handle_p2m_frames(&mut self, ctx: &RestoreContext, record: &Record) -> Result<()> {
        let info = self.info()?;
        expect_min_length(record, P2M_FRAMES_HEADER_SIZE)?;

        let start = LittleEndian::read_u32(&record.data[0..4]) as u64;
        let end = LittleEndian::read_u32(&record.data[4..8]) as u64;
        if start > end || end >= ctx.p2m_size {
            return Err(RestoreError::P2mRange { start, end });
        }

        let fpp = info.p2m_entries_per_frame();
        let count = end / fpp - start / fpp + 1;
        let expected = P2M_FRAMES_HEADER_SIZE as u64 + count * 8;
        if record.length() as u64 != expected {
            return Err(RestoreError::RecordLength {
                rtype: record.rtype,
                length: record.length(),
                expected,
            });
        }

        let mut pfns = vec![0u64; count as usize];
        LittleEndian::read_u64_into(&record.data[P2M_FRAMES_HEADER_SIZE as usize..], &mut pfns);
        self.p2m_frames = Some(P2mFrames {
            start: start / fpp * fpp,
            pfns,
        });
        Ok(())
    }

    fn handle_vcpu(&mut self, record: &Record, kind: VcpuStateKind) -> Result<()> {
        expect_min_length(record, VCPU_HEADER_SIZE)?;

        let vcpu = LittleEndian::read_u32(&record.data[0..4]);
        let blob = record.data[VCPU_HEADER_SIZE as usize..].to_vec();
        match self
            .vcpus
            .iter_mut()
            .find(|(id, k, _)| *id == vcpu && *k == kind)
        {
            Some(entry) => entry.2 = blob,
            None => self.vcpus.push((vcpu, kind, blob)),
        }
        Ok(())
    }

    fn localise_table(
        &mut self,
        ctx: &mut RestoreContext,
        level: u8,
        page: &mut [u8],
    ) -> Result<()> {
        let info = self.info()?;
        if level > info.levels {
            return Err(RestoreError::PvInfo {
                width: info.width,
                levels: info.levels,
            });
        }

        let mut referenced = Vec::new();
        for pte in page.chunks_exact(PTE_SIZE) {
            let pte = LittleEndian::read_u64(pte);
            if pte & PTE_PRESENT == 0 {
                continue;
            }
            let pfn = (pte & PTE_FRAME_MASK) >> PAGE_SHIFT;
            if pfn >= ctx.p2m_size {
                return Err(RestoreError::PteOutOfRange { pfn, level });
            }
            referenced.push(pfn);
        }

        self.populate_missing(ctx, referenced)?;

        for pte in page.chunks_exact_mut(PTE_SIZE) {
            let entry = LittleEndian::read_u64(pte);
            if entry & PTE_PRESENT == 0 {
                continue;
            }
            let pfn = (entry & PTE_FRAME_MASK) >> PAGE_SHIFT;
            let mfn = self.mfn(pfn).ok_or(RestoreError::Unpopulated(pfn))?;
            LittleEndian::write_u64(pte, (entry & !PTE_FRAME_MASK) | (mfn << PAGE_SHIFT));
        }

        Ok(())
    }

    /// Rewrite the guest's p2m frames with the mfns of this domain.
    fn write_guest_p2m(&self, ctx: &RestoreContext, frames: &P2mFrames) -> Result<()> {
        let info = self.info()?;
        let mfns = frames
            .pfns
            .iter()
            .map(|&pfn| self.mfn(pfn).ok_or(RestoreError::Unpopulated(pfn)))
            .collect::<Result<Vec<u64>>>()?;

        let mut mapping = ctx
            .hv
            .map_foreign_pages(ctx.domid, &mfns)
            .map_err(|source| RestoreError::Map {
                frames: mfns.len(),
                pages: mfns.len(),
                source,
            })?;
        check_mapping(mapping.errors(), &frames.pfns, &mfns, PageType::NoTable)?;

        let width = info.width as usize;
        for (i, entry) in mapping.as_mut_slice().chunks_exact_mut(width).enumerate() {
            let mfn = self.mfn(frames.start + i as u64).unwrap_or(INVALID_MFN);
            if width == 8 {
                LittleEndian::write_u64(entry, mfn);
            } else {
                LittleEndian::write_u32(entry, mfn as u32);
            }
        }

        Ok(())
    }

    fn write_shared_info(&self, ctx: &RestoreContext, blob: &[u8]) -> Result<()> {
        let frame = ctx.shared_info_frame;
        let mut mapping = ctx
            .hv
            .map_foreign_pages(ctx.domid, &[frame])
            .map_err(|source| RestoreError::Map {
                frames: 1,
                pages: 1,
                source,
            })?;
        check_mapping(mapping.errors(), &[frame], &[frame], PageType::NoTable)?;
        mapping.as_mut_slice()[..blob.len()].copy_from_slice(blob);
        Ok(())
    }
}

fn check_mapping(errors: &[i32], pfns: &[u64], frames: &[u64], page_type: PageType) -> Result<()> {
    for (i, &err) in errors.iter().enumerate() {
        if err != 0 {
            return Err(RestoreError::MapFrame {
                pfn: pfns[i],
                frame: frames[i],
                page_type,
                source: io::Error::from_raw_os_error(err),
            });
        }
    }
    Ok(())
}

impl Default for X86PvOps {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestRestoreOps for X86PvOps {
    fn pfn_is_valid(&self, ctx: &RestoreContext, pfn: u64) -> bool {
        pfn < ctx.p2m_size
    }

    fn pfn_to_frame(&self, pfn: u64) -> Option<u64> {
        self.mfn(pfn)
    }

    fn set_page_type(&mut self, pfn: u64, page_type: PageType) {
        self.page_types.insert(pfn, page_type);
    }

    fn localise_page(
        &mut self,
        ctx: &mut RestoreContext,
        page_type: PageType,
        page: &mut [u8],
    ) -> Result<()> {
        match page_type.table_level() {
            Some(level) => self.localise_table(ctx, level, page),
            None => Ok(()),
        }
    }

    fn setup(&mut self, ctx: &mut RestoreContext) -> Result<()> {
        if ctx.guest_type != GuestType::X86Pv {
            return Err(RestoreError::GuestTypeMismatch {
                stream: ctx.guest_type,
                domain: GuestType::X86Pv,
            });
        }

        if ctx.page_size != PAGE_SIZE as u64 {
            return Err(RestoreError::PageSize(ctx.page_size));
        }

        Ok(())
    }

    fn populate_pfns(&mut self, ctx: &mut RestoreContext, entries: &[PfnEntry]) -> Result<()> {
        // Page data is only meaningful once the guest width is known.
        self.info()?;
        self.populate_missing(
            ctx,
            entries
                .iter()
                .filter(|e| e.page_type.needs_population())
                .map(|e| e.pfn),
        )
    }

    fn process_record(
        &mut self,
        ctx: &mut RestoreContext,
        record: &Record,
    ) -> Result<RecordDisposition> {
        match record.rtype {
            RecordType::X86_PV_INFO => self.handle_pv_info(record)?,
            RecordType::X86_PV_P2M_FRAMES => self.handle_p2m_frames(ctx, record)?,
            RecordType::X86_PV_VCPU_BASIC => self.handle_vcpu(record, VcpuStateKind::Basic)?,
            RecordType::X86_PV_VCPU_EXTENDED => {
                self.handle_vcpu(record, VcpuStateKind::Extended)?
            }
            RecordType::X86_PV_VCPU_XSAVE => self.handle_vcpu(record, VcpuStateKind::Xsave)?,
            RecordType::X86_PV_VCPU_MSRS => self.handle_vcpu(record, VcpuStateKind::Msrs)?,
            RecordType::SHARED_INFO => {
                expect_length(record, PAGE_SIZE as u32)?;
                self.shared_info = Some(record.data.clone());
            }
            _ => return self.x86.process_record(ctx, record),
        }
        Ok(RecordDisposition::Processed)
    }

    fn static_data_complete(&mut self, ctx: &mut RestoreContext) -> Result<MissingStaticData> {
        self.x86.static_data_complete(ctx)
    }

    fn stream_complete(&mut self, ctx: &mut RestoreContext) -> Result<()> {
        for (vcpu, kind, blob) in &self.vcpus {
            ctx.hv.set_vcpu_state(ctx.domid, *vcpu, *kind, blob)?;
        }

        for (&pfn, page_type) in self.page_types.iter().filter(|(_, t)| t.is_pinned()) {
            let mfn = self.mfn(pfn).ok_or(RestoreError::Unpopulated(pfn))?;
            if let Some(level) = page_type.table_level() {
                ctx.hv.pin_page_table(ctx.domid, mfn, level)?;
            }
        }

        if let Some(frames) = &self.p2m_frames {
            self.write_guest_p2m(ctx, frames)?;
        }

        if let Some(blob) = &self.shared_info {
            self.write_shared_info(ctx, blob)?;
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
        self.p2m = Vec::new();
        self.page_types.clear();
        self.p2m_frames = None;
        self.vcpus.clear();
        self.shared_info = None;
        self.x86.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use test_infra::{page_filled, MockCall, MockHypervisor, PV_MFN_OFFSET, SHARED_INFO_FRAME};

    use super::*;
    use crate::context::test_context;

    fn pv_info(width: u8, levels: u8) -> Record {
        let mut data = vec![0u8; 8];
        data[0] = width;
        data[1] = levels;
        Record::new(RecordType::X86_PV_INFO, data)
    }

    fn pte(pfn: u64, flags: u64) -> u64 {
        (pfn << PAGE_SHIFT) | flags
    }

    fn set_up(hv: &MockHypervisor) -> (RestoreContext<'_>, X86PvOps) {
        let mut ctx = test_context(hv, GuestType::X86Pv);
        ctx.p2m_size = 0x1000;
        let mut ops = X86PvOps::new();
        ops.setup(&mut ctx).unwrap();
        ops.process_record(&mut ctx, &pv_info(8, 4)).unwrap();
        (ctx, ops)
    }

    #[test]
    fn pv_info_validation() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Pv);
        let mut ops = X86PvOps::new();

        assert!(matches!(
            ops.process_record(&mut ctx, &pv_info(4, 4)),
            Err(RestoreError::PvInfo {
                width: 4,
                levels: 4
            })
        ));
        assert!(matches!(
            ops.process_record(&mut ctx, &Record::new(RecordType::X86_PV_INFO, vec![8, 4])),
            Err(RestoreError::RecordLength { .. })
        ));
        ops.process_record(&mut ctx, &pv_info(4, 3)).unwrap();
        assert!(matches!(
            ops.process_record(&mut ctx, &pv_info(8, 4)),
            Err(RestoreError::DuplicateRecord(RecordType::X86_PV_INFO))
        ));
    }

    #[test]
    fn setup_rejects_hvm_stream() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        assert!(matches!(
            X86PvOps::new().setup(&mut ctx),
            Err(RestoreError::GuestTypeMismatch {
                domain: GuestType::X86Pv,
                ..
            })
        ));
    }

    #[test]
    fn populate_in_one_call() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let (mut ctx, mut ops) = set_up(&hv);

        ops.populate_pfns(
            &mut ctx,
            &[
                PfnEntry::new(3, PageType::NoTable),
                PfnEntry::new(5, PageType::XAlloc),
                PfnEntry::new(7, PageType::NotPresent),
                PfnEntry::new(9, PageType::Broken),
            ],
        )
        .unwrap();
        assert_eq!(hv.populate_calls(), vec![(0, vec![3, 5])]);
        assert_eq!(ops.pfn_to_frame(3), Some(3 + PV_MFN_OFFSET));
        assert_eq!(ops.pfn_to_frame(7), None);
        assert_eq!(ctx.tot_pages, 2);

        // Already backed pfns are not populated again.
        ops.populate_pfns(&mut ctx, &[PfnEntry::new(3, PageType::NoTable)])
            .unwrap();
        assert_eq!(hv.populate_calls().len(), 1);
    }

    #[test]
    fn populate_needs_pv_info() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Pv);
        ctx.p2m_size = 0x1000;
        let mut ops = X86PvOps::new();
        ops.setup(&mut ctx).unwrap();

        assert!(matches!(
            ops.populate_pfns(&mut ctx, &[PfnEntry::new(3, PageType::NoTable)]),
            Err(RestoreError::MissingRecord(RecordType::X86_PV_INFO))
        ));
        assert!(hv.populate_calls().is_empty());
        assert_eq!(ctx.tot_pages, 0);
    }

    #[test]
    fn partial_populate_is_fatal() {
        let hv = MockHypervisor::new_pv(1, 1, 1024);
        let (mut ctx, mut ops) = set_up(&hv);
        let err = ops
            .populate_pfns(
                &mut ctx,
                &[
                    PfnEntry::new(1, PageType::NoTable),
                    PfnEntry::new(2, PageType::NoTable),
                ],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            RestoreError::PartialPopulate { count: 2, done: 1 }
        ));
    }

    #[test]
    fn localise_rewrites_present_entries() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let (mut ctx, mut ops) = set_up(&hv);
        ops.populate_pfns(&mut ctx, &[PfnEntry::new(3, PageType::NoTable)])
            .unwrap();

        let mut page = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u64(&mut page[0..8], pte(3, 0x63));
        LittleEndian::write_u64(&mut page[8..16], pte(9, 0x67));
        LittleEndian::write_u64(&mut page[16..24], pte(11, 0x62));

        let l1 = PageType::Table {
            level: 1,
            pinned: false,
        };
        ops.localise_page(&mut ctx, l1, &mut page).unwrap();

        assert_eq!(
            LittleEndian::read_u64(&page[0..8]),
            pte(3 + PV_MFN_OFFSET, 0x63)
        );
        assert_eq!(
            LittleEndian::read_u64(&page[8..16]),
            pte(9 + PV_MFN_OFFSET, 0x67)
        );
        // Not present: left alone, and not populated.
        assert_eq!(LittleEndian::read_u64(&page[16..24]), pte(11, 0x62));
        assert_eq!(hv.populate_calls(), vec![(0, vec![3]), (0, vec![9])]);
    }

    #[test]
    fn localise_rejects_out_of_range_entries() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let (mut ctx, mut ops) = set_up(&hv);

        let mut page = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u64(&mut page[0..8], pte(0x1000, PTE_PRESENT));
        let l2 = PageType::Table {
            level: 2,
            pinned: false,
        };
        assert!(matches!(
            ops.localise_page(&mut ctx, l2, &mut page),
            Err(RestoreError::PteOutOfRange {
                pfn: 0x1000,
                level: 2
            })
        ));

        // Data pages are never touched.
        ops.localise_page(&mut ctx, PageType::NoTable, &mut page)
            .unwrap();
    }

    #[test]
    fn localise_needs_pv_info() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Pv);
        let mut ops = X86PvOps::new();
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            ops.localise_page(
                &mut ctx,
                PageType::Table {
                    level: 1,
                    pinned: false
                },
                &mut page
            ),
            Err(RestoreError::MissingRecord(RecordType::X86_PV_INFO))
        ));
    }

    #[test]
    fn p2m_frames_length() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let (mut ctx, mut ops) = set_up(&hv);

        // 512 entries per frame: pfns 0..=600 need two frames.
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&600u32.to_le_bytes());
        data.extend_from_slice(&10u64.to_le_bytes());
        let record = Record::new(RecordType::X86_PV_P2M_FRAMES, data.clone());
        assert!(matches!(
            ops.process_record(&mut ctx, &record),
            Err(RestoreError::RecordLength {
                length: 16,
                expected: 24,
                ..
            })
        ));

        data.extend_from_slice(&11u64.to_le_bytes());
        let record = Record::new(RecordType::X86_PV_P2M_FRAMES, data);
        ops.process_record(&mut ctx, &record).unwrap();

        let mut reversed = Vec::new();
        reversed.extend_from_slice(&5u32.to_le_bytes());
        reversed.extend_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            ops.process_record(
                &mut ctx,
                &Record::new(RecordType::X86_PV_P2M_FRAMES, reversed)
            ),
            Err(RestoreError::P2mRange { start: 5, end: 4 })
        ));
    }

    #[test]
    fn stream_complete_applies_held_state() {
        let hv = MockHypervisor::new_pv(1, 1024, 1024);
        let (mut ctx, mut ops) = set_up(&hv);
        ctx.shared_info_frame = SHARED_INFO_FRAME;

        let l4 = PageType::Table {
            level: 4,
            pinned: true,
        };
        ops.populate_pfns(
            &mut ctx,
            &[
                PfnEntry::new(0, PageType::NoTable),
                PfnEntry::new(1, l4),
                PfnEntry::new(2, PageType::NoTable),
            ],
        )
        .unwrap();
        ops.set_page_type(1, l4);

        // The guest p2m lives in pfn 2 and covers pfns 0..=3.
        let mut frames = Vec::new();
        frames.extend_from_slice(&0u32.to_le_bytes());
        frames.extend_from_slice(&3u32.to_le_bytes());
        frames.extend_from_slice(&2u64.to_le_bytes());
        ops.process_record(
            &mut ctx,
            &Record::new(RecordType::X86_PV_P2M_FRAMES, frames),
        )
        .unwrap();

        let mut vcpu = vec![0u8; 8];
        vcpu.extend_from_slice(&[0xab; 32]);
        ops.process_record(&mut ctx, &Record::new(RecordType::X86_PV_VCPU_BASIC, vcpu))
            .unwrap();
        ops.process_record(
            &mut ctx,
            &Record::new(RecordType::SHARED_INFO, page_filled(0x5a)),
        )
        .unwrap();

        hv.clear_calls();
        ops.stream_complete(&mut ctx).unwrap();

        assert_eq!(
            hv.vcpu_state(0, VcpuStateKind::Basic),
            Some(vec![0xab; 32])
        );
        assert!(hv.calls().contains(&MockCall::PinPageTable {
            mfn: 1 + PV_MFN_OFFSET,
            level: 4
        }));

        let p2m = hv.page(2 + PV_MFN_OFFSET);
        for pfn in 0..3u64 {
            let at = pfn as usize * 8;
            assert_eq!(
                LittleEndian::read_u64(&p2m[at..at + 8]),
                pfn + PV_MFN_OFFSET
            );
        }
        assert_eq!(LittleEndian::read_u64(&p2m[24..32]), INVALID_MFN);

        assert_eq!(hv.page(SHARED_INFO_FRAME), page_filled(0x5a));
    }
}
