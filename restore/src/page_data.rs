// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::{self, IoSliceMut, Read};

use vm_migration::page_data::PageDataHeader;
use vm_migration::{read_vectored_exact, PfnEntry, StreamError, MAX_BATCH_SIZE};

use crate::context::RestoreContext;
use crate::guest::GuestRestoreOps;
use crate::{RestoreError, Result};

/// Scratch space reused by every PAGE_DATA record of a session.
pub(crate) struct BatchBuffers {
    raw: Vec<u64>,
    entries: Vec<PfnEntry>,
    /// Frames to map, one per entry carrying data.
    frames: Vec<u64>,
    /// Index into `entries` of each mapped frame.
    mapped: Vec<usize>,
    verify_buf: Option<Vec<u8>>,
}

impl BatchBuffers {
    pub fn new() -> Self {
        BatchBuffers {
            raw: Vec::with_capacity(MAX_BATCH_SIZE),
            entries: Vec::with_capacity(MAX_BATCH_SIZE),
            frames: Vec::with_capacity(MAX_BATCH_SIZE),
            mapped: Vec::with_capacity(MAX_BATCH_SIZE),
            verify_buf: None,
        }
    }

    /// Allocate the side buffer incoming pages land in while verifying.
    pub fn enable_verify(&mut self, page_size: u64) {
        if self.verify_buf.is_none() {
            self.verify_buf = Some(vec![0u8; MAX_BATCH_SIZE * page_size as usize]);
        }
    }

    fn clear(&mut self) {
        self.raw.clear();
        self.entries.clear();
        self.frames.clear();
        self.mapped.clear();
    }
}

/// Apply one PAGE_DATA record of `length` bytes whose body is read from `fd`.
pub(crate) fn handle_page_data(
    ctx: &mut RestoreContext,
    ops: &mut dyn GuestRestoreOps,
    bufs: &mut BatchBuffers,
    length: u32,
    fd: &mut dyn Read,
) -> Result<()> {
    bufs.clear();

    // Never read a header the record does not contain.
    if (length as usize) < PageDataHeader::SIZE {
        return Err(StreamError::PageDataTruncated {
            length,
            min: PageDataHeader::SIZE,
        }
        .into());
    }
    let hdr = PageDataHeader::read_from(fd)?;
    hdr.verify(length)?;
    hdr.read_pfns(fd, &mut bufs.raw)?;

    let mut data_pages = 0u32;
    for (index, &raw) in bufs.raw.iter().enumerate() {
        let pfn = PfnEntry::raw_pfn(raw);
        if !ops.pfn_is_valid(ctx, pfn) {
            return Err(RestoreError::PfnOutOfRange { pfn, index });
        }

        let entry = PfnEntry::decode(raw, index)?;
        if entry.page_type.has_stream_data() {
            data_pages += 1;
        }
        bufs.entries.push(entry);
    }

    hdr.check_length(length, data_pages, ctx.page_size)?;

    ops.populate_pfns(ctx, &bufs.entries)?;

    for (index, entry) in bufs.entries.iter().enumerate() {
        ops.set_page_type(entry.pfn, entry.page_type);
        if entry.page_type.has_stream_data() {
            let frame = ops
                .pfn_to_frame(entry.pfn)
                .ok_or(RestoreError::Unpopulated(entry.pfn))?;
            bufs.frames.push(frame);
            bufs.mapped.push(index);
        }
    }

    if bufs.frames.is_empty() {
        return Ok(());
    }

    let hv = ctx.hv;
    let mut mapping = hv
        .map_foreign_pages(ctx.domid, &bufs.frames)
        .map_err(|source| RestoreError::Map {
            frames: bufs.frames.len(),
            pages: data_pages as usize,
            source,
        })?;

    for (i, &err) in mapping.errors().iter().enumerate() {
        if err != 0 {
            let entry = bufs.entries[bufs.mapped[i]];
            return Err(RestoreError::MapFrame {
                pfn: entry.pfn,
                frame: bufs.frames[i],
                page_type: entry.page_type,
                source: io::Error::from_raw_os_error(err),
            });
        }
    }

    let page_size = ctx.page_size as usize;
    let len = bufs.frames.len() * page_size;
    let target: &mut [u8] = match (ctx.verify, bufs.verify_buf.as_mut()) {
        (true, Some(buf)) => &mut buf[..len],
        _ => &mut mapping.as_mut_slice()[..len],
    };

    {
        let mut iovs: Vec<IoSliceMut> = target
            .chunks_exact_mut(page_size)
            .map(IoSliceMut::new)
            .collect();
        read_vectored_exact(fd, &mut iovs)
            .map_err(|e| StreamError::ReadPageData("data", e))?;
    }

    for (i, page) in target.chunks_exact_mut(page_size).enumerate() {
        let entry = bufs.entries[bufs.mapped[i]];
        ops.localise_page(ctx, entry.page_type, page)
            .map_err(|e| RestoreError::Localise {
                pfn: entry.pfn,
                page_type: entry.page_type,
                source: Box::new(e),
            })?;
    }

    if ctx.verify {
        if let Some(buf) = bufs.verify_buf.as_ref() {
            let guest = mapping.as_slice();
            for (i, &index) in bufs.mapped.iter().enumerate() {
                let range = i * page_size..(i + 1) * page_size;
                if buf[range.clone()] == guest[range] {
                    continue;
                }
                let entry = bufs.entries[index];
                if ctx.strict_verify {
                    return Err(RestoreError::VerifyMismatch {
                        pfn: entry.pfn,
                        page_type: entry.page_type,
                    });
                }
                warn!(
                    "Verify pfn {:#x} failed (type {})",
                    entry.pfn, entry.page_type
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use test_infra::{page_data_body, page_filled, MockCall, MockHypervisor};
    use vm_migration::{GuestType, PageType};

    use super::*;
    use crate::context::test_context;
    use crate::guest::{X86HvmOps, X86PvOps};

    fn apply(
        ctx: &mut RestoreContext,
        ops: &mut dyn GuestRestoreOps,
        bufs: &mut BatchBuffers,
        body: &[u8],
    ) -> Result<()> {
        handle_page_data(ctx, ops, bufs, body.len() as u32, &mut &body[..])
    }

    fn hvm_ops(ctx: &mut RestoreContext) -> X86HvmOps {
        let mut ops = X86HvmOps::new();
        ops.setup(ctx).unwrap();
        ops
    }

    #[test]
    fn pages_land_in_guest_memory() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        let body = page_data_body(
            &[
                PfnEntry::new(0x10, PageType::NoTable),
                PfnEntry::new(0x11, PageType::XAlloc),
                PfnEntry::new(0x12, PageType::NoTable),
            ],
            &[page_filled(1), page_filled(2)],
        );
        apply(&mut ctx, &mut ops, &mut bufs, &body).unwrap();

        assert_eq!(hv.page(0x10), page_filled(1));
        assert_eq!(hv.page(0x12), page_filled(2));
        assert!(hv.is_backed(0x11));
        assert!(hv.calls().contains(&MockCall::MapForeignPages {
            frames: vec![0x10, 0x12]
        }));
        assert_eq!(hv.unmap_count(), 1);
    }

    #[test]
    fn batch_without_data_maps_nothing() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        let body = page_data_body(
            &[
                PfnEntry::new(0x10, PageType::XAlloc),
                PfnEntry::new(0x11, PageType::NotPresent),
            ],
            &[],
        );
        apply(&mut ctx, &mut ops, &mut bufs, &body).unwrap();
        assert_eq!(hv.unmap_count(), 0);
        assert!(hv.is_backed(0x10));
        assert!(!hv.is_backed(0x11));
    }

    #[test]
    fn length_must_cover_data_pages() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        // Two data entries, one page supplied.
        let body = page_data_body(
            &[
                PfnEntry::new(0x10, PageType::NoTable),
                PfnEntry::new(0x11, PageType::NoTable),
            ],
            &[page_filled(1)],
        );
        let err = apply(&mut ctx, &mut ops, &mut bufs, &body).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Stream(StreamError::PageDataLength {
                expected: 8216, ..
            })
        ));
        assert!(hv.populate_calls().is_empty());
    }

    #[test]
    fn short_header_is_not_read() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        let err = apply(&mut ctx, &mut ops, &mut bufs, &[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Stream(StreamError::PageDataTruncated { length: 4, .. })
        ));
    }

    #[test]
    fn pfn_is_checked_before_type() {
        let hv = MockHypervisor::new_pv(1, 1024, 16);
        let mut ctx = test_context(&hv, GuestType::X86Pv);
        ctx.p2m_size = 16;
        let mut ops = X86PvOps::new();
        ops.setup(&mut ctx).unwrap();
        let mut bufs = BatchBuffers::new();

        let mut body = Vec::new();
        PageDataHeader { count: 2 }.write_to(&mut body).unwrap();
        body.extend_from_slice(&3u64.to_le_bytes());
        body.extend_from_slice(&((5u64 << 60) | 20).to_le_bytes());
        let err = apply(&mut ctx, &mut ops, &mut bufs, &body).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::PfnOutOfRange { pfn: 20, index: 1 }
        ));

        let mut body = Vec::new();
        PageDataHeader { count: 1 }.write_to(&mut body).unwrap();
        body.extend_from_slice(&((5u64 << 60) | 4).to_le_bytes());
        let err = apply(&mut ctx, &mut ops, &mut bufs, &body).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Stream(StreamError::UnknownPageType { pfn: 4, .. })
        ));
    }

    #[test]
    fn failed_frame_is_reported_and_unmapped() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        hv.fail_mapping(0x12);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        let body = page_data_body(
            &[
                PfnEntry::new(0x10, PageType::NoTable),
                PfnEntry::new(0x12, PageType::NoTable),
            ],
            &[page_filled(1), page_filled(2)],
        );
        let err = apply(&mut ctx, &mut ops, &mut bufs, &body).unwrap_err();
        match err {
            RestoreError::MapFrame {
                pfn, frame, source, ..
            } => {
                assert_eq!((pfn, frame), (0x12, 0x12));
                // EFAULT
                assert_eq!(source.raw_os_error(), Some(14));
            }
            e => panic!("unexpected error {e:?}"),
        }
        assert_eq!(hv.unmap_count(), 1);
        assert_eq!(hv.page(0x10), vec![0u8; 4096]);
    }

    #[test]
    fn truncated_data_is_an_io_error() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        let body = page_data_body(
            &[PfnEntry::new(0x10, PageType::NoTable)],
            &[page_filled(1)],
        );
        let err = handle_page_data(
            &mut ctx,
            &mut ops,
            &mut bufs,
            body.len() as u32,
            &mut &body[..body.len() - 100],
        )
        .unwrap_err();
        match err {
            RestoreError::Stream(e) => assert!(e.is_io()),
            e => panic!("unexpected error {e:?}"),
        }
        assert_eq!(hv.unmap_count(), 1);
    }

    #[test]
    fn verify_compares_without_writing() {
        let hv = MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut ops = hvm_ops(&mut ctx);
        let mut bufs = BatchBuffers::new();

        let entries = [PfnEntry::new(0x10, PageType::NoTable)];
        apply(
            &mut ctx,
            &mut ops,
            &mut bufs,
            &page_data_body(&entries, &[page_filled(1)]),
        )
        .unwrap();

        ctx.verify = true;
        bufs.enable_verify(ctx.page_size);
        apply(
            &mut ctx,
            &mut ops,
            &mut bufs,
            &page_data_body(&entries, &[page_filled(1)]),
        )
        .unwrap();

        // A mismatch is only a warning by default.
        apply(
            &mut ctx,
            &mut ops,
            &mut bufs,
            &page_data_body(&entries, &[page_filled(9)]),
        )
        .unwrap();
        assert_eq!(hv.page(0x10), page_filled(1));

        ctx.strict_verify = true;
        let err = apply(
            &mut ctx,
            &mut ops,
            &mut bufs,
            &page_data_body(&entries, &[page_filled(9)]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RestoreError::VerifyMismatch { pfn: 0x10, .. }
        ));
    }
}
