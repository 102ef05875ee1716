// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! In-memory stand-ins for the hypervisor and the migration stream.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use hypervisor::{
    DomainId, DomainInfo, ForeignMapping, GrantTableSeed, Hypervisor, HypervisorError, TscInfo,
    VcpuStateKind, PAGE_SIZE,
};
use vm_migration::protocol::{DomainHeader, GuestType, ImageHeader, RecordHeader, RecordType};
use vm_migration::{PageDataHeader, PfnEntry};

/// Backing frames of a PV mock domain are offset from their pfns by this.
pub const PV_MFN_OFFSET: u64 = 0x10_0000;
pub const SHARED_INFO_FRAME: u64 = 0xfeff0;

/// A hypervisor call observed by [`MockHypervisor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    DomainInfo,
    PopulatePhysmap { order: u32, extents: Vec<u64> },
    DecreaseReservation { order: u32, extents: Vec<u64> },
    MapForeignPages { frames: Vec<u64> },
    Unmap { frames: Vec<u64> },
    LogdirtyClean { nr_pfns: u64 },
    ClearPage { pfn: u64 },
    SetHvmParam { index: u32, value: u64 },
    SetHvmContext { len: usize },
    SeedGrantTable(GrantTableSeed),
    SetTscInfo(TscInfo),
    SetCpuPolicy { cpuid_len: usize, msrs_len: usize },
    SetVcpuState { vcpu: u32, kind: VcpuStateKind },
    PinPageTable { mfn: u64, level: u8 },
}

#[derive(Default)]
struct MockState {
    info: DomainInfo,
    pv: bool,
    backed: BTreeSet<u64>,
    memory: BTreeMap<u64, Vec<u8>>,
    refused_orders: BTreeSet<u32>,
    failing_frames: BTreeSet<u64>,
    failing_clears: BTreeSet<u64>,
    dirty: BTreeSet<u64>,
    released: Vec<u64>,
    calls: Vec<MockCall>,
    hvm_params: BTreeMap<u32, u64>,
    hvm_context: Option<Vec<u8>>,
    vcpu_states: BTreeMap<(u32, VcpuStateKind), Vec<u8>>,
}

/// A hypervisor keeping domain memory in a map and recording every call.
///
/// HVM domains back pfn `n` with frame `n`; PV domains with frame
/// `n + PV_MFN_OFFSET`. Reservations are always released by frame.
pub struct MockHypervisor {
    state: Mutex<MockState>,
}

impl MockHypervisor {
    fn new(domid: DomainId, hvm: bool, max_pages: u64, p2m_size: u64) -> Self {
        MockHypervisor {
            state: Mutex::new(MockState {
                info: DomainInfo {
                    domid,
                    hvm,
                    max_pages,
                    tot_pages: 0,
                    p2m_size,
                    shared_info_frame: SHARED_INFO_FRAME,
                },
                pv: !hvm,
                // Xen owns the PV shared info page from domain creation.
                backed: if hvm {
                    BTreeSet::new()
                } else {
                    BTreeSet::from([SHARED_INFO_FRAME])
                },
                ..Default::default()
            }),
        }
    }

    pub fn new_hvm(domid: DomainId, max_pages: u64, p2m_size: u64) -> Self {
        Self::new(domid, true, max_pages, p2m_size)
    }

    pub fn new_pv(domid: DomainId, max_pages: u64, p2m_size: u64) -> Self {
        Self::new(domid, false, max_pages, p2m_size)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every populate request of `order` come back with nothing done.
    pub fn refuse_order(&self, order: u32) {
        self.lock().refused_orders.insert(order);
    }

    /// Make mapping `frame` fail with `EFAULT`.
    pub fn fail_mapping(&self, frame: u64) {
        self.lock().failing_frames.insert(frame);
    }

    /// Make clearing `pfn` fail, leaving its contents in place.
    pub fn fail_clear_page(&self, pfn: u64) {
        self.lock().failing_clears.insert(pfn);
    }

    pub fn mark_dirty(&self, pfns: &[u64]) {
        self.lock().dirty.extend(pfns.iter().copied());
    }

    pub fn write_page(&self, frame: u64, data: &[u8]) {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..data.len()].copy_from_slice(data);
        self.lock().memory.insert(frame, page);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Frames handed back through `decrease_reservation`, in call order.
    pub fn released(&self) -> Vec<u64> {
        self.lock().released.clone()
    }

    pub fn tot_pages(&self) -> u64 {
        self.lock().info.tot_pages
    }

    pub fn is_backed(&self, frame: u64) -> bool {
        self.lock().backed.contains(&frame)
    }

    /// Contents of a frame, zero filled when never written.
    pub fn page(&self, frame: u64) -> Vec<u8> {
        self.lock()
            .memory
            .get(&frame)
            .cloned()
            .unwrap_or_else(|| vec![0u8; PAGE_SIZE])
    }

    pub fn hvm_params(&self) -> BTreeMap<u32, u64> {
        self.lock().hvm_params.clone()
    }

    pub fn hvm_context(&self) -> Option<Vec<u8>> {
        self.lock().hvm_context.clone()
    }

    pub fn vcpu_state(&self, vcpu: u32, kind: VcpuStateKind) -> Option<Vec<u8>> {
        self.lock().vcpu_states.get(&(vcpu, kind)).cloned()
    }

    /// Number of mappings handed out and dropped again.
    pub fn unmap_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Unmap { .. }))
            .count()
    }

    pub fn populate_calls(&self) -> Vec<(u32, Vec<u64>)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::PopulatePhysmap { order, extents } => Some((*order, extents.clone())),
                _ => None,
            })
            .collect()
    }
}

struct MockMapping<'a> {
    hv: &'a MockHypervisor,
    frames: Vec<u64>,
    errors: Vec<i32>,
    data: Vec<u8>,
}

impl ForeignMapping for MockMapping<'_> {
    fn errors(&self) -> &[i32] {
        &self.errors
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for MockMapping<'_> {
    fn drop(&mut self) {
        let mut state = self.hv.lock();
        for (i, frame) in self.frames.iter().enumerate() {
            if self.errors[i] == 0 {
                let page = self.data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].to_vec();
                state.memory.insert(*frame, page);
            }
        }
        state.calls.push(MockCall::Unmap {
            frames: self.frames.clone(),
        });
    }
}

impl Hypervisor for MockHypervisor {
    fn domain_info(&self, _domid: DomainId) -> hypervisor::Result<DomainInfo> {
        let mut state = self.lock();
        state.calls.push(MockCall::DomainInfo);
        Ok(state.info)
    }

    fn populate_physmap(
        &self,
        _domid: DomainId,
        order: u32,
        extents: &mut [u64],
    ) -> hypervisor::Result<usize> {
        let mut state = self.lock();
        state.calls.push(MockCall::PopulatePhysmap {
            order,
            extents: extents.to_vec(),
        });
        if state.refused_orders.contains(&order) {
            return Ok(0);
        }

        let nr = 1u64 << order;
        let offset = if state.pv { PV_MFN_OFFSET } else { 0 };
        for (done, extent) in extents.iter_mut().enumerate() {
            if state.info.tot_pages + nr > state.info.max_pages {
                return Ok(done);
            }
            let base = *extent + offset;
            if (base..base + nr).any(|frame| state.backed.contains(&frame)) {
                return Err(HypervisorError::PopulatePhysmap(anyhow!(
                    "frame range {:#x}+{:#x} already populated",
                    base,
                    nr
                )));
            }
            state.backed.extend(base..base + nr);
            state.info.tot_pages += nr;
            *extent = base;
        }
        Ok(extents.len())
    }

    fn decrease_reservation(
        &self,
        _domid: DomainId,
        order: u32,
        extents: &[u64],
    ) -> hypervisor::Result<usize> {
        let mut state = self.lock();
        state.calls.push(MockCall::DecreaseReservation {
            order,
            extents: extents.to_vec(),
        });
        let nr = 1u64 << order;
        for extent in extents {
            let base = *extent;
            for frame in base..base + nr {
                if !state.backed.remove(&frame) {
                    return Err(HypervisorError::DecreaseReservation(anyhow!(
                        "frame {:#x} is not populated",
                        frame
                    )));
                }
                state.memory.remove(&frame);
                state.info.tot_pages -= 1;
            }
            state.released.push(*extent);
        }
        Ok(extents.len())
    }

    fn map_foreign_pages<'a>(
        &'a self,
        _domid: DomainId,
        frames: &[u64],
    ) -> hypervisor::Result<Box<dyn ForeignMapping + 'a>> {
        let mut state = self.lock();
        state.calls.push(MockCall::MapForeignPages {
            frames: frames.to_vec(),
        });

        let mut errors = Vec::with_capacity(frames.len());
        let mut data = Vec::with_capacity(frames.len() * PAGE_SIZE);
        for frame in frames {
            if state.failing_frames.contains(frame) {
                errors.push(libc::EFAULT);
            } else if !state.backed.contains(frame) {
                errors.push(libc::ENOENT);
            } else {
                errors.push(0);
            }
            match state.memory.get(frame) {
                Some(page) => data.extend_from_slice(page),
                None => data.resize(data.len() + PAGE_SIZE, 0),
            }
        }

        Ok(Box::new(MockMapping {
            hv: self,
            frames: frames.to_vec(),
            errors,
            data,
        }))
    }

    fn logdirty_clean(&self, _domid: DomainId, nr_pfns: u64) -> hypervisor::Result<Vec<u64>> {
        let mut state = self.lock();
        state.calls.push(MockCall::LogdirtyClean { nr_pfns });
        let mut words = vec![0u64; nr_pfns.div_ceil(64) as usize];
        for pfn in std::mem::take(&mut state.dirty) {
            if pfn < nr_pfns {
                words[(pfn / 64) as usize] |= 1 << (pfn % 64);
            }
        }
        Ok(words)
    }

    fn clear_domain_page(&self, _domid: DomainId, pfn: u64) -> hypervisor::Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::ClearPage { pfn });
        if state.failing_clears.contains(&pfn) {
            return Err(HypervisorError::ClearPage(anyhow!(
                "unable to map pfn {pfn:#x}"
            )));
        }
        state.memory.remove(&pfn);
        Ok(())
    }

    fn set_hvm_param(&self, _domid: DomainId, index: u32, value: u64) -> hypervisor::Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::SetHvmParam { index, value });
        state.hvm_params.insert(index, value);
        Ok(())
    }

    fn set_hvm_context(&self, _domid: DomainId, blob: &[u8]) -> hypervisor::Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::SetHvmContext { len: blob.len() });
        state.hvm_context = Some(blob.to_vec());
        Ok(())
    }

    fn seed_grant_table(&self, _domid: DomainId, seed: &GrantTableSeed) -> hypervisor::Result<()> {
        self.lock().calls.push(MockCall::SeedGrantTable(*seed));
        Ok(())
    }

    fn set_tsc_info(&self, _domid: DomainId, info: &TscInfo) -> hypervisor::Result<()> {
        self.lock().calls.push(MockCall::SetTscInfo(*info));
        Ok(())
    }

    fn set_cpu_policy(&self, _domid: DomainId, cpuid: &[u8], msrs: &[u8]) -> hypervisor::Result<()> {
        self.lock().calls.push(MockCall::SetCpuPolicy {
            cpuid_len: cpuid.len(),
            msrs_len: msrs.len(),
        });
        Ok(())
    }

    fn set_vcpu_state(
        &self,
        _domid: DomainId,
        vcpu: u32,
        kind: VcpuStateKind,
        blob: &[u8],
    ) -> hypervisor::Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::SetVcpuState { vcpu, kind });
        state.vcpu_states.insert((vcpu, kind), blob.to_vec());
        Ok(())
    }

    fn pin_page_table(&self, _domid: DomainId, mfn: u64, level: u8) -> hypervisor::Result<()> {
        self.lock().calls.push(MockCall::PinPageTable { mfn, level });
        Ok(())
    }
}

/// A page filled with `byte`.
pub fn page_filled(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

/// Body of a PAGE_DATA record. `pages` holds one page per data carrying
/// entry, in entry order.
pub fn page_data_body(entries: &[PfnEntry], pages: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    PageDataHeader {
        count: entries.len() as u32,
    }
    .write_to(&mut body)
    .unwrap();
    for entry in entries {
        body.extend_from_slice(&entry.encode().to_le_bytes());
    }
    for page in pages {
        body.extend_from_slice(page);
    }
    body
}

/// Body of an HVM_PARAMS record.
pub fn hvm_params_body(params: &[(u64, u64)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(params.len() as u32).to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    for (index, value) in params {
        body.extend_from_slice(&index.to_le_bytes());
        body.extend_from_slice(&value.to_le_bytes());
    }
    body
}

/// Assembles a migration stream in memory.
#[derive(Default)]
pub struct StreamBuilder {
    buf: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        StreamBuilder::default()
    }

    /// Image and Domain Headers of a stream from Xen 4.17.
    pub fn with_headers(version: u32, guest_type: GuestType) -> Self {
        StreamBuilder::new()
            .image_header(&ImageHeader::new(version))
            .domain_header(&DomainHeader {
                guest_type,
                page_shift: 12,
                xen_major: 4,
                xen_minor: 17,
            })
    }

    pub fn image_header(mut self, header: &ImageHeader) -> Self {
        header.write_to(&mut self.buf).unwrap();
        self
    }

    pub fn domain_header(mut self, header: &DomainHeader) -> Self {
        header.write_to(&mut self.buf).unwrap();
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// A record with its header, body and padding.
    pub fn record(self, rtype: RecordType, data: &[u8]) -> Self {
        self.record_with_length(rtype, data.len() as u32, data)
    }

    /// A record whose header claims `length` regardless of the body.
    pub fn record_with_length(mut self, rtype: RecordType, length: u32, data: &[u8]) -> Self {
        RecordHeader::new(rtype, length)
            .write_to(&mut self.buf)
            .unwrap();
        self.buf.extend_from_slice(data);
        let padding = (8 - data.len() % 8) % 8;
        self.buf.resize(self.buf.len() + padding, 0);
        self
    }

    pub fn page_data(self, entries: &[PfnEntry], pages: &[Vec<u8>]) -> Self {
        self.record(RecordType::PAGE_DATA, &page_data_body(entries, pages))
    }

    pub fn hvm_params(self, params: &[(u64, u64)]) -> Self {
        self.record(RecordType::HVM_PARAMS, &hvm_params_body(params))
    }

    pub fn static_data_end(self) -> Self {
        self.record(RecordType::STATIC_DATA_END, &[])
    }

    pub fn checkpoint(self) -> Self {
        self.record(RecordType::CHECKPOINT, &[])
    }

    pub fn end(self) -> Self {
        self.record(RecordType::END, &[])
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}
