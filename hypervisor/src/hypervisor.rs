// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//
use crate::domain::{DomainId, DomainInfo, GrantTableSeed, TscInfo, VcpuStateKind};

use thiserror::Error;

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// Domain information query failure
    ///
    #[error("Failed to get domain info: {0}")]
    GetDomainInfo(#[source] anyhow::Error),
    ///
    /// Physical memory population failure
    ///
    #[error("Failed to populate physmap: {0}")]
    PopulatePhysmap(#[source] anyhow::Error),
    ///
    /// Reservation decrease failure
    ///
    #[error("Failed to decrease reservation: {0}")]
    DecreaseReservation(#[source] anyhow::Error),
    ///
    /// Foreign memory mapping failure
    ///
    #[error("Failed to map foreign pages: {0}")]
    MapForeignPages(#[source] anyhow::Error),
    ///
    /// Dirty log retrieval failure
    ///
    #[error("Failed to retrieve dirty log: {0}")]
    GetDirtyLog(#[source] anyhow::Error),
    ///
    /// Page clearing failure
    ///
    #[error("Failed to clear domain page: {0}")]
    ClearPage(#[source] anyhow::Error),
    ///
    /// HVM parameter failure
    ///
    #[error("Failed to set HVM param: {0}")]
    SetHvmParam(#[source] anyhow::Error),
    ///
    /// HVM context failure
    ///
    #[error("Failed to set HVM context: {0}")]
    SetHvmContext(#[source] anyhow::Error),
    ///
    /// Grant table seeding failure
    ///
    #[error("Failed to seed grant table: {0}")]
    SeedGrantTable(#[source] anyhow::Error),
    ///
    /// TSC configuration failure
    ///
    #[error("Failed to set TSC info: {0}")]
    SetTscInfo(#[source] anyhow::Error),
    ///
    /// CPU policy failure
    ///
    #[error("Failed to set CPU policy: {0}")]
    SetCpuPolicy(#[source] anyhow::Error),
    ///
    /// vCPU state failure
    ///
    #[error("Failed to set vCPU state: {0}")]
    SetVcpuState(#[source] anyhow::Error),
    ///
    /// Page table pinning failure
    ///
    #[error("Failed to pin page table: {0}")]
    PinPageTable(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

///
/// A batch of foreign guest frames mapped into the caller's address space.
///
/// Implementations unmap the frames when the value is dropped, so the
/// mapping lives exactly as long as the borrow of the hypervisor.
///
pub trait ForeignMapping {
    ///
    /// Per-frame mapping status, zero for mapped frames and an errno otherwise
    ///
    fn errors(&self) -> &[i32];
    ///
    /// The mapped frames, one page per requested frame, in request order
    ///
    fn as_slice(&self) -> &[u8];
    ///
    /// Mutable view of the mapped frames
    ///
    fn as_mut_slice(&mut self) -> &mut [u8];
}

///
/// Trait to represent a Hypervisor
///
/// This crate provides a hypervisor-agnostic interfaces
///
pub trait Hypervisor: Send + Sync {
    ///
    /// Query the page accounting and layout of a domain
    ///
    fn domain_info(&self, domid: DomainId) -> Result<DomainInfo>;
    ///
    /// Populate `extents.len()` extents of `2^order` pages each. Every entry
    /// holds the base pfn of an extent on input and the backing frame on
    /// output. Returns how many extents were populated.
    ///
    fn populate_physmap(&self, domid: DomainId, order: u32, extents: &mut [u64]) -> Result<usize>;
    ///
    /// Release the memory backing the given extents of `2^order` pages
    ///
    fn decrease_reservation(&self, domid: DomainId, order: u32, extents: &[u64]) -> Result<usize>;
    ///
    /// Map the given backing frames of a domain, readable and writable
    ///
    fn map_foreign_pages<'a>(
        &'a self,
        domid: DomainId,
        frames: &[u64],
    ) -> Result<Box<dyn ForeignMapping + 'a>>;
    ///
    /// Retrieve and clear the dirty page log, one bit per pfn
    ///
    fn logdirty_clean(&self, domid: DomainId, nr_pfns: u64) -> Result<Vec<u64>>;
    ///
    /// Zero a guest page
    ///
    fn clear_domain_page(&self, domid: DomainId, pfn: u64) -> Result<()>;
    ///
    /// Set a single HVM parameter
    ///
    fn set_hvm_param(&self, domid: DomainId, index: u32, value: u64) -> Result<()>;
    ///
    /// Load the HVM device context blob
    ///
    fn set_hvm_context(&self, domid: DomainId, blob: &[u8]) -> Result<()>;
    ///
    /// Prime the grant table with the console and store entries
    ///
    fn seed_grant_table(&self, domid: DomainId, seed: &GrantTableSeed) -> Result<()>;
    ///
    /// Configure the guest TSC
    ///
    fn set_tsc_info(&self, domid: DomainId, info: &TscInfo) -> Result<()>;
    ///
    /// Apply CPUID and MSR policies, either of which may be empty
    ///
    fn set_cpu_policy(&self, domid: DomainId, cpuid: &[u8], msrs: &[u8]) -> Result<()>;
    ///
    /// Load an opaque vCPU state blob
    ///
    fn set_vcpu_state(
        &self,
        domid: DomainId,
        vcpu: u32,
        kind: VcpuStateKind,
        blob: &[u8],
    ) -> Result<()>;
    ///
    /// Pin a top-level page table at the given level
    ///
    fn pin_page_table(&self, domid: DomainId, mfn: u64, level: u8) -> Result<()>;
}
