// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Rebuilds a domain from a save/restore stream.
//!
//! A [`RestoreSession`] reads the stream headers, then applies records one
//! by one until an END record, a failover, or an error. Page contents go
//! straight into guest memory; everything guest type specific goes through
//! a [`guest::GuestRestoreOps`] selected once per session.

#[macro_use]
extern crate log;

use std::io;

use hypervisor::{DomainId, HypervisorError};
use thiserror::Error;
use vm_allocator::AllocatorError;
use vm_migration::{GuestType, PageType, RecordType, StreamError};

pub mod callbacks;
mod checkpoint;
pub mod config;
pub mod context;
pub mod guest;
mod page_data;
pub mod session;

pub use callbacks::{CallbackOutcome, CheckpointOutcome, MissingStaticData, RestoreCallbacks};
pub use config::{ConfigError, RestoreConfig, StreamType};
pub use context::{PortInfo, RestoreContext};
pub use session::{Completion, RestoreResults, RestoreSession};

/// Errors associated with restoring a domain.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Invalid restore configuration")]
    Config(#[source] ConfigError),

    #[error("Failed to get dominfo for dom{domid}")]
    DomainInfo {
        domid: DomainId,
        #[source]
        source: HypervisorError,
    },

    #[error("Invalid migration stream")]
    Stream(#[from] StreamError),

    #[error("Unable to restore {stream} domain into an {domain} domain")]
    GuestTypeMismatch { stream: GuestType, domain: GuestType },

    #[error("Invalid page size {0} for x86 domains")]
    PageSize(u64),

    #[error("Guest restore operations used before setup")]
    NotSetUp,

    #[error("pfn {pfn:#x} (index {index}) outside domain maximum")]
    PfnOutOfRange { pfn: u64, index: usize },

    #[error("Failed to populate pfns")]
    Allocator(#[from] AllocatorError),

    #[error("Failed to populate {count} pfns")]
    Populate {
        count: usize,
        #[source]
        source: HypervisorError,
    },

    #[error("Populated only {done} of {count} pfns")]
    PartialPopulate { count: usize, done: usize },

    #[error("pfn {0:#x} has no backing frame")]
    Unpopulated(u64),

    #[error("Unable to map {frames} frames for {pages} pages of data")]
    Map {
        frames: usize,
        pages: usize,
        #[source]
        source: HypervisorError,
    },

    #[error("Mapping pfn {pfn:#x} (frame {frame:#x}, type {page_type}) failed")]
    MapFrame {
        pfn: u64,
        frame: u64,
        page_type: PageType,
        #[source]
        source: io::Error,
    },

    #[error("Failed to localise pfn {pfn:#x} (type {page_type})")]
    Localise {
        pfn: u64,
        page_type: PageType,
        #[source]
        source: Box<RestoreError>,
    },

    #[error("Page table entry at level {level} refers to pfn {pfn:#x} outside domain maximum")]
    PteOutOfRange { pfn: u64, level: u8 },

    #[error("Verify pfn {pfn:#x} failed (type {page_type})")]
    VerifyMismatch { pfn: u64, page_type: PageType },

    #[error("Mandatory record {0} not handled")]
    UnhandledRecord(RecordType),

    #[error("{rtype} record wrong size: length {length}, expected {expected}")]
    RecordLength {
        rtype: RecordType,
        length: u32,
        expected: u64,
    },

    #[error("{rtype} record truncated: length {length}, min {min}")]
    RecordTruncated {
        rtype: RecordType,
        length: u32,
        min: u32,
    },

    #[error("{rtype} record size {length} should be a non-zero multiple of {unit}")]
    RecordAlignment {
        rtype: RecordType,
        length: u32,
        unit: u32,
    },

    #[error("Duplicate {0} record")]
    DuplicateRecord(RecordType),

    #[error("{0} record not seen")]
    MissingRecord(RecordType),

    #[error("Invalid HVM param index {0:#x}")]
    HvmParamIndex(u64),

    #[error("Invalid guest width {width} with {levels} page table levels")]
    PvInfo { width: u8, levels: u8 },

    #[error("Invalid p2m range {start:#x}..={end:#x}")]
    P2mRange { start: u64, end: u64 },

    #[error("Found checkpoint in non-checkpointed stream")]
    UnexpectedCheckpoint,

    #[error("Checkpoint failover without a consistent state to resume")]
    FailoverWithoutState,

    #[error("Orchestrator {0} callback failed")]
    Callback(&'static str),

    #[error("Failed to retrieve logdirty bitmap")]
    DirtyLog(#[source] HypervisorError),

    #[error("Hypervisor operation failed")]
    Hypervisor(#[from] HypervisorError),

    #[error("Failed to process record {index} ({rtype})")]
    Record {
        index: usize,
        rtype: RecordType,
        #[source]
        source: Box<RestoreError>,
    },
}

pub type Result<T> = std::result::Result<T, RestoreError>;

impl RestoreError {
    /// Innermost error, looking through per-record wrappers.
    pub fn root(&self) -> &RestoreError {
        match self {
            RestoreError::Record { source, .. } | RestoreError::Localise { source, .. } => {
                source.root()
            }
            e => e,
        }
    }
}
