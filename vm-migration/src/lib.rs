// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

//! Reader side of the domain save/restore stream format.
//!
//! A stream starts with an Image Header (big-endian), followed by a Domain
//! Header and a sequence of length-prefixed records, all little-endian.

#[macro_use]
extern crate log;

use thiserror::Error;

pub mod page_data;
pub mod protocol;

pub use page_data::{PageDataHeader, PageType, PfnEntry, MAX_BATCH_SIZE};
pub use protocol::{
    read_vectored_exact, DomainHeader, GuestType, ImageHeader, Record, RecordHeader, RecordType,
    StreamHeaders,
};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to read Image Header from stream")]
    ReadImageHeader(#[source] std::io::Error),

    #[error("Failed to read Domain Header from stream")]
    ReadDomainHeader(#[source] std::io::Error),

    #[error("Invalid marker: Got {0:#018x}")]
    InvalidMarker(u64),

    #[error("Invalid ID: Expected {expected:#010x}, Got {got:#010x}")]
    InvalidId { expected: u32, got: u32 },

    #[error("Invalid Version: Expected 2 <= ver <= 3, Got {0}")]
    InvalidVersion(u32),

    #[error("Unable to handle big endian streams")]
    BigEndian,

    #[error("Failed to read Record Header from stream")]
    ReadRecordHeader(#[source] std::io::Error),

    #[error("Failed to read {rtype} record body of {length} bytes")]
    ReadRecordBody {
        rtype: RecordType,
        length: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {0} record")]
    WriteRecord(RecordType, #[source] std::io::Error),

    #[error("PAGE_DATA record truncated: length {length}, min {min}")]
    PageDataTruncated { length: u32, min: usize },

    #[error("Unexpected pfn count {0} in PAGE_DATA record")]
    PageDataCount(u32),

    #[error("PAGE_DATA record (length {length}) too short to contain {count} pfns worth of information, expected at least {min}")]
    PageDataTooShort { length: u32, count: u32, min: u64 },

    #[error("Could not read PAGE_DATA {0}")]
    ReadPageData(&'static str, #[source] std::io::Error),

    #[error("PAGE_DATA record wrong size: length {length}, expected {expected}")]
    PageDataLength { length: u32, expected: u64 },

    #[error("Unknown type {raw:#x} for pfn {pfn:#x} (index {index})")]
    UnknownPageType { raw: u32, pfn: u64, index: usize },
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// Whether the error was caused by the stream itself going away, as
    /// opposed to the stream carrying malformed content.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            StreamError::ReadImageHeader(_)
                | StreamError::ReadDomainHeader(_)
                | StreamError::ReadRecordHeader(_)
                | StreamError::ReadRecordBody { .. }
                | StreamError::ReadPageData(..)
                | StreamError::WriteRecord(..)
        )
    }
}
