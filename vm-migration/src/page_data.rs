// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! PAGE_DATA record layout.
//!
//! ```text
//! +------------------+------------------+
//! | count: u32       | reserved: u32    |
//! +------------------+------------------+
//! | pfn[0] | type[0] << 32  (u64)       |
//! | ...                                 |
//! | pfn[count - 1]                      |
//! +-------------------------------------+
//! | one page of data for every entry    |
//! | whose type carries stream data      |
//! +-------------------------------------+
//! ```

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Result, StreamError};

/// Largest number of pfns a single PAGE_DATA record may carry.
pub const MAX_BATCH_SIZE: usize = 1024;

pub const PAGE_DATA_PFN_MASK: u64 = 0x000f_ffff_ffff_ffff;
pub const PAGE_DATA_TYPE_MASK: u64 = 0xf000_0000_0000_0000;

/// Page types are stored in the top nibble of the 32-bit type word.
pub const PFINFO_LTAB_SHIFT: u32 = 28;
const PFINFO_LTAB_MASK: u32 = 0xf << PFINFO_LTAB_SHIFT;
const PFINFO_LPINTAB: u32 = 0x8 << PFINFO_LTAB_SHIFT;
const PFINFO_BROKEN: u32 = 0xd << PFINFO_LTAB_SHIFT;
const PFINFO_XALLOC: u32 = 0xe << PFINFO_LTAB_SHIFT;
const PFINFO_XTAB: u32 = 0xf << PFINFO_LTAB_SHIFT;

/// Classification of a guest page inside a PAGE_DATA batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    /// Ordinary data page.
    NoTable,
    /// Page table page of the given level (1 to 4), possibly pinned.
    Table { level: u8, pinned: bool },
    /// Page known to be broken on the sender; no data follows.
    Broken,
    /// Page which must be allocated but carries no data.
    XAlloc,
    /// Invalid/absent page; no data, no backing memory.
    NotPresent,
}

impl PageType {
    /// Decode a type word. Only the closed set of known types is accepted.
    pub fn from_raw(raw: u32) -> Option<PageType> {
        if raw & !PFINFO_LTAB_MASK != 0 {
            return None;
        }

        match raw {
            0 => Some(PageType::NoTable),
            PFINFO_BROKEN => Some(PageType::Broken),
            PFINFO_XALLOC => Some(PageType::XAlloc),
            PFINFO_XTAB => Some(PageType::NotPresent),
            _ => {
                let pinned = raw & PFINFO_LPINTAB != 0;
                let level = ((raw & !PFINFO_LPINTAB) >> PFINFO_LTAB_SHIFT) as u8;
                if (1..=4).contains(&level) {
                    Some(PageType::Table { level, pinned })
                } else {
                    None
                }
            }
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            PageType::NoTable => 0,
            PageType::Table { level, pinned } => {
                let raw = (level as u32) << PFINFO_LTAB_SHIFT;
                if pinned {
                    raw | PFINFO_LPINTAB
                } else {
                    raw
                }
            }
            PageType::Broken => PFINFO_BROKEN,
            PageType::XAlloc => PFINFO_XALLOC,
            PageType::NotPresent => PFINFO_XTAB,
        }
    }

    /// Whether a page worth of data follows in the record for this type.
    pub fn has_stream_data(self) -> bool {
        matches!(self, PageType::NoTable | PageType::Table { .. })
    }

    /// Whether the page needs backing memory on the receiving side.
    pub fn needs_population(self) -> bool {
        !matches!(self, PageType::NotPresent | PageType::Broken)
    }

    pub fn table_level(self) -> Option<u8> {
        match self {
            PageType::Table { level, .. } => Some(level),
            _ => None,
        }
    }

    pub fn is_pinned(self) -> bool {
        matches!(self, PageType::Table { pinned: true, .. })
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.raw() >> PFINFO_LTAB_SHIFT)
    }
}

/// A decoded PAGE_DATA entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PfnEntry {
    pub pfn: u64,
    pub page_type: PageType,
}

impl PfnEntry {
    pub fn new(pfn: u64, page_type: PageType) -> Self {
        PfnEntry { pfn, page_type }
    }

    pub fn raw_pfn(raw: u64) -> u64 {
        raw & PAGE_DATA_PFN_MASK
    }

    pub fn raw_type(raw: u64) -> u32 {
        ((raw & PAGE_DATA_TYPE_MASK) >> 32) as u32
    }

    /// Split a packed entry. `index` is only used to report errors.
    pub fn decode(raw: u64, index: usize) -> Result<PfnEntry> {
        let pfn = Self::raw_pfn(raw);
        let raw_type = Self::raw_type(raw);
        let page_type = PageType::from_raw(raw_type).ok_or(StreamError::UnknownPageType {
            raw: raw_type,
            pfn,
            index,
        })?;

        Ok(PfnEntry { pfn, page_type })
    }

    pub fn encode(&self) -> u64 {
        (self.pfn & PAGE_DATA_PFN_MASK) | ((self.page_type.raw() as u64) << 32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDataHeader {
    pub count: u32,
}

impl PageDataHeader {
    pub const SIZE: usize = 8;

    pub fn read_from(fd: &mut dyn Read) -> Result<PageDataHeader> {
        let count = fd
            .read_u32::<LittleEndian>()
            .and_then(|count| fd.read_u32::<LittleEndian>().map(|_| count))
            .map_err(|e| StreamError::ReadPageData("header", e))?;

        Ok(PageDataHeader { count })
    }

    pub fn write_to(&self, fd: &mut dyn Write) -> io::Result<()> {
        fd.write_u32::<LittleEndian>(self.count)?;
        fd.write_u32::<LittleEndian>(0)
    }

    /// Check the header against the record length before trusting `count`.
    pub fn verify(&self, length: u32) -> Result<()> {
        if (length as usize) < Self::SIZE {
            return Err(StreamError::PageDataTruncated {
                length,
                min: Self::SIZE,
            });
        }

        if self.count == 0 || self.count as usize > MAX_BATCH_SIZE {
            return Err(StreamError::PageDataCount(self.count));
        }

        let min = Self::SIZE as u64 + self.pfns_size();
        if (length as u64) < min {
            return Err(StreamError::PageDataTooShort {
                length,
                count: self.count,
                min,
            });
        }

        Ok(())
    }

    fn pfns_size(&self) -> u64 {
        self.count as u64 * std::mem::size_of::<u64>() as u64
    }

    /// Read the packed pfn/type words following the header.
    pub fn read_pfns(&self, fd: &mut dyn Read, words: &mut Vec<u64>) -> Result<()> {
        words.resize(self.count as usize, 0);
        fd.read_u64_into::<LittleEndian>(words)
            .map_err(|e| StreamError::ReadPageData("pfns", e))
    }

    /// Total record length for this header with `data_pages` trailing pages.
    pub fn expected_length(&self, data_pages: u32, page_size: u64) -> u64 {
        Self::SIZE as u64 + self.pfns_size() + page_size * data_pages as u64
    }

    /// The declared record length must match the batch content exactly.
    pub fn check_length(&self, length: u32, data_pages: u32, page_size: u64) -> Result<()> {
        let expected = self.expected_length(data_pages, page_size);
        if length as u64 != expected {
            return Err(StreamError::PageDataLength { length, expected });
        }
        Ok(())
    }
}
