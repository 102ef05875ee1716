// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! # Stream Framing
//!
//! ```text
//! +---------------------------+
//! | Image Header (big-endian) |   24 bytes
//! +---------------------------+
//! | Domain Header             |   16 bytes
//! +---------------------------+
//! | Record                    |   type: u32, length: u32,
//! |   body, padded to 8 bytes |   body[length], padding
//! +---------------------------+
//! | ...                       |
//! +---------------------------+
//! | END Record                |
//! +---------------------------+
//! ```
//!
//! Records with bit 31 of their type set are optional: a receiver which does
//! not understand them may skip them. Unknown mandatory records abort the
//! restore.

use std::fmt;
use std::io::{self, IoSliceMut, Read, Write};

use vm_memory::ByteValued;

use crate::{Result, StreamError};

pub const IHDR_MARKER: u64 = 0xffff_ffff_ffff_ffff;
pub const IHDR_ID: u32 = 0x5845_4e46; // "XENF"
pub const IHDR_OPT_BIG_ENDIAN: u16 = 1 << 0;
pub const IHDR_VERSION_MIN: u32 = 2;
pub const IHDR_VERSION_MAX: u32 = 3;

/// Records are padded so that every record header is 8 byte aligned.
pub const REC_ALIGN: usize = 8;

#[repr(C)]
#[derive(Default, Copy, Clone)]
struct RawImageHeader {
    marker: u64,
    id: u32,
    version: u32,
    options: u16,
    _res1: u16,
    _res2: u32,
}

// SAFETY: RawImageHeader contains a series of integers with no implicit padding
unsafe impl ByteValued for RawImageHeader {}

#[repr(C)]
#[derive(Default, Copy, Clone)]
struct RawDomainHeader {
    guest_type: u32,
    page_shift: u16,
    _res1: u16,
    xen_major: u32,
    xen_minor: u32,
}

// SAFETY: RawDomainHeader contains a series of integers with no implicit padding
unsafe impl ByteValued for RawDomainHeader {}

#[repr(C)]
#[derive(Default, Copy, Clone)]
struct RawRecordHeader {
    rtype: u32,
    length: u32,
}

// SAFETY: RawRecordHeader contains a series of integers with no implicit padding
unsafe impl ByteValued for RawRecordHeader {}

/// The validated Image Header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: u32,
    pub options: u16,
}

impl ImageHeader {
    pub const SIZE: usize = std::mem::size_of::<RawImageHeader>();

    pub fn new(version: u32) -> Self {
        ImageHeader {
            version,
            options: 0,
        }
    }

    /// Read the Image Header, byte-swap it to host order and reject any
    /// stream this receiver cannot handle.
    pub fn read_from(fd: &mut dyn Read) -> Result<ImageHeader> {
        let mut raw = RawImageHeader::default();
        fd.read_exact(raw.as_mut_slice())
            .map_err(StreamError::ReadImageHeader)?;

        let marker = u64::from_be(raw.marker);
        let id = u32::from_be(raw.id);
        let version = u32::from_be(raw.version);
        let options = u16::from_be(raw.options);

        if marker != IHDR_MARKER {
            return Err(StreamError::InvalidMarker(marker));
        }

        if id != IHDR_ID {
            return Err(StreamError::InvalidId {
                expected: IHDR_ID,
                got: id,
            });
        }

        if !(IHDR_VERSION_MIN..=IHDR_VERSION_MAX).contains(&version) {
            return Err(StreamError::InvalidVersion(version));
        }

        if options & IHDR_OPT_BIG_ENDIAN != 0 {
            return Err(StreamError::BigEndian);
        }

        Ok(ImageHeader { version, options })
    }

    pub fn write_to(&self, fd: &mut dyn Write) -> io::Result<()> {
        let raw = RawImageHeader {
            marker: IHDR_MARKER.to_be(),
            id: IHDR_ID.to_be(),
            version: self.version.to_be(),
            options: self.options.to_be(),
            ..Default::default()
        };
        fd.write_all(raw.as_slice())
    }
}

/// Guest class announced by the Domain Header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestType {
    None,
    X86Pv,
    X86Hvm,
    Arm,
    Unknown(u32),
}

impl GuestType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => GuestType::None,
            1 => GuestType::X86Pv,
            2 => GuestType::X86Hvm,
            3 => GuestType::Arm,
            other => GuestType::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            GuestType::None => 0,
            GuestType::X86Pv => 1,
            GuestType::X86Hvm => 2,
            GuestType::Arm => 3,
            GuestType::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestType::None => write!(f, "None"),
            GuestType::X86Pv => write!(f, "x86 PV"),
            GuestType::X86Hvm => write!(f, "x86 HVM"),
            GuestType::Arm => write!(f, "ARM"),
            GuestType::Unknown(raw) => write!(f, "Unknown ({raw:#x})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainHeader {
    pub guest_type: GuestType,
    pub page_shift: u16,
    pub xen_major: u32,
    pub xen_minor: u32,
}

impl DomainHeader {
    pub const SIZE: usize = std::mem::size_of::<RawDomainHeader>();

    pub fn read_from(fd: &mut dyn Read) -> Result<DomainHeader> {
        let mut raw = RawDomainHeader::default();
        fd.read_exact(raw.as_mut_slice())
            .map_err(StreamError::ReadDomainHeader)?;

        Ok(DomainHeader {
            guest_type: GuestType::from_raw(u32::from_le(raw.guest_type)),
            page_shift: u16::from_le(raw.page_shift),
            xen_major: u32::from_le(raw.xen_major),
            xen_minor: u32::from_le(raw.xen_minor),
        })
    }

    pub fn write_to(&self, fd: &mut dyn Write) -> io::Result<()> {
        let raw = RawDomainHeader {
            guest_type: self.guest_type.raw().to_le(),
            page_shift: self.page_shift.to_le(),
            xen_major: self.xen_major.to_le(),
            xen_minor: self.xen_minor.to_le(),
            ..Default::default()
        };
        fd.write_all(raw.as_slice())
    }

    /// Guest page size in bytes, or 0 if the announced shift is nonsensical.
    pub fn page_size(&self) -> u64 {
        1u64.checked_shl(self.page_shift as u32).unwrap_or(0)
    }

    /// Streams converted from the legacy format carry no Xen version.
    pub fn is_legacy_conversion(&self) -> bool {
        self.xen_major == 0
    }
}

/// Both stream headers, read once at the start of a restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamHeaders {
    pub image: ImageHeader,
    pub domain: DomainHeader,
}

impl StreamHeaders {
    pub fn read_from(fd: &mut dyn Read) -> Result<StreamHeaders> {
        let image = ImageHeader::read_from(fd)?;
        let domain = DomainHeader::read_from(fd)?;

        if domain.is_legacy_conversion() {
            info!(
                "Found {} domain, converted from legacy stream format",
                domain.guest_type
            );
            debug!("  Legacy conversion script version {}", domain.xen_minor);
        } else {
            info!(
                "Found {} domain from Xen {}.{}",
                domain.guest_type, domain.xen_major, domain.xen_minor
            );
        }

        Ok(StreamHeaders { image, domain })
    }
}

/// A record type tag. Unknown values are representable so that optional
/// records can be skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordType(pub u32);

impl RecordType {
    pub const OPTIONAL: u32 = 1 << 31;

    pub const END: RecordType = RecordType(0x0000_0000);
    pub const PAGE_DATA: RecordType = RecordType(0x0000_0001);
    pub const X86_PV_INFO: RecordType = RecordType(0x0000_0002);
    pub const X86_PV_P2M_FRAMES: RecordType = RecordType(0x0000_0003);
    pub const X86_PV_VCPU_BASIC: RecordType = RecordType(0x0000_0004);
    pub const X86_PV_VCPU_EXTENDED: RecordType = RecordType(0x0000_0005);
    pub const X86_PV_VCPU_XSAVE: RecordType = RecordType(0x0000_0006);
    pub const SHARED_INFO: RecordType = RecordType(0x0000_0007);
    pub const X86_TSC_INFO: RecordType = RecordType(0x0000_0008);
    pub const HVM_CONTEXT: RecordType = RecordType(0x0000_0009);
    pub const HVM_PARAMS: RecordType = RecordType(0x0000_000a);
    pub const TOOLSTACK: RecordType = RecordType(0x0000_000b);
    pub const X86_PV_VCPU_MSRS: RecordType = RecordType(0x0000_000c);
    pub const VERIFY: RecordType = RecordType(0x0000_000d);
    pub const CHECKPOINT: RecordType = RecordType(0x0000_000e);
    pub const CHECKPOINT_DIRTY_PFN_LIST: RecordType = RecordType(0x0000_000f);
    pub const STATIC_DATA_END: RecordType = RecordType(0x0000_0010);
    pub const X86_CPUID_POLICY: RecordType = RecordType(0x0000_0011);
    pub const X86_MSR_POLICY: RecordType = RecordType(0x0000_0012);

    pub fn is_optional(self) -> bool {
        self.0 & Self::OPTIONAL != 0
    }

    pub fn name(self) -> &'static str {
        match RecordType(self.0 & !Self::OPTIONAL) {
            RecordType::END => "End",
            RecordType::PAGE_DATA => "Page data",
            RecordType::X86_PV_INFO => "x86 PV info",
            RecordType::X86_PV_P2M_FRAMES => "x86 PV P2M frames",
            RecordType::X86_PV_VCPU_BASIC => "x86 PV vcpu basic",
            RecordType::X86_PV_VCPU_EXTENDED => "x86 PV vcpu extended",
            RecordType::X86_PV_VCPU_XSAVE => "x86 PV vcpu xsave",
            RecordType::SHARED_INFO => "Shared info",
            RecordType::X86_TSC_INFO => "x86 TSC info",
            RecordType::HVM_CONTEXT => "HVM context",
            RecordType::HVM_PARAMS => "HVM params",
            RecordType::TOOLSTACK => "Toolstack",
            RecordType::X86_PV_VCPU_MSRS => "x86 PV vcpu msrs",
            RecordType::VERIFY => "Verify",
            RecordType::CHECKPOINT => "Checkpoint",
            RecordType::CHECKPOINT_DIRTY_PFN_LIST => "Checkpoint dirty pfn list",
            RecordType::STATIC_DATA_END => "Static data end",
            RecordType::X86_CPUID_POLICY => "x86 CPUID policy",
            RecordType::X86_MSR_POLICY => "x86 MSR policy",
            _ => "Reserved",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({})", self.0, self.name())
    }
}

/// Number of padding bytes following a record body of `length` bytes.
pub fn padding_len(length: u32) -> usize {
    let rem = length as usize % REC_ALIGN;
    if rem == 0 {
        0
    } else {
        REC_ALIGN - rem
    }
}

/// Read and discard the padding after a record body.
pub fn skip_padding(fd: &mut dyn Read, rtype: RecordType, length: u32) -> Result<()> {
    let mut pad = [0u8; REC_ALIGN];
    fd.read_exact(&mut pad[..padding_len(length)])
        .map_err(|source| StreamError::ReadRecordBody {
            rtype,
            length,
            source,
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub rtype: RecordType,
    pub length: u32,
}

impl RecordHeader {
    pub const SIZE: usize = std::mem::size_of::<RawRecordHeader>();

    pub fn new(rtype: RecordType, length: u32) -> Self {
        RecordHeader { rtype, length }
    }

    pub fn read_from(fd: &mut dyn Read) -> Result<RecordHeader> {
        let mut raw = RawRecordHeader::default();
        fd.read_exact(raw.as_mut_slice())
            .map_err(StreamError::ReadRecordHeader)?;

        Ok(RecordHeader {
            rtype: RecordType(u32::from_le(raw.rtype)),
            length: u32::from_le(raw.length),
        })
    }

    pub fn write_to(&self, fd: &mut dyn Write) -> io::Result<()> {
        let raw = RawRecordHeader {
            rtype: self.rtype.0.to_le(),
            length: self.length.to_le(),
        };
        fd.write_all(raw.as_slice())
    }
}

/// A fully read record: its type and a heap copy of its body, without
/// padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rtype: RecordType,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(rtype: RecordType, data: Vec<u8>) -> Self {
        Record { rtype, data }
    }

    pub fn length(&self) -> u32 {
        self.data.len() as u32
    }

    /// Read exactly `header.length` bytes of body, then the padding.
    ///
    /// The body buffer grows as data arrives, so a corrupt length field
    /// cannot make us allocate gigabytes up front.
    pub fn read_body(fd: &mut dyn Read, header: &RecordHeader) -> Result<Record> {
        let mut data = Vec::new();
        let read = fd
            .take(header.length as u64)
            .read_to_end(&mut data)
            .map_err(|source| StreamError::ReadRecordBody {
                rtype: header.rtype,
                length: header.length,
                source,
            })?;

        if read != header.length as usize {
            return Err(StreamError::ReadRecordBody {
                rtype: header.rtype,
                length: header.length,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short read: {read} of {} bytes", header.length),
                ),
            });
        }

        skip_padding(fd, header.rtype, header.length)?;

        Ok(Record {
            rtype: header.rtype,
            data,
        })
    }

    /// Write the record header, body and padding.
    pub fn write_to(&self, fd: &mut dyn Write) -> Result<()> {
        let pad = [0u8; REC_ALIGN];
        RecordHeader::new(self.rtype, self.length())
            .write_to(fd)
            .and_then(|_| fd.write_all(&self.data))
            .and_then(|_| fd.write_all(&pad[..padding_len(self.length())]))
            .map_err(|e| StreamError::WriteRecord(self.rtype, e))
    }
}

/// Fill every buffer in `bufs` from `fd`, retrying short vectored reads.
pub fn read_vectored_exact(fd: &mut dyn Read, mut bufs: &mut [IoSliceMut<'_>]) -> io::Result<()> {
    // Drop leading empty slices so a zero-sized request is not taken as EOF.
    IoSliceMut::advance_slices(&mut bufs, 0);
    while !bufs.is_empty() {
        match fd.read_vectored(bufs) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole vectored buffer",
                ))
            }
            Ok(n) => IoSliceMut::advance_slices(&mut bufs, n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
