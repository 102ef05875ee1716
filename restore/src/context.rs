// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use hypervisor::{DomainId, Hypervisor};
use vm_migration::GuestType;

use crate::config::StreamType;

/// An inter-domain channel the restored guest expects to find: the event
/// channel and backend domain come from the toolstack, the frame from the
/// stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub evtchn: u32,
    pub domid: DomainId,
    pub gfn: u64,
}

/// State shared by every stage of one restore session.
pub struct RestoreContext<'a> {
    pub hv: &'a dyn Hypervisor,
    pub domid: DomainId,
    pub stream_type: StreamType,

    /// From the stream headers.
    pub format_version: u32,
    pub guest_type: GuestType,
    pub page_size: u64,

    /// From the domain.
    pub p2m_size: u64,
    pub max_pages: u64,
    pub tot_pages: u64,
    pub shared_info_frame: u64,

    pub store: PortInfo,
    pub console: PortInfo,

    /// Compare incoming pages with guest memory instead of writing them.
    pub verify: bool,
    pub strict_verify: bool,
    pub seen_static_data_end: bool,
}

impl RestoreContext<'_> {
    pub fn is_hvm(&self) -> bool {
        self.guest_type == GuestType::X86Hvm
    }
}

#[cfg(test)]
pub(crate) fn test_context(hv: &dyn Hypervisor, guest_type: GuestType) -> RestoreContext<'_> {
    RestoreContext {
        hv,
        domid: 1,
        stream_type: StreamType::Plain,
        format_version: 3,
        guest_type,
        page_size: 4096,
        p2m_size: 0x10_0000,
        max_pages: 0x10_0000,
        tot_pages: 0,
        shared_info_frame: 0,
        store: PortInfo::default(),
        console: PortInfo::default(),
        verify: false,
        strict_verify: false,
        seen_static_data_end: false,
    }
}
