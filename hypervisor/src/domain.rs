// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use serde::{Deserialize, Serialize};

pub type DomainId = u32;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Snapshot of the accounting the hypervisor keeps for a domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub domid: DomainId,
    pub hvm: bool,
    /// Page quota.
    pub max_pages: u64,
    /// Pages currently allocated to the domain.
    pub tot_pages: u64,
    /// Size of the guest physical address space, in pages.
    pub p2m_size: u64,
    pub shared_info_frame: u64,
}

/// Guest time-stamp counter parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TscInfo {
    pub mode: u32,
    pub khz: u32,
    pub nsec: u64,
    pub incarnation: u32,
}

/// Frames and backends used to prime the domain's grant table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTableSeed {
    pub console_gfn: u64,
    pub store_gfn: u64,
    pub console_domid: DomainId,
    pub store_domid: DomainId,
}

/// Opaque per-vCPU state blobs carried by a PV stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VcpuStateKind {
    Basic,
    Extended,
    Xsave,
    Msrs,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn domain_types_serde() {
        let info = DomainInfo {
            domid: 7,
            hvm: true,
            max_pages: 0x4_0000,
            tot_pages: 0x200,
            p2m_size: 0x10_0000,
            shared_info_frame: 0xfeff0,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"shared_info_frame\":1044464"));
        assert_eq!(serde_json::from_str::<DomainInfo>(&json).unwrap(), info);

        let tsc = TscInfo {
            mode: 1,
            khz: 2_400_000,
            nsec: 123_456_789,
            incarnation: 3,
        };
        let json = serde_json::to_string(&tsc).unwrap();
        assert_eq!(serde_json::from_str::<TscInfo>(&json).unwrap(), tsc);

        let seed = GrantTableSeed {
            console_gfn: 0xfeffd,
            store_gfn: 0xfeffc,
            console_domid: 0,
            store_domid: 1,
        };
        let json = serde_json::to_string(&seed).unwrap();
        assert_eq!(serde_json::from_str::<GrantTableSeed>(&json).unwrap(), seed);

        assert_eq!(
            serde_json::to_string(&VcpuStateKind::Xsave).unwrap(),
            "\"Xsave\""
        );
        assert_eq!(
            serde_json::from_str::<VcpuStateKind>("\"Msrs\"").unwrap(),
            VcpuStateKind::Msrs
        );
        assert!(serde_json::from_str::<VcpuStateKind>("\"Fpu\"").is_err());
    }

    #[test]
    fn vcpu_state_kind_orders_by_declaration() {
        let mut states = BTreeMap::new();
        states.insert((1, VcpuStateKind::Msrs), 4);
        states.insert((0, VcpuStateKind::Xsave), 3);
        states.insert((0, VcpuStateKind::Basic), 1);
        states.insert((0, VcpuStateKind::Extended), 2);

        assert_eq!(states.into_values().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }
}
