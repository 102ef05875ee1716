// Copyright © 2020, Microsoft Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Records shared by every x86 guest type.

use byteorder::{ByteOrder, LittleEndian};
use hypervisor::TscInfo;
use vm_migration::{Record, RecordType};

use super::RecordDisposition;
use crate::callbacks::MissingStaticData;
use crate::context::RestoreContext;
use crate::{RestoreError, Result};

const TSC_INFO_SIZE: u32 = 24;
const CPUID_LEAF_SIZE: u32 = 24;
const MSR_ENTRY_SIZE: u32 = 16;

pub(super) fn expect_length(record: &Record, expected: u32) -> Result<()> {
    if record.length() != expected {
        return Err(RestoreError::RecordLength {
            rtype: record.rtype,
            length: record.length(),
            expected: expected as u64,
        });
    }
    Ok(())
}

pub(super) fn expect_min_length(record: &Record, min: u32) -> Result<()> {
    if record.length() < min {
        return Err(RestoreError::RecordTruncated {
            rtype: record.rtype,
            length: record.length(),
            min,
        });
    }
    Ok(())
}

fn expect_multiple_of(record: &Record, unit: u32) -> Result<()> {
    if record.length() == 0 || record.length() % unit != 0 {
        return Err(RestoreError::RecordAlignment {
            rtype: record.rtype,
            length: record.length(),
            unit,
        });
    }
    Ok(())
}

/// CPU policy blobs held until static data is complete.
#[derive(Debug, Default)]
pub(super) struct X86Common {
    cpuid: Option<Vec<u8>>,
    msrs: Option<Vec<u8>>,
}

impl X86Common {
    pub fn process_record(
        &mut self,
        ctx: &mut RestoreContext,
        record: &Record,
    ) -> Result<RecordDisposition> {
        match record.rtype {
            RecordType::X86_TSC_INFO => handle_tsc_info(ctx, record)?,
            RecordType::X86_CPUID_POLICY => {
                expect_multiple_of(record, CPUID_LEAF_SIZE)?;
                self.cpuid = Some(record.data.clone());
            }
            RecordType::X86_MSR_POLICY => {
                expect_multiple_of(record, MSR_ENTRY_SIZE)?;
                self.msrs = Some(record.data.clone());
            }
            _ => return Ok(RecordDisposition::NotProcessed),
        }
        Ok(RecordDisposition::Processed)
    }

    pub fn static_data_complete(&mut self, ctx: &mut RestoreContext) -> Result<MissingStaticData> {
        let mut missing = MissingStaticData::empty();
        if self.cpuid.is_none() {
            missing |= MissingStaticData::CPUID;
        }
        if self.msrs.is_none() {
            missing |= MissingStaticData::MSR;
        }

        if missing != MissingStaticData::all() {
            let cpuid = self.cpuid.as_deref().unwrap_or_default();
            let msrs = self.msrs.as_deref().unwrap_or_default();
            ctx.hv.set_cpu_policy(ctx.domid, cpuid, msrs)?;
        }

        Ok(missing)
    }

    pub fn cleanup(&mut self) {
        self.cpuid = None;
        self.msrs = None;
    }
}

fn handle_tsc_info(ctx: &mut RestoreContext, record: &Record) -> Result<()> {
    expect_length(record, TSC_INFO_SIZE)?;

    let data = &record.data;
    let info = TscInfo {
        mode: LittleEndian::read_u32(&data[0..4]),
        khz: LittleEndian::read_u32(&data[4..8]),
        nsec: LittleEndian::read_u64(&data[8..16]),
        incarnation: LittleEndian::read_u32(&data[16..20]),
    };
    debug!(
        "TSC mode {}, {} kHz, incarnation {}",
        info.mode, info.khz, info.incarnation
    );

    ctx.hv.set_tsc_info(ctx.domid, &info)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;
    use test_infra::{MockCall, MockHypervisor};
    use vm_migration::GuestType;

    use super::*;
    use crate::context::test_context;

    fn tsc_record(extra: usize) -> Record {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(1).unwrap();
        data.write_u32::<LittleEndian>(2_000_000).unwrap();
        data.write_u64::<LittleEndian>(42).unwrap();
        data.write_u32::<LittleEndian>(3).unwrap();
        data.write_u32::<LittleEndian>(0).unwrap();
        data.resize(data.len() + extra, 0);
        Record::new(RecordType::X86_TSC_INFO, data)
    }

    #[test]
    fn tsc_info_is_applied() {
        let hv = MockHypervisor::new_hvm(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut x86 = X86Common::default();

        let disposition = x86.process_record(&mut ctx, &tsc_record(0)).unwrap();
        assert_eq!(disposition, RecordDisposition::Processed);
        assert_eq!(
            hv.calls(),
            vec![MockCall::SetTscInfo(TscInfo {
                mode: 1,
                khz: 2_000_000,
                nsec: 42,
                incarnation: 3,
            })]
        );
    }

    #[test]
    fn tsc_info_length_is_exact() {
        let hv = MockHypervisor::new_hvm(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut x86 = X86Common::default();

        let err = x86.process_record(&mut ctx, &tsc_record(8)).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::RecordLength {
                length: 32,
                expected: 24,
                ..
            }
        ));
        assert!(hv.calls().is_empty());
    }

    #[test]
    fn policy_lengths() {
        let hv = MockHypervisor::new_hvm(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut x86 = X86Common::default();

        for (rtype, bad) in [
            (RecordType::X86_CPUID_POLICY, 25),
            (RecordType::X86_MSR_POLICY, 0),
        ] {
            let err = x86
                .process_record(&mut ctx, &Record::new(rtype, vec![0; bad]))
                .unwrap_err();
            assert!(matches!(err, RestoreError::RecordAlignment { .. }));
        }
    }

    #[test]
    fn static_data_reports_missing_policies() {
        let hv = MockHypervisor::new_hvm(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut x86 = X86Common::default();

        assert_eq!(
            x86.static_data_complete(&mut ctx).unwrap(),
            MissingStaticData::all()
        );
        assert!(hv.calls().is_empty());

        x86.process_record(
            &mut ctx,
            &Record::new(RecordType::X86_CPUID_POLICY, vec![0; 48]),
        )
        .unwrap();
        assert_eq!(
            x86.static_data_complete(&mut ctx).unwrap(),
            MissingStaticData::MSR
        );
        assert_eq!(
            hv.calls(),
            vec![MockCall::SetCpuPolicy {
                cpuid_len: 48,
                msrs_len: 0,
            }]
        );
    }

    #[test]
    fn other_records_are_not_processed() {
        let hv = MockHypervisor::new_hvm(1, 1024, 1024);
        let mut ctx = test_context(&hv, GuestType::X86Hvm);
        let mut x86 = X86Common::default();
        assert_eq!(
            x86.process_record(&mut ctx, &Record::new(RecordType::TOOLSTACK, vec![]))
                .unwrap(),
            RecordDisposition::NotProcessed
        );
    }
}
