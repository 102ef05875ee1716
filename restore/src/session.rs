// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::{Read, Write};

use hypervisor::Hypervisor;
use vm_migration::protocol::skip_padding;
use vm_migration::{GuestType, Record, RecordHeader, RecordType, StreamHeaders};

use crate::callbacks::{CallbackOutcome, RestoreCallbacks};
use crate::checkpoint::CheckpointBuffer;
use crate::config::{RestoreConfig, StreamType};
use crate::context::{PortInfo, RestoreContext};
use crate::guest::{guest_ops, GuestRestoreOps, RecordDisposition};
use crate::page_data::{handle_page_data, BatchBuffers};
use crate::{RestoreError, Result};

/// How a successful restore ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The stream ended with an END record.
    EndOfStream,
    /// The sender went away; the domain holds the last committed checkpoint.
    Failover,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreResults {
    pub store_gfn: u64,
    pub console_gfn: u64,
    pub completion: Completion,
}

/// What the record loop does after a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    End,
    Failover,
}

/// One restore of one stream into one domain.
pub struct RestoreSession<'a> {
    pub(crate) ctx: RestoreContext<'a>,
    pub(crate) ops: Box<dyn GuestRestoreOps>,
    stream: &'a mut dyn Read,
    pub(crate) callbacks: Option<&'a mut dyn RestoreCallbacks>,
    pub(crate) send_back: Option<&'a mut dyn Write>,
    bufs: BatchBuffers,
    pub(crate) checkpoint: CheckpointBuffer,
    record_index: usize,
}

impl<'a> RestoreSession<'a> {
    pub fn new(
        hv: &'a dyn Hypervisor,
        stream: &'a mut dyn Read,
        config: &RestoreConfig,
        callbacks: Option<&'a mut dyn RestoreCallbacks>,
        send_back: Option<&'a mut dyn Write>,
    ) -> Result<Self> {
        config
            .validate(callbacks.is_some(), send_back.is_some())
            .map_err(RestoreError::Config)?;

        let domid = config.domid;
        let info = hv
            .domain_info(domid)
            .map_err(|source| RestoreError::DomainInfo { domid, source })?;

        let ctx = RestoreContext {
            hv,
            domid,
            stream_type: config.stream_type,
            format_version: 0,
            guest_type: GuestType::None,
            page_size: 0,
            p2m_size: info.p2m_size,
            max_pages: info.max_pages,
            tot_pages: info.tot_pages,
            shared_info_frame: info.shared_info_frame,
            store: PortInfo {
                evtchn: config.store_evtchn,
                domid: config.store_domid,
                gfn: 0,
            },
            console: PortInfo {
                evtchn: config.console_evtchn,
                domid: config.console_domid,
                gfn: 0,
            },
            verify: false,
            strict_verify: config.strict_verify,
            seen_static_data_end: false,
        };

        Ok(RestoreSession {
            ctx,
            ops: guest_ops(info.hvm),
            stream,
            callbacks,
            send_back,
            bufs: BatchBuffers::new(),
            checkpoint: CheckpointBuffer::default(),
            record_index: 0,
        })
    }

    /// Apply the whole stream. Guest cleanup runs whatever the outcome.
    pub fn run(mut self) -> Result<RestoreResults> {
        info!(
            "Restoring dom{} from {} stream",
            self.ctx.domid, self.ctx.stream_type
        );

        let res = self.restore();
        self.ops.cleanup(&mut self.ctx);
        let completion = res?;

        Ok(RestoreResults {
            store_gfn: self.ctx.store.gfn,
            console_gfn: self.ctx.console.gfn,
            completion,
        })
    }

    fn restore(&mut self) -> Result<Completion> {
        let headers = StreamHeaders::read_from(&mut *self.stream)?;
        self.ctx.format_version = headers.image.version;
        self.ctx.guest_type = headers.domain.guest_type;
        self.ctx.page_size = headers.domain.page_size();

        self.ops.setup(&mut self.ctx)?;

        let flow = loop {
            match self.next_record()? {
                Flow::Continue => {}
                flow => break flow,
            }
        };

        if flow == Flow::Failover {
            info!("Failover to the last committed checkpoint");
        }

        // COLO completes the stream at every checkpoint.
        if self.ctx.stream_type == StreamType::Colo {
            if flow == Flow::Failover {
                info!("COLO Failover");
            }
        } else {
            self.ops.stream_complete(&mut self.ctx)?;
            info!("Restore successful");
        }

        Ok(match flow {
            Flow::Failover => Completion::Failover,
            _ => Completion::EndOfStream,
        })
    }

    /// Read one record and apply or buffer it.
    fn next_record(&mut self) -> Result<Flow> {
        let index = self.record_index;
        self.record_index += 1;

        if self.checkpoint.buffering() {
            return self.next_record_buffering(index);
        }

        let header = RecordHeader::read_from(&mut *self.stream)?;
        let res = if header.rtype == RecordType::PAGE_DATA {
            // Page data goes straight from the stream into guest memory.
            self.page_data(header.length, None).and_then(|_| {
                skip_padding(&mut *self.stream, header.rtype, header.length)?;
                Ok(Flow::Continue)
            })
        } else {
            Record::read_body(&mut *self.stream, &header)
                .map_err(RestoreError::from)
                .and_then(|record| self.process_record(&record))
        };

        res.map_err(|e| wrap_record_error(index, header.rtype, e))
    }

    fn next_record_buffering(&mut self, index: usize) -> Result<Flow> {
        // The stream breaking while buffering is how a dead sender shows up.
        let record = match RecordHeader::read_from(&mut *self.stream)
            .and_then(|header| Record::read_body(&mut *self.stream, &header))
        {
            Ok(record) => record,
            Err(e) if e.is_io() => {
                warn!("Stream broke while buffering records: {}", e);
                return Ok(Flow::Failover);
            }
            Err(e) => return Err(e.into()),
        };

        match record.rtype {
            RecordType::END | RecordType::CHECKPOINT => self
                .process_record(&record)
                .map_err(|e| wrap_record_error(index, record.rtype, e)),
            _ => {
                self.checkpoint.push(index, record);
                Ok(Flow::Continue)
            }
        }
    }

    /// Apply a record already read into memory, live or replayed.
    pub(crate) fn process_record(&mut self, record: &Record) -> Result<Flow> {
        match record.rtype {
            RecordType::END => return Ok(Flow::End),
            RecordType::PAGE_DATA => {
                self.page_data(record.length(), Some(record.data.as_slice()))?;
            }
            RecordType::VERIFY => {
                debug!("Verify mode enabled");
                self.ctx.verify = true;
                self.bufs.enable_verify(self.ctx.page_size);
            }
            RecordType::CHECKPOINT => return self.handle_checkpoint(),
            RecordType::STATIC_DATA_END => self.handle_static_data_end()?,
            rtype => match self.ops.process_record(&mut self.ctx, record)? {
                RecordDisposition::Processed => {}
                RecordDisposition::NotProcessed if rtype.is_optional() => {
                    debug!("Ignoring optional record {}", rtype);
                }
                RecordDisposition::NotProcessed => {
                    return Err(RestoreError::UnhandledRecord(rtype));
                }
            },
        }
        Ok(Flow::Continue)
    }

    /// Apply page data, from `body` when buffered or else from the stream.
    fn page_data(&mut self, length: u32, body: Option<&[u8]>) -> Result<()> {
        if !self.ctx.seen_static_data_end {
            // Version 2 streams predate STATIC_DATA_END.
            if self.ctx.format_version >= 3 {
                error!("PAGE_DATA before STATIC_DATA_END");
                return Err(RestoreError::MissingRecord(RecordType::STATIC_DATA_END));
            }
            self.handle_static_data_end()?;
        }

        let mut body = body;
        let fd: &mut dyn Read = match body.as_mut() {
            Some(body) => body,
            None => &mut *self.stream,
        };
        handle_page_data(&mut self.ctx, self.ops.as_mut(), &mut self.bufs, length, fd)
    }

    fn handle_static_data_end(&mut self) -> Result<()> {
        if self.ctx.seen_static_data_end {
            return Err(RestoreError::DuplicateRecord(RecordType::STATIC_DATA_END));
        }
        self.ctx.seen_static_data_end = true;

        let missing = self.ops.static_data_complete(&mut self.ctx)?;
        if !missing.is_empty() {
            debug!("Static data missing from stream: {:?}", missing);
        }

        if let Some(callbacks) = self.callbacks.as_mut() {
            if callbacks.static_data_done(missing) != CallbackOutcome::Success {
                return Err(RestoreError::Callback("static_data_done"));
            }
        }

        Ok(())
    }
}

/// Attach the record position to an error, once.
pub(crate) fn wrap_record_error(index: usize, rtype: RecordType, e: RestoreError) -> RestoreError {
    match e {
        RestoreError::Record { .. } => e,
        e => RestoreError::Record {
            index,
            rtype,
            source: Box::new(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use test_infra::{page_filled, MockCall, MockHypervisor, StreamBuilder};
    use vm_migration::{PageType, PfnEntry, StreamError};

    use super::*;
    use crate::callbacks::test_util::ScriptedCallbacks;
    use crate::callbacks::CheckpointOutcome;

    fn run(hv: &MockHypervisor, stream: &[u8]) -> Result<RestoreResults> {
        let mut fd = stream;
        RestoreSession::new(hv, &mut fd, &RestoreConfig::new(1), None, None)?.run()
    }

    fn hvm() -> MockHypervisor {
        MockHypervisor::new_hvm(1, 0x10_0000, 0x10_0000)
    }

    #[test]
    fn plain_stream() {
        let _ = env_logger::builder().is_test(true).try_init();
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .page_data(
                &[
                    PfnEntry::new(0x200, PageType::XAlloc),
                    PfnEntry::new(0x201, PageType::NoTable),
                ],
                &[page_filled(0x11)],
            )
            .end()
            .build();

        let results = run(&hv, &stream).unwrap();
        assert_eq!(results.completion, Completion::EndOfStream);
        assert_eq!(hv.populate_calls(), vec![(9, vec![0x200])]);
        assert_eq!(hv.page(0x201), page_filled(0x11));
        assert_eq!(hv.unmap_count(), 1);
        assert!(hv
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::SeedGrantTable(_))));
    }

    #[test]
    fn static_data_end_is_inferred_for_v2() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(2, GuestType::X86Hvm)
            .page_data(&[PfnEntry::new(0x10, PageType::XAlloc)], &[])
            .end()
            .build();
        let mut callbacks = ScriptedCallbacks::default();
        let mut fd = stream.as_slice();
        RestoreSession::new(
            &hv,
            &mut fd,
            &RestoreConfig::new(1),
            Some(&mut callbacks),
            None,
        )
        .unwrap()
        .run()
        .unwrap();
        assert_eq!(callbacks.log, vec!["static_data_done(0x3)"]);
    }

    #[test]
    fn page_data_before_static_data_end_v3() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .page_data(&[PfnEntry::new(0x10, PageType::NoTable)], &[page_filled(1)])
            .end()
            .build();
        let mut callbacks = ScriptedCallbacks::default();
        let mut fd = stream.as_slice();
        let err = RestoreSession::new(
            &hv,
            &mut fd,
            &RestoreConfig::new(1),
            Some(&mut callbacks),
            None,
        )
        .unwrap()
        .run()
        .unwrap_err();

        assert!(matches!(
            err,
            RestoreError::Record { index: 0, .. }
        ));
        assert!(matches!(
            err.root(),
            RestoreError::MissingRecord(RecordType::STATIC_DATA_END)
        ));
        assert!(callbacks.log.is_empty());
        assert!(hv.populate_calls().is_empty());
    }

    #[test]
    fn duplicate_static_data_end() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .static_data_end()
            .end()
            .build();
        let err = run(&hv, &stream).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Record { index: 1, .. }
        ));
        assert!(matches!(
            err.root(),
            RestoreError::DuplicateRecord(RecordType::STATIC_DATA_END)
        ));
    }

    #[test]
    fn unknown_records() {
        let hv = hvm();
        let optional = RecordType(RecordType::OPTIONAL | 0x7f);
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .record(optional, &[1, 2, 3])
            .end()
            .build();
        run(&hv, &stream).unwrap();

        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .record(RecordType(0x7f), &[1, 2, 3])
            .end()
            .build();
        let err = run(&hv, &stream).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Record {
                index: 1,
                rtype: RecordType(0x7f),
                ..
            }
        ));
        assert!(matches!(
            err.root(),
            RestoreError::UnhandledRecord(RecordType(0x7f))
        ));
    }

    #[test]
    fn checkpoint_in_plain_stream() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .checkpoint()
            .end()
            .build();
        let err = run(&hv, &stream).unwrap_err();
        assert!(matches!(err.root(), RestoreError::UnexpectedCheckpoint));
    }

    #[test]
    fn guest_type_mismatch() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Pv)
            .end()
            .build();
        assert!(matches!(
            run(&hv, &stream),
            Err(RestoreError::GuestTypeMismatch {
                stream: GuestType::X86Pv,
                domain: GuestType::X86Hvm
            })
        ));
    }

    #[test]
    fn truncated_stream_is_fatal() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .build();
        match run(&hv, &stream) {
            Err(RestoreError::Stream(e)) => {
                assert!(matches!(e, StreamError::ReadRecordHeader(_)))
            }
            r => panic!("unexpected result {r:?}"),
        }

        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm).build();
        let err = run(&hv, &stream[..20]).unwrap_err();
        assert!(matches!(
            err,
            RestoreError::Stream(StreamError::ReadImageHeader(_))
        ));
    }

    #[test]
    fn checkpointed_config_needs_callbacks() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm).end().build();
        let mut config = RestoreConfig::new(1);
        config.stream_type = StreamType::Remus;
        let mut fd = stream.as_slice();
        assert!(matches!(
            RestoreSession::new(&hv, &mut fd, &config, None, None),
            Err(RestoreError::Config(_))
        ));
    }

    #[test]
    fn verify_record_enables_verify_mode() {
        let entries = [PfnEntry::new(0x10, PageType::NoTable)];
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .page_data(&entries, &[page_filled(0x22)])
            .record(RecordType::VERIFY, &[])
            .page_data(&entries, &[page_filled(0x33)])
            .end()
            .build();

        let hv = hvm();
        run(&hv, &stream).unwrap();
        assert_eq!(hv.page(0x10), page_filled(0x22));

        let hv = hvm();
        let mut config = RestoreConfig::new(1);
        config.strict_verify = true;
        let mut fd = stream.as_slice();
        let err = RestoreSession::new(&hv, &mut fd, &config, None, None)
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(
            err.root(),
            RestoreError::VerifyMismatch { pfn: 0x10, .. }
        ));
    }

    #[test]
    fn remus_end_of_stream_completes() {
        let hv = hvm();
        let stream = StreamBuilder::with_headers(3, GuestType::X86Hvm)
            .static_data_end()
            .checkpoint()
            .hvm_params(&[(9, 1)])
            .checkpoint()
            .end()
            .build();
        let mut config = RestoreConfig::new(1);
        config.stream_type = StreamType::Remus;
        let mut callbacks = ScriptedCallbacks::new(&[CheckpointOutcome::Success]);
        let mut fd = stream.as_slice();
        let results = RestoreSession::new(&hv, &mut fd, &config, Some(&mut callbacks), None)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(results.completion, Completion::EndOfStream);
        assert_eq!(hv.hvm_params().get(&9), Some(&1));
    }
}
