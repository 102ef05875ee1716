// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Checkpointed streams (Remus and COLO).
//!
//! After the first CHECKPOINT record everything up to the next one is held
//! back, and only applied once the orchestrator confirms the checkpoint is
//! complete. If the sender dies in between, the held records are dropped and
//! the domain resumes from the last complete checkpoint.

use byteorder::{ByteOrder, LittleEndian};
use vm_allocator::Bitmap;
use vm_migration::{Record, RecordType};

use crate::callbacks::{CallbackOutcome, CheckpointOutcome};
use crate::config::{ConfigError, StreamType};
use crate::session::{wrap_record_error, Flow, RestoreSession};
use crate::{RestoreError, Result};

/// Records received since the last checkpoint, in stream order, each with
/// its index in the stream.
#[derive(Debug, Default)]
pub(crate) struct CheckpointBuffer {
    buffering: bool,
    records: Vec<(usize, Record)>,
}

impl CheckpointBuffer {
    pub fn buffering(&self) -> bool {
        self.buffering
    }

    pub fn push(&mut self, index: usize, record: Record) {
        self.records.push((index, record));
    }
}

/// Turn a COLO callback answer into loop control.
fn colo_outcome(outcome: CallbackOutcome, name: &'static str) -> Result<Option<Flow>> {
    match outcome {
        CallbackOutcome::Success => Ok(None),
        CallbackOutcome::BrokenChannel => Ok(Some(Flow::Failover)),
        CallbackOutcome::Error => Err(RestoreError::Callback(name)),
    }
}

macro_rules! colo_call {
    ($session:expr, $name:ident) => {{
        let outcome = $session
            .callbacks
            .as_mut()
            .map_or(CallbackOutcome::Error, |cb| cb.$name());
        if let Some(flow) = colo_outcome(outcome, stringify!($name))? {
            return Ok(flow);
        }
    }};
}

impl RestoreSession<'_> {
    pub(crate) fn handle_checkpoint(&mut self) -> Result<Flow> {
        if !self.ctx.stream_type.is_checkpointed() {
            return Err(RestoreError::UnexpectedCheckpoint);
        }

        let outcome = self
            .callbacks
            .as_mut()
            .map_or(CheckpointOutcome::Error, |cb| cb.checkpoint());
        match outcome {
            CheckpointOutcome::Success => {}
            CheckpointOutcome::Failover if self.checkpoint.buffering => {
                return Ok(Flow::Failover)
            }
            // Nothing was ever committed, so there is nothing to resume.
            CheckpointOutcome::Failover => return Err(RestoreError::FailoverWithoutState),
            CheckpointOutcome::Error => return Err(RestoreError::Callback("checkpoint")),
        }

        if self.checkpoint.buffering {
            info!("All records buffered");
            let records = std::mem::take(&mut self.checkpoint.records);
            for (index, record) in &records {
                self.process_record(record)
                    .map_err(|e| wrap_record_error(*index, record.rtype, e))?;
            }
            info!("All records processed");
        } else {
            self.checkpoint.buffering = true;
        }

        if self.ctx.stream_type == StreamType::Colo {
            // The secondary runs between checkpoints.
            self.ops.stream_complete(&mut self.ctx)?;

            let (store_gfn, console_gfn) = (self.ctx.store.gfn, self.ctx.console.gfn);
            if let Some(cb) = self.callbacks.as_mut() {
                cb.restore_results(store_gfn, console_gfn);
            }

            colo_call!(self, postcopy);
            colo_call!(self, wait_checkpoint);
            colo_call!(self, suspend);

            self.send_checkpoint_dirty_pfn_list()?;
        }

        Ok(Flow::Continue)
    }

    /// Tell the primary which pages the secondary dirtied since the last
    /// checkpoint, so it can send them again.
    fn send_checkpoint_dirty_pfn_list(&mut self) -> Result<()> {
        let p2m_size = self.ctx.p2m_size;
        let words = self
            .ctx
            .hv
            .logdirty_clean(self.ctx.domid, p2m_size)
            .map_err(RestoreError::DirtyLog)?;

        let pfns: Vec<u64> = Bitmap::from_words(words)
            .iter_ones()
            .take_while(|&pfn| pfn < p2m_size)
            .collect();
        let mut data = vec![0u8; pfns.len() * 8];
        LittleEndian::write_u64_into(&pfns, &mut data);
        debug!("Sending {} dirty pfns", pfns.len());

        let send_back = self
            .send_back
            .as_mut()
            .ok_or(RestoreError::Config(ConfigError::MissingBackChannel))?;
        Record::new(RecordType::CHECKPOINT_DIRTY_PFN_LIST, data).write_to(&mut **send_back)?;
        Ok(())
    }
}
