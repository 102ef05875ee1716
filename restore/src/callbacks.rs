// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hooks through which the restore reports to, and waits on, the toolstack
//! orchestrating a checkpointed stream.

use bitflags::bitflags;

/// Result of a checkpoint boundary, as decided by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Commit the checkpoint and keep streaming.
    Success,
    /// The sender is gone: resume from the last committed checkpoint.
    Failover,
    Error,
}

/// Result of the other orchestrator callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success,
    /// The channel to the primary broke; treated as a failover.
    BrokenChannel,
    Error,
}

bitflags! {
    /// Static CPU data the stream did not supply.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MissingStaticData: u32 {
        const CPUID = 1 << 0;
        const MSR = 1 << 1;
    }
}

pub trait RestoreCallbacks {
    /// Called at every CHECKPOINT record.
    fn checkpoint(&mut self) -> CheckpointOutcome;

    /// Suspend the secondary VM (COLO).
    fn suspend(&mut self) -> CallbackOutcome {
        CallbackOutcome::Error
    }

    /// Resume the secondary VM (COLO).
    fn postcopy(&mut self) -> CallbackOutcome {
        CallbackOutcome::Error
    }

    /// Block until the primary asks for the next checkpoint (COLO).
    fn wait_checkpoint(&mut self) -> CallbackOutcome {
        CallbackOutcome::Error
    }

    fn restore_results(&mut self, _store_gfn: u64, _console_gfn: u64) {}

    /// Called once static data is complete.
    fn static_data_done(&mut self, _missing: MissingStaticData) -> CallbackOutcome {
        CallbackOutcome::Success
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::VecDeque;

    use super::*;

    /// Answers callbacks from a script, recording every call made.
    #[derive(Default)]
    pub struct ScriptedCallbacks {
        /// Checkpoint answers, `Success` once exhausted.
        pub checkpoints: VecDeque<CheckpointOutcome>,
        /// Answers to the COLO callbacks in call order, `Success` once
        /// exhausted.
        pub colo: VecDeque<CallbackOutcome>,
        pub log: Vec<String>,
    }

    impl ScriptedCallbacks {
        pub fn new(checkpoints: &[CheckpointOutcome]) -> Self {
            ScriptedCallbacks {
                checkpoints: checkpoints.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn colo_call(&mut self, name: &str) -> CallbackOutcome {
            self.log.push(name.to_string());
            self.colo.pop_front().unwrap_or(CallbackOutcome::Success)
        }
    }

    impl RestoreCallbacks for ScriptedCallbacks {
        fn checkpoint(&mut self) -> CheckpointOutcome {
            self.log.push("checkpoint".to_string());
            self.checkpoints
                .pop_front()
                .unwrap_or(CheckpointOutcome::Success)
        }

        fn suspend(&mut self) -> CallbackOutcome {
            self.colo_call("suspend")
        }

        fn postcopy(&mut self) -> CallbackOutcome {
            self.colo_call("postcopy")
        }

        fn wait_checkpoint(&mut self) -> CallbackOutcome {
            self.colo_call("wait_checkpoint")
        }

        fn restore_results(&mut self, store_gfn: u64, console_gfn: u64) {
            self.log
                .push(format!("restore_results({store_gfn:#x}, {console_gfn:#x})"));
        }

        fn static_data_done(&mut self, missing: MissingStaticData) -> CallbackOutcome {
            self.log
                .push(format!("static_data_done({:#x})", missing.bits()));
            CallbackOutcome::Success
        }
    }
}
