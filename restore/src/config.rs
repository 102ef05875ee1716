// Copyright © 2022 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use hypervisor::DomainId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors associated with restore configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error parsing the JSON configuration
    #[error("Error parsing restore configuration")]
    Parse(#[source] serde_json::Error),
    /// Checkpointed streams need someone to answer checkpoint callbacks
    #[error("A {0} stream requires orchestrator callbacks")]
    MissingCallbacks(StreamType),
    /// COLO sends dirty pfn lists back to the primary
    #[error("A colo stream requires a back channel")]
    MissingBackChannel,
}

/// How the sender produces the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// One-shot migration, or restore from a save file.
    #[default]
    Plain,
    /// Periodic checkpoints, one-way failover.
    Remus,
    /// Periodic checkpoints with a running secondary.
    Colo,
}

impl StreamType {
    pub fn is_checkpointed(self) -> bool {
        self != StreamType::Plain
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Plain => write!(f, "plain"),
            StreamType::Remus => write!(f, "remus"),
            StreamType::Colo => write!(f, "colo"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RestoreConfig {
    pub domid: DomainId,
    #[serde(default)]
    pub stream_type: StreamType,
    pub store_evtchn: u32,
    pub store_domid: DomainId,
    pub console_evtchn: u32,
    pub console_domid: DomainId,
    /// Fail the restore when a verified page differs from guest memory.
    #[serde(default)]
    pub strict_verify: bool,
}

impl RestoreConfig {
    pub fn new(domid: DomainId) -> Self {
        RestoreConfig {
            domid,
            stream_type: StreamType::Plain,
            store_evtchn: 0,
            store_domid: 0,
            console_evtchn: 0,
            console_domid: 0,
            strict_verify: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }

    pub fn validate(&self, has_callbacks: bool, has_back_channel: bool) -> Result<(), ConfigError> {
        if self.stream_type.is_checkpointed() && !has_callbacks {
            return Err(ConfigError::MissingCallbacks(self.stream_type));
        }

        if self.stream_type == StreamType::Colo && !has_back_channel {
            return Err(ConfigError::MissingBackChannel);
        }

        Ok(())
    }
}
