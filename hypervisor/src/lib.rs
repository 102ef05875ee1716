// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! A narrow abstraction around the privileged primitives a domain restore
//! needs from the hypervisor.
//!
//! Restore code only ever talks to the [`Hypervisor`] trait, so the same
//! engine runs against a real control interface or an in-memory mock.
//!
//! # Platform support
//!
//! - x86_64
//!

extern crate anyhow;
extern crate serde;
extern crate thiserror;

/// Domain related definitions
pub mod domain;

/// Hypevisor related module
pub mod hypervisor;

pub use crate::domain::{
    DomainId, DomainInfo, GrantTableSeed, TscInfo, VcpuStateKind, PAGE_SHIFT, PAGE_SIZE,
};
pub use crate::hypervisor::{ForeignMapping, Hypervisor, HypervisorError, Result};
