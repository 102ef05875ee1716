// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

//! Restores a Xen domain from a migration stream.
//!
//! [`restore_domain`] is the toolstack facing entry point; the machinery
//! lives in the `restore` crate.

#[macro_use]
extern crate log;

use std::error::Error;
use std::io::{Read, Write};

use hypervisor::Hypervisor;
pub use restore::{
    CallbackOutcome, CheckpointOutcome, Completion, ConfigError, MissingStaticData,
    RestoreCallbacks, RestoreConfig, RestoreError, RestoreResults, StreamType,
};

/// Restore `stream` into the domain named by `config`.
///
/// Remus and COLO streams need `callbacks`, COLO also needs `send_back`
/// for the dirty pfn lists. On failure the error chain is logged before
/// being returned.
pub fn restore_domain<'a>(
    hv: &'a dyn Hypervisor,
    stream: &'a mut dyn Read,
    config: &RestoreConfig,
    callbacks: Option<&'a mut dyn RestoreCallbacks>,
    send_back: Option<&'a mut dyn Write>,
) -> restore::Result<RestoreResults> {
    let res = restore::RestoreSession::new(hv, stream, config, callbacks, send_back)
        .and_then(|session| session.run());

    match &res {
        Ok(results) => {
            info!(
                "XenStore: mfn {:#x}, dom {}, evt {}",
                results.store_gfn, config.store_domid, config.store_evtchn
            );
            info!(
                "Console: mfn {:#x}, dom {}, evt {}",
                results.console_gfn, config.console_domid, config.console_evtchn
            );
        }
        Err(e) => log_error_chain(e, "Restore"),
    }

    res
}

/// Logs a chain of errors in a consistent manner: every level of the chain
/// on its own line, followed by debug output for opening issues.
pub fn log_error_chain(top_error: &dyn Error, component: &str) {
    if top_error.source().is_none() {
        error!("{component} failed with the following error: {top_error}");
    } else {
        error!("{component} failed with the following chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| {
            // Dereference necessary to mitigate rustc compiler bug.
            // See <https://github.com/rust-lang/rust/issues/141673>
            (*sub_error).source()
        })
        .enumerate()
        .for_each(|(level, error)| {
            error!("  {level}: {error}");
        });
    }

    debug!("Debug Info: {top_error:?}");
}
