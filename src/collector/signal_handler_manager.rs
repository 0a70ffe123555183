// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installs and restores the fatal-signal handlers.
//!
//! Installation happens once at initialization, in the order the
//! configuration lists the signals; each replaced disposition is saved so
//! shutdown can put things back exactly as they were.

use super::crash_handler;
use crate::shared::configuration::CrashtraceConfiguration;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::mem;
use std::sync::{Mutex, PoisonError};

static OLD_HANDLERS: Mutex<Vec<(Signal, SigAction)>> = Mutex::new(Vec::new());

/// Installs the crash handler for every fatal signal the configuration
/// names. Per-signal failures are accumulated so one bad signal does not
/// mask the others; the dispositions that did get replaced stay recorded
/// for later restoration either way.
pub(crate) fn register_crash_handlers(config: &CrashtraceConfiguration) -> anyhow::Result<()> {
    let mut errors = Vec::new();
    let mut saved = OLD_HANDLERS.lock().unwrap_or_else(PoisonError::into_inner);
    for &signum in config.signals() {
        match register_signal_handler(signum) {
            Ok(entry) => saved.push(entry),
            Err(e) => errors.push(format!("signal {signum}: {e}")),
        }
    }
    anyhow::ensure!(
        errors.is_empty(),
        "Failed to install crash handlers: {}",
        errors.join(", ")
    );
    Ok(())
}

fn register_signal_handler(signum: i32) -> anyhow::Result<(Signal, SigAction)> {
    let signal = Signal::try_from(signum)?;
    // SA_NODEFER so a fault inside the handler re-enters it, where the
    // one-shot guard turns it into an immediate exit instead of a hang.
    let action = SigAction::new(
        SigHandler::Handler(crash_handler::handle_crash_signal),
        SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // Safety: the handler only touches state published through atomics and
    // performs writes through the async-signal-safe emitter path.
    let old_action = unsafe { signal::sigaction(signal, &action)? };
    Ok((signal, old_action))
}

/// Restores every disposition saved by [`register_crash_handlers`] and
/// forgets them. Safe to call when nothing was installed.
pub(crate) fn restore_old_handlers() -> anyhow::Result<()> {
    let saved = mem::take(&mut *OLD_HANDLERS.lock().unwrap_or_else(PoisonError::into_inner));
    for (signal, old_action) in saved {
        // Safety: restores a disposition previously returned by sigaction.
        unsafe { signal::sigaction(signal, &old_action)? };
    }
    Ok(())
}
