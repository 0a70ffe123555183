// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The registry of threads eligible for backtrace collection.
//!
//! Normal-path mutation (register/unregister) happens under a mutex. The
//! crash path never takes that mutex: the thread that holds it might be the
//! one that just crashed. Instead, every mutation republishes an immutable
//! copy of the entries through an atomic pointer, and the crash handler
//! reads whichever copy is current. Replaced copies are intentionally
//! leaked — a crash handler running concurrently with a mutation may still
//! hold the previous pointer and must never observe freed memory.
//!
//! A thread that exits without unregistering leaks its entry until process
//! exit; there is no automatic reaping.

use super::crash_handler;
use nix::sys::pthread::{pthread_self, Pthread};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, PoisonError};

/// One registered thread, fully owned by the registry. The name is a
/// private copy, independent of the caller's buffer.
struct ThreadEntry {
    name: String,
    thread: Pthread,
    signum: i32,
    /// Disposition the request signal had before registration; restored on
    /// unregister.
    old_action: SigAction,
}

/// Crash-time view of a registered thread. No saved disposition here: the
/// crash path only needs the identity, display name, and request signal.
pub(crate) struct RegisteredThread {
    pub name: String,
    pub thread: Pthread,
    pub signum: i32,
}

static REGISTRY: Mutex<Vec<ThreadEntry>> = Mutex::new(Vec::new());
static CRASH_VIEW: AtomicPtr<Vec<RegisteredThread>> = AtomicPtr::new(ptr::null_mut());

/// Registers the calling thread for backtrace collection using `signum` as
/// its request signal. The disposition `signum` had before is saved in the
/// entry. Duplicate names and duplicate identities are permitted.
pub(crate) fn register_current_thread(name: &str, signum: i32) -> anyhow::Result<()> {
    let signal = Signal::try_from(signum)
        .map_err(|e| anyhow::anyhow!("Invalid backtrace-request signal {signum}: {e}"))?;
    let action = SigAction::new(
        SigHandler::Handler(crash_handler::handle_backtrace_request),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: the handler is async-signal safe (stack walk into a
    // preallocated buffer plus one atomic store).
    let old_action = unsafe { signal::sigaction(signal, &action)? };

    let entry = ThreadEntry {
        name: name.to_owned(),
        thread: pthread_self(),
        signum,
        old_action,
    };
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    // Head insertion: crash reports dump threads newest-registered first.
    registry.insert(0, entry);
    republish(&registry);
    Ok(())
}

/// Removes the first entry matching the calling thread and restores the
/// signal disposition it saved. Errors when the thread never registered.
pub(crate) fn unregister_current_thread() -> anyhow::Result<()> {
    let me = pthread_self();
    let entry = {
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        let position = registry.iter().position(|entry| entry.thread == me);
        let Some(position) = position else {
            anyhow::bail!("Thread not found in registry");
        };
        let entry = registry.remove(position);
        republish(&registry);
        entry
    };

    let signal = Signal::try_from(entry.signum)
        .map_err(|e| anyhow::anyhow!("Invalid backtrace-request signal {}: {e}", entry.signum))?;
    // Safety: restores a disposition previously returned by sigaction.
    unsafe { signal::sigaction(signal, &entry.old_action)? };
    Ok(())
}

fn republish(registry: &[ThreadEntry]) {
    let view: Vec<RegisteredThread> = registry
        .iter()
        .map(|entry| RegisteredThread {
            name: entry.name.clone(),
            thread: entry.thread,
            signum: entry.signum,
        })
        .collect();
    // The replaced view is intentionally leaked: a crash handler may still
    // be reading it. Bounded by registration churn, and views are small.
    let _ = CRASH_VIEW.swap(Box::into_raw(Box::new(view)), SeqCst);
}

/// The current crash-time view, read without any lock. Safe to call from
/// the crash handler.
pub(crate) fn crash_view() -> &'static [RegisteredThread] {
    let ptr = CRASH_VIEW.load(SeqCst);
    if ptr.is_null() {
        &[]
    } else {
        // Safety: published views are never freed (see republish).
        unsafe { (*ptr).as_slice() }
    }
}

pub(crate) fn is_empty() -> bool {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_empty()
}

#[cfg(test)]
pub(crate) fn registered_names() -> Vec<String> {
    REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|entry| entry.name.clone())
        .collect()
}
