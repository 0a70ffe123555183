// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The signal handlers and the crash report itself.
//!
//! `handle_crash_signal` runs on the crashing thread. It writes the report
//! header, captures and emits the local backtrace, then (when configured)
//! walks the registered-thread view requesting a backtrace from each thread
//! in turn and polling for completion. Everything it touches was published
//! through atomics before the crash; nothing on this path allocates or
//! takes a lock, except the optional caller-supplied stream destination and
//! the optional fallback symbolizer, both explicit opt-ins.

use super::backtrace_capture::{self, BacktraceSnapshot};
use super::emitters::OutputSinks;
use super::thread_registry;
use crate::shared::configuration::CrashtraceConfiguration;
use crate::shared::constants::{signal_name, REPORT_BANNER, REPORT_TITLE};
use nix::sys::pthread::{pthread_kill, pthread_self};
use nix::sys::signal::Signal;
use std::io::Write;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};

static CONFIG: AtomicPtr<CrashtraceConfiguration> = AtomicPtr::new(ptr::null_mut());
static OUTPUT_STREAM: AtomicPtr<StreamCell> = AtomicPtr::new(ptr::null_mut());

/// Set by `handle_backtrace_request` when a cross-thread capture finishes;
/// cleared by the coordinator before each request.
static BACKTRACE_DONE: AtomicBool = AtomicBool::new(false);

/// One-shot guard: a second fatal signal (including a fault inside the
/// handler itself) exits immediately instead of re-reporting.
static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);

/// Stable home for the stream destination, separated from the
/// configuration so the handler can take a mutable borrow of the stream
/// while reading the configuration immutably.
struct StreamCell(Box<dyn Write + Send>);

/// Publishes the configuration (and its stream destination, if any) for the
/// crash path. Returns the now-'static configuration for the caller's own
/// bookkeeping.
///
/// PRECONDITIONS:
///     Nothing published: call only from `init` under its one-shot guard.
pub(crate) fn publish_config(
    config: CrashtraceConfiguration,
    stream: Option<Box<dyn Write + Send>>,
) -> &'static CrashtraceConfiguration {
    if let Some(stream) = stream {
        let old = OUTPUT_STREAM.swap(Box::into_raw(Box::new(StreamCell(stream))), SeqCst);
        debug_assert!(old.is_null());
    }
    let ptr = CONFIG.swap(Box::into_raw(Box::new(config)), SeqCst);
    debug_assert!(ptr.is_null());
    // Safety: just stored from Box::into_raw, and never freed.
    unsafe { &*CONFIG.load(SeqCst) }
}

/// Withdraws the published configuration, flushing the stream destination.
///
/// The withdrawn blocks are intentionally leaked rather than freed: a crash
/// handler already in flight on another thread when shutdown runs may still
/// hold the pointers. The leak is bounded by init/shutdown churn.
pub(crate) fn unpublish_config() {
    let stream = OUTPUT_STREAM.swap(ptr::null_mut(), SeqCst);
    if !stream.is_null() {
        // Safety: the only non-null values stored here come from
        // Box::into_raw in publish_config, and they are never freed.
        let _ = unsafe { (*stream).0.flush() };
    }
    let _ = CONFIG.swap(ptr::null_mut(), SeqCst);
}

/// The published configuration, if any. Used by the registration API to
/// reject calls before initialization.
pub(crate) fn config_ref() -> Option<&'static CrashtraceConfiguration> {
    let ptr = CONFIG.load(SeqCst);
    if ptr.is_null() {
        None
    } else {
        // Safety: published configurations are never freed (see
        // unpublish_config), so the reference cannot dangle.
        Some(unsafe { &*ptr })
    }
}

/// Whether captures should eagerly resolve names: only when the deployment
/// opted into the fallback symbolizer and supplied no symbol table.
fn resolve_names(config: &CrashtraceConfiguration) -> bool {
    config.fallback_symbolizer() && config.symbol_table().is_none()
}

/// Fatal-signal entry point. Emits the crash report, then terminates the
/// process with the signal number as its exit status.
///
/// ATOMICITY:
///     The one-shot guard makes re-entry (a fault inside the handler, or a
///     second fatal signal racing the first) exit immediately with the new
///     signal's number instead of producing an interleaved report.
pub(crate) extern "C" fn handle_crash_signal(signum: i32) {
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        // Safety: _exit is async-signal safe.
        unsafe { libc::_exit(signum) };
    }
    handle_crash_impl(signum);
    // Safety: as above.
    unsafe { libc::_exit(signum) };
}

macro_rules! emit {
    ($sinks:expr, $($arg:tt)*) => {
        // Per-destination failures were already isolated inside emit_fmt;
        // there is nowhere further to report them from a dying process.
        let _ = $sinks.emit_fmt(format_args!($($arg)*));
    };
}

fn handle_crash_impl(signum: i32) {
    let Some(config) = config_ref() else { return };
    let stream_cell = OUTPUT_STREAM.load(SeqCst);
    let stream: Option<&mut (dyn Write + Send)> = if stream_cell.is_null() {
        None
    } else {
        // Safety: published cells are never freed, and this handler is the
        // sole writer thanks to the one-shot guard.
        Some(unsafe { &mut *(*stream_cell).0 })
    };

    let mut sinks = OutputSinks::open(config, stream);
    emit!(sinks, "{REPORT_BANNER}\n");
    emit!(sinks, "{REPORT_TITLE}\n");
    emit!(sinks, "{REPORT_BANNER}\n");
    emit!(sinks, "*\n");
    emit!(
        sinks,
        "*  Got a crash! signo={signum} ({})\n",
        signal_name(signum)
    );
    emit!(sinks, "*\n");
    emit!(sinks, "*  Offending Thread's Backtrace:\n");
    emit!(sinks, "*\n");

    // Safety: the one-shot guard makes this handler the only writer of the
    // snapshot buffer right now.
    if let Some(snapshot) = unsafe { backtrace_capture::snapshot_mut() } {
        unsafe { snapshot.capture_local(resolve_names(config)) };
        emit_backtrace(&mut sinks, config, snapshot);
    } else {
        emit!(sinks, "*  Error: no backtrace buffer installed\n");
    }
    emit!(sinks, "*\n");

    if config.dump_all_threads() {
        dump_other_threads(&mut sinks, config);
    }

    emit!(sinks, "*\n");
    emit!(sinks, "{REPORT_BANNER}\n");
    sinks.finish();
}

/// Requests a backtrace from each registered thread except the crashing
/// one, polling once per second until the capture completes or the
/// configured wait expires.
fn dump_other_threads(sinks: &mut OutputSinks<'_>, config: &CrashtraceConfiguration) {
    let me = pthread_self();
    let wait_secs = config.thread_wait_time().as_secs();
    for registered in thread_registry::crash_view() {
        if registered.thread == me {
            continue;
        }

        BACKTRACE_DONE.store(false, SeqCst);
        let delivered = Signal::try_from(registered.signum)
            .and_then(|signal| pthread_kill(registered.thread, signal))
            .is_ok();
        let mut done = false;
        if delivered {
            for _ in 0..wait_secs {
                if BACKTRACE_DONE.load(SeqCst) {
                    done = true;
                    break;
                }
                // Safety: sleep is async-signal safe.
                unsafe { libc::sleep(1) };
            }
            done = done || BACKTRACE_DONE.load(SeqCst);
        }

        if done {
            emit!(
                sinks,
                "*  Backtrace of \"{}\" ({:#x})\n",
                registered.name,
                registered.thread as usize
            );
            // Safety: the target thread set BACKTRACE_DONE after its
            // capture finished, so the buffer is quiescent again.
            if let Some(snapshot) = unsafe { backtrace_capture::snapshot_mut() } {
                emit_backtrace(sinks, config, snapshot);
            }
        } else {
            emit!(
                sinks,
                "*  Error: unable to get backtrace of \"{}\" ({:#x})\n",
                registered.name,
                registered.thread as usize
            );
        }
        emit!(sinks, "*\n");
    }
}

/// Emits one captured backtrace, frame per line. Resolution preference:
/// caller-supplied symbol table first, then any name resolved eagerly at
/// capture time, then the raw address.
fn emit_backtrace(
    sinks: &mut OutputSinks<'_>,
    config: &CrashtraceConfiguration,
    snapshot: &BacktraceSnapshot,
) {
    for index in 0..snapshot.len() {
        let address = snapshot.frame(index);
        if let Some(symbol) = config
            .symbol_table()
            .and_then(|table| table.resolve(address))
        {
            emit!(
                sinks,
                "*      Frame {index:02}: {}+{}\n",
                symbol.function,
                address - symbol.address
            );
        } else if let Some(name) = snapshot.name(index) {
            emit!(sinks, "*      Frame {index:02}: {name}\n");
        } else {
            emit!(sinks, "*      Frame {index:02}: {address:#x}\n");
        }
    }
}

/// Backtrace-request entry point, installed on registered threads. Captures
/// the calling thread's stack into the shared snapshot and signals
/// completion to the polling coordinator.
pub(crate) extern "C" fn handle_backtrace_request(_signum: i32) {
    let resolve = config_ref().is_some_and(resolve_names);
    // Safety: the coordinator issues one request at a time and polls it to
    // completion, so this thread is the sole writer of the buffer.
    if let Some(snapshot) = unsafe { backtrace_capture::snapshot_mut() } {
        unsafe { snapshot.capture_local(resolve) };
    }
    BACKTRACE_DONE.store(true, SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    // The published configuration is process-global; serialize these tests.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_publish_and_unpublish_config() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(config_ref().is_none());

        let config = CrashtraceConfiguration::new(vec![]).unwrap();
        let published = publish_config(config, None);
        assert_eq!(published.max_stack_depth(), 64);
        assert!(config_ref().is_some());

        unpublish_config();
        assert!(config_ref().is_none());
    }

    #[test]
    fn test_unpublish_leaves_prior_references_valid() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let config = CrashtraceConfiguration::new(vec![]).unwrap();
        let published = publish_config(config, None);
        unpublish_config();
        assert!(config_ref().is_none());
        // A reference obtained before withdrawal stays readable: published
        // configurations are leaked, never freed, so a handler caught
        // mid-report by a concurrent shutdown cannot dangle.
        assert_eq!(published.max_stack_depth(), 64);
    }

    #[test]
    fn test_backtrace_request_fills_snapshot_and_signals_done() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        backtrace_capture::install_snapshot(BacktraceSnapshot::new(32, false));
        BACKTRACE_DONE.store(false, SeqCst);

        handle_backtrace_request(libc::SIGUSR1);

        assert!(BACKTRACE_DONE.load(SeqCst));
        let snapshot = unsafe { backtrace_capture::snapshot_mut() }.unwrap();
        assert!(snapshot.len() > 0);
        backtrace_capture::clear_snapshot();
    }
}
