// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash diagnostics.
//!
//! This crate installs handlers for fatal signals and, when one fires,
//! writes a line-oriented crash report — the crashing thread's backtrace,
//! plus optionally the backtraces of every registered thread — to each
//! configured destination before terminating the process with the signal
//! number as its exit status.
//!
//! ```no_run
//! use crashtrace::CrashtraceConfiguration;
//!
//! let mut config = CrashtraceConfiguration::new(vec![])?;
//! config.set_output_filename("/tmp/crash_report.txt")?;
//! config.set_dump_all_threads(true);
//! crashtrace::init(config)?;
//!
//! // Worker threads that want their stacks in the report:
//! crashtrace::register_thread("worker", None)?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Once a fatal signal is delivered the process is considered unrecoverable:
//! the report is emitted on a best-effort basis and the process exits.

mod collector;
mod crash_info;
mod shared;

pub use crash_info::{Symbol, SymbolTable};
pub use shared::configuration::CrashtraceConfiguration;

use collector::{backtrace_capture, crash_handler, signal_handler_manager, thread_registry};
use shared::constants::STACK_DEPTH_MARGIN;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes crash tracking: allocates the backtrace buffer, publishes
/// the configuration, and installs the fatal-signal handlers.
///
/// Errors if crash tracking is already initialized, or if installing any
/// handler fails (in which case the handlers that did get installed are
/// rolled back).
///
/// ATOMICITY:
///     A compare-and-swap guard admits exactly one caller; concurrent and
///     repeated calls fail with "already initialized".
pub fn init(config: CrashtraceConfiguration) -> anyhow::Result<()> {
    anyhow::ensure!(
        INITIALIZED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok(),
        "Crash tracking is already initialized"
    );
    init_impl(config).inspect_err(|_| INITIALIZED.store(false, SeqCst))
}

fn init_impl(mut config: CrashtraceConfiguration) -> anyhow::Result<()> {
    if let Some(table) = config.symbol_table() {
        // An unsorted table degrades resolution but does not block startup.
        if let Err(e) = table.validate() {
            if config.verbosity_allows(log::Level::Warn) {
                log::warn!("Symbol table failed validation: {e}");
            }
        }
    }

    let with_names = config.fallback_symbolizer() && config.symbol_table().is_none();
    backtrace_capture::install_snapshot(backtrace_capture::BacktraceSnapshot::new(
        config.max_stack_depth() + STACK_DEPTH_MARGIN,
        with_names,
    ));

    let stream = config.take_output_stream();
    let config = crash_handler::publish_config(config, stream);
    if let Err(e) = signal_handler_manager::register_crash_handlers(config) {
        // Roll back whatever was installed before the failing signal.
        let _ = signal_handler_manager::restore_old_handlers();
        crash_handler::unpublish_config();
        backtrace_capture::clear_snapshot();
        return Err(e);
    }

    if config.verbosity_allows(log::Level::Debug) {
        log::debug!("Crash tracking initialized: {config:?}");
    }
    Ok(())
}

/// Disables crash tracking: restores the fatal-signal dispositions saved at
/// [`init`] and withdraws the published state. The withdrawn configuration
/// is leaked, not freed, in case a crash handler on another thread is
/// already mid-report. Threads still registered keep
/// their request-signal handlers until they unregister themselves; their
/// shared buffer is retained for them.
pub fn shutdown() -> anyhow::Result<()> {
    anyhow::ensure!(
        INITIALIZED.load(SeqCst),
        "Crash tracking is not initialized"
    );
    signal_handler_manager::restore_old_handlers()?;
    crash_handler::unpublish_config();
    backtrace_capture::clear_snapshot();
    INITIALIZED.store(false, SeqCst);
    Ok(())
}

/// Registers the calling thread for inclusion in crash reports, under
/// `name`. `signum` selects the backtrace-request signal for this thread;
/// `None` (or `Some(0)`) uses the configured default.
///
/// A thread may register more than once; each registration is removed by
/// one matching [`unregister_thread`] call, most recent first.
///
/// PRECONDITIONS:
///     [`init`] must have succeeded; the request signal must not be one of
///     the intercepted fatal signals.
pub fn register_thread(name: &str, signum: Option<i32>) -> anyhow::Result<()> {
    let Some(config) = crash_handler::config_ref() else {
        anyhow::bail!("Crash tracking is not initialized");
    };
    let signum = match signum {
        None | Some(0) => config.default_backtrace_signal(),
        Some(signum) => signum,
    };
    anyhow::ensure!(
        !config.signals().contains(&signum),
        "Backtrace-request signal collides with an intercepted fatal signal"
    );
    thread_registry::register_current_thread(name, signum)?;
    if config.verbosity_allows(log::Level::Debug) {
        log::debug!("Registered thread {name:?} with request signal {signum}");
    }
    Ok(())
}

/// Removes the calling thread's most recent registration and restores the
/// request-signal disposition that registration saved.
pub fn unregister_thread() -> anyhow::Result<()> {
    thread_registry::unregister_current_thread()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    fn lifecycle_checks() -> anyhow::Result<()> {
        anyhow::ensure!(register_thread("early", None).is_err(), "pre-init register");
        anyhow::ensure!(shutdown().is_err(), "pre-init shutdown");

        let config = CrashtraceConfiguration::new(vec![])?;
        init(config)?;
        let second = CrashtraceConfiguration::new(vec![])?;
        let err = init(second).unwrap_err();
        anyhow::ensure!(
            err.to_string().contains("already initialized"),
            "double init must name the conflict"
        );

        register_thread("main", None)?;
        register_thread("main", Some(libc::SIGUSR2))?;
        anyhow::ensure!(
            register_thread("bad", Some(libc::SIGSEGV)).is_err(),
            "fatal signal must be rejected as a request signal"
        );
        unregister_thread()?;
        unregister_thread()?;
        anyhow::ensure!(unregister_thread().is_err(), "registry must be empty");

        shutdown()?;
        anyhow::ensure!(shutdown().is_err(), "double shutdown");

        // A fresh cycle works after shutdown.
        init(CrashtraceConfiguration::new(vec![])?)?;
        shutdown()?;
        Ok(())
    }

    // Installing process-wide signal handlers from the multithreaded test
    // runner would leak into unrelated tests, so the whole lifecycle runs
    // in a forked child and reports through its exit status.
    #[test]
    fn test_init_register_shutdown_lifecycle() {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match lifecycle_checks() {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("lifecycle failed: {e}");
                        1
                    }
                };
                unsafe { libc::_exit(code) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}
