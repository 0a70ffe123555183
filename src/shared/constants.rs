// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults and fixed capacities shared between configuration and the crash
//! path. Everything here is a compile-time constant so the signal handlers
//! never have to consult mutable state for sizing decisions.

use std::time::Duration;

/// Default number of raw return addresses captured per backtrace.
pub const DEFAULT_STACK_DEPTH: usize = 64;

/// Slack added on top of `max_stack_depth` when sizing the snapshot buffer,
/// so the walk never writes past the end even if the primitive reports a
/// couple of extra frames.
pub const STACK_DEPTH_MARGIN: usize = 5;

/// Default signal used to request a backtrace from a registered thread.
pub const DEFAULT_BACKTRACE_SIGNAL: i32 = libc::SIGUSR1;

/// Default per-thread wait while polling for a cross-thread capture.
pub const DEFAULT_THREAD_WAIT: Duration = Duration::from_secs(5);

/// Capacity of the fixed line buffer used by the output multiplexer.
/// A formatted line that does not fit is rejected outright; no partial
/// bytes reach any destination.
pub const MAX_LINE_LEN: usize = 512;

/// Capacity of one eagerly-resolved frame name. Symbol names longer than
/// this are truncated at a character boundary.
pub const MAX_FRAME_NAME_LEN: usize = 256;

/// Mode bits used when the report file has to be created (0644).
pub const REPORT_FILE_MODE: libc::mode_t = 0o644;

/// Horizontal rule used at the top and bottom of a report.
pub const REPORT_BANNER: &str =
    "*********************************************************";

/// Title line printed inside the banner block.
pub const REPORT_TITLE: &str = "*               Crashtrace Crash Handler";

/// Signals considered fatal when the configuration does not name any.
pub fn default_signals() -> Vec<i32> {
    vec![libc::SIGSEGV, libc::SIGILL, libc::SIGBUS, libc::SIGABRT]
}

/// Human-readable name for the signals this crate commonly deals with.
/// Only used to enrich the report header, which always carries the numeric
/// `signo=` field as well; unrecognized signals are named "UNKNOWN".
pub fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSYS => "SIGSYS",
        _ => "UNKNOWN",
    }
}
