// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::SymbolTable;
use crate::shared::constants;
use nix::sys::signal::Signal;
use std::ffi::CString;
use std::fmt;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Process-wide crash tracking configuration.
///
/// Constructed by the caller, then handed to [`crate::init`] which takes
/// ownership; after that the configuration is immutable for the process
/// lifetime. Every output destination is optional and all configured
/// destinations receive the same report lines.
///
/// The path destination is re-encoded as a NUL-terminated C string at
/// construction time so the crash handler can `open(2)` it without
/// allocating.
pub struct CrashtraceConfiguration {
    output_filename: Option<String>,
    output_path_cstr: Option<CString>,
    output_stream: Option<Box<dyn Write + Send>>,
    output_fd: Option<RawFd>,
    max_stack_depth: usize,
    default_backtrace_signal: i32,
    thread_wait_time: Duration,
    dump_all_threads: bool,
    fallback_symbolizer: bool,
    symbol_table: Option<SymbolTable>,
    log_level: log::LevelFilter,
    signals: Vec<i32>,
}

impl CrashtraceConfiguration {
    /// Creates a configuration intercepting the given fatal signals, with
    /// every other field at its default. An empty list selects the default
    /// fatal set (SIGSEGV, SIGILL, SIGBUS, SIGABRT).
    ///
    /// Signals are installed in the order given, so the list must not
    /// contain duplicates, and the backtrace-request signal must not itself
    /// be one of the intercepted fatal signals.
    pub fn new(mut signals: Vec<i32>) -> anyhow::Result<Self> {
        if signals.is_empty() {
            signals = constants::default_signals();
        } else {
            let mut sorted = signals.clone();
            sorted.sort_unstable();
            sorted.dedup();
            anyhow::ensure!(
                sorted.len() == signals.len(),
                "Signals contained duplicate elements"
            );
            for signum in &signals {
                Signal::try_from(*signum)
                    .map_err(|e| anyhow::anyhow!("Invalid signal number {signum}: {e}"))?;
            }
        }
        let config = Self {
            output_filename: None,
            output_path_cstr: None,
            output_stream: None,
            output_fd: None,
            max_stack_depth: constants::DEFAULT_STACK_DEPTH,
            default_backtrace_signal: constants::DEFAULT_BACKTRACE_SIGNAL,
            thread_wait_time: constants::DEFAULT_THREAD_WAIT,
            dump_all_threads: false,
            fallback_symbolizer: false,
            symbol_table: None,
            log_level: log::LevelFilter::Warn,
            signals,
        };
        anyhow::ensure!(
            !config
                .signals
                .contains(&config.default_backtrace_signal),
            "Backtrace-request signal collides with an intercepted fatal signal"
        );
        Ok(config)
    }

    /// Sets the path destination. The report is appended to the file at
    /// crash time, creating it with mode 0644 when it does not exist.
    pub fn set_output_filename(&mut self, filename: impl Into<String>) -> anyhow::Result<()> {
        let filename = filename.into();
        let cstr = CString::new(filename.as_str())
            .map_err(|_| anyhow::anyhow!("Output filename contains a NUL byte"))?;
        self.output_filename = Some(filename);
        self.output_path_cstr = Some(cstr);
        Ok(())
    }

    /// Sets the stream destination. The stream is flushed after every line
    /// so a partial report survives even if the process dies mid-write.
    ///
    /// Writing a buffered stream from a signal handler is not
    /// async-signal safe; configuring one is an explicit opt-in risk.
    pub fn set_output_stream(&mut self, stream: Box<dyn Write + Send>) {
        self.output_stream = Some(stream);
    }

    /// Sets the raw-descriptor destination, written with plain `write(2)`.
    pub fn set_output_fd(&mut self, fd: RawFd) {
        self.output_fd = Some(fd);
    }

    pub fn set_max_stack_depth(&mut self, depth: usize) -> anyhow::Result<()> {
        anyhow::ensure!(depth > 0, "Stack depth must be at least one frame");
        self.max_stack_depth = depth;
        Ok(())
    }

    /// Sets the signal delivered to registered threads to request their
    /// backtrace. Threads may override it per registration.
    pub fn set_default_backtrace_signal(&mut self, signum: i32) -> anyhow::Result<()> {
        Signal::try_from(signum)
            .map_err(|e| anyhow::anyhow!("Invalid signal number {signum}: {e}"))?;
        anyhow::ensure!(
            !self.signals.contains(&signum),
            "Backtrace-request signal collides with an intercepted fatal signal"
        );
        self.default_backtrace_signal = signum;
        Ok(())
    }

    /// Sets how long the crash handler waits for each registered thread to
    /// produce its backtrace. The wait is polled in whole seconds.
    pub fn set_thread_wait_time(&mut self, wait: Duration) -> anyhow::Result<()> {
        anyhow::ensure!(
            wait.as_secs() >= 1,
            "Thread wait time must be at least one second"
        );
        self.thread_wait_time = wait;
        Ok(())
    }

    pub fn set_dump_all_threads(&mut self, dump_all_threads: bool) {
        self.dump_all_threads = dump_all_threads;
    }

    /// Enables the self-contained symbolizer used when no symbol table was
    /// supplied. It resolves names eagerly at capture time and allocates,
    /// which is not async-signal safe; some deployments accept the risk for
    /// richer output.
    pub fn set_fallback_symbolizer(&mut self, fallback_symbolizer: bool) {
        self.fallback_symbolizer = fallback_symbolizer;
    }

    /// Supplies a pre-sorted symbol table. Frames are resolved against it
    /// lazily at emit time, which keeps the capture path allocation-free.
    pub fn set_symbol_table(&mut self, table: SymbolTable) {
        self.symbol_table = Some(table);
    }

    /// Caps the verbosity of this crate's own diagnostics on the `log`
    /// facade. Nothing on the crash path logs through the facade.
    pub fn set_log_level(&mut self, level: log::LevelFilter) {
        self.log_level = level;
    }

    pub fn output_filename(&self) -> Option<&str> {
        self.output_filename.as_deref()
    }

    pub(crate) fn output_path_cstr(&self) -> Option<&CString> {
        self.output_path_cstr.as_ref()
    }

    pub fn output_fd(&self) -> Option<RawFd> {
        self.output_fd
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    pub fn default_backtrace_signal(&self) -> i32 {
        self.default_backtrace_signal
    }

    pub fn thread_wait_time(&self) -> Duration {
        self.thread_wait_time
    }

    pub fn dump_all_threads(&self) -> bool {
        self.dump_all_threads
    }

    pub fn fallback_symbolizer(&self) -> bool {
        self.fallback_symbolizer
    }

    pub fn symbol_table(&self) -> Option<&SymbolTable> {
        self.symbol_table.as_ref()
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    /// Moves the stream destination out of the configuration; called once
    /// by `init` so the handler can write it through a stable cell.
    pub(crate) fn take_output_stream(&mut self) -> Option<Box<dyn Write + Send>> {
        self.output_stream.take()
    }

    /// Whether a diagnostic at `level` passes this configuration's cap.
    pub(crate) fn verbosity_allows(&self, level: log::Level) -> bool {
        level <= self.log_level
    }
}

impl fmt::Debug for CrashtraceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashtraceConfiguration")
            .field("output_filename", &self.output_filename)
            .field("output_stream", &self.output_stream.is_some())
            .field("output_fd", &self.output_fd)
            .field("max_stack_depth", &self.max_stack_depth)
            .field("default_backtrace_signal", &self.default_backtrace_signal)
            .field("thread_wait_time", &self.thread_wait_time)
            .field("dump_all_threads", &self.dump_all_threads)
            .field("fallback_symbolizer", &self.fallback_symbolizer)
            .field(
                "symbol_table",
                &self.symbol_table.as_ref().map(|t| t.len()),
            )
            .field("log_level", &self.log_level)
            .field("signals", &self.signals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_signal_list_gets_defaults() -> anyhow::Result<()> {
        let config = CrashtraceConfiguration::new(vec![])?;
        assert_eq!(config.signals(), constants::default_signals());
        assert_eq!(config.max_stack_depth(), constants::DEFAULT_STACK_DEPTH);
        assert_eq!(
            config.default_backtrace_signal(),
            constants::DEFAULT_BACKTRACE_SIGNAL
        );
        assert_eq!(config.thread_wait_time(), constants::DEFAULT_THREAD_WAIT);
        assert!(!config.dump_all_threads());
        Ok(())
    }

    #[test]
    fn test_duplicate_signals_rejected() {
        let err = CrashtraceConfiguration::new(vec![libc::SIGSEGV, libc::SIGSEGV]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_invalid_signal_rejected() {
        assert!(CrashtraceConfiguration::new(vec![9999]).is_err());
    }

    #[test]
    fn test_backtrace_signal_collision_rejected() {
        let err = CrashtraceConfiguration::new(vec![libc::SIGUSR1]).unwrap_err();
        assert!(err.to_string().contains("collides"));

        let mut config = CrashtraceConfiguration::new(vec![libc::SIGSEGV]).unwrap();
        assert!(config.set_default_backtrace_signal(libc::SIGSEGV).is_err());
        assert!(config.set_default_backtrace_signal(libc::SIGUSR2).is_ok());
        assert_eq!(config.default_backtrace_signal(), libc::SIGUSR2);
    }

    #[test]
    fn test_filename_with_nul_rejected() {
        let mut config = CrashtraceConfiguration::new(vec![]).unwrap();
        assert!(config.set_output_filename("bad\0name").is_err());
        assert!(config.set_output_filename("/tmp/report.txt").is_ok());
        assert_eq!(config.output_filename(), Some("/tmp/report.txt"));
        assert!(config.output_path_cstr().is_some());
    }

    #[test]
    fn test_zero_depth_and_zero_wait_rejected() {
        let mut config = CrashtraceConfiguration::new(vec![]).unwrap();
        assert!(config.set_max_stack_depth(0).is_err());
        assert!(config
            .set_thread_wait_time(Duration::from_millis(250))
            .is_err());
        assert!(config.set_max_stack_depth(32).is_ok());
        assert!(config.set_thread_wait_time(Duration::from_secs(2)).is_ok());
    }
}
