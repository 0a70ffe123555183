// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The output multiplexer: formats one line into a fixed buffer, then fans
//! it out to every configured destination.
//!
//! Everything here runs inside the crash handler, so the only operations
//! permitted on the default path are async-signal safe:
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//! - open
//! - write
//! - close
//! - fsync / sync
//!
//! Formatting goes through `core::fmt` into a stack buffer and performs no
//! allocation. The one exception to signal safety is the caller-owned
//! buffered stream destination, which is an explicit opt-in risk
//! (see `CrashtraceConfiguration::set_output_stream`).

use crate::shared::configuration::CrashtraceConfiguration;
use crate::shared::constants::{MAX_LINE_LEN, REPORT_FILE_MODE};
use nix::errno::Errno;
use std::ffi::CStr;
use std::fmt::{self, Write as _};
use std::io::Write;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Per-destination failure record for one emitted line. Failures are
/// accumulated independently: a failing destination never prevents the
/// line from being attempted on the others.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "line overflow: {overflow}, path destination: {path:?}, \
     stream destination: {stream}, fd destination: {fd:?}"
)]
pub struct EmitFailures {
    /// The formatted line exceeded the fixed line buffer; nothing was
    /// written anywhere.
    pub overflow: bool,
    /// Writing the opened report file failed.
    pub path: Option<Errno>,
    /// Writing or flushing the caller-owned stream failed.
    pub stream: bool,
    /// Writing the caller-owned raw descriptor failed.
    pub fd: Option<Errno>,
}

impl EmitFailures {
    fn any(&self) -> bool {
        self.overflow || self.path.is_some() || self.stream || self.fd.is_some()
    }
}

/// Fixed-size line buffer. Unlike frame names, a line that does not fit is
/// a hard failure: no truncated report lines, no partial writes.
struct LineBuf {
    bytes: [u8; MAX_LINE_LEN],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        Self {
            bytes: [0; MAX_LINE_LEN],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if s.len() > MAX_LINE_LEN - self.len {
            return Err(fmt::Error);
        }
        self.bytes[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
        self.len += s.len();
        Ok(())
    }
}

/// The set of destinations open for the duration of one crash report.
pub(crate) struct OutputSinks<'a> {
    /// Descriptor for the path destination, opened by [`OutputSinks::open`].
    /// -1 when no path is configured or the open failed.
    path_fd: RawFd,
    stream: Option<&'a mut (dyn Write + Send)>,
    /// Caller-owned raw descriptor; -1 when absent.
    raw_fd: RawFd,
}

impl<'a> OutputSinks<'a> {
    /// Opens the destinations named by the configuration. The path
    /// destination is opened for append, falling back to create with mode
    /// 0644; an open failure simply disables that destination for this
    /// report (the other sinks still receive every line).
    pub(crate) fn open(
        config: &CrashtraceConfiguration,
        stream: Option<&'a mut (dyn Write + Send)>,
    ) -> Self {
        let path_fd = config
            .output_path_cstr()
            .map_or(-1, |path| open_append_or_create(path));
        Self {
            path_fd,
            stream,
            raw_fd: config.output_fd().unwrap_or(-1),
        }
    }

    /// Formats one line and writes it to every destination, retrying
    /// partial writes until each destination has the whole line or fails
    /// unrecoverably. Returns the line length, or the accumulated
    /// per-destination failures.
    pub(crate) fn emit_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, EmitFailures> {
        let mut line = LineBuf::new();
        if line.write_fmt(args).is_err() {
            return Err(EmitFailures {
                overflow: true,
                ..Default::default()
            });
        }

        let mut failures = EmitFailures::default();
        let bytes = line.as_bytes();

        if self.path_fd >= 0 {
            if let Err(errno) = blocking_write(self.path_fd, bytes) {
                failures.path = Some(errno);
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            if stream.write_all(bytes).is_err() {
                failures.stream = true;
            }
            // Flush every line so a partial report survives a dying process.
            if stream.flush().is_err() {
                failures.stream = true;
            }
        }
        if self.raw_fd >= 0 {
            if let Err(errno) = blocking_write(self.raw_fd, bytes) {
                failures.fd = Some(errno);
            }
        }

        if failures.any() {
            Err(failures)
        } else {
            Ok(bytes.len())
        }
    }

    /// Closes the descriptor-backed destinations, flushes the stream, and
    /// forces a filesystem sync so the report survives an unstable machine.
    pub(crate) fn finish(self) {
        if self.path_fd >= 0 {
            // Safety: closing a descriptor this struct opened (or was given
            // ownership of for the duration of the report).
            let _ = unsafe { libc::close(self.path_fd) };
        }
        if let Some(stream) = self.stream {
            let _ = stream.flush();
        }
        if self.raw_fd >= 0 {
            // Safety: the caller handed this descriptor over for the crash
            // report; the process is about to terminate.
            let _ = unsafe { libc::close(self.raw_fd) };
        }
        // Safety: sync has no preconditions.
        unsafe { libc::sync() };
    }
}

/// `open(2)` for append, else create with fixed permissions. Returns -1 on
/// failure; the report proceeds on the remaining destinations.
fn open_append_or_create(path: &CStr) -> RawFd {
    // Safety: the path is a valid NUL-terminated string prepared at init.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_APPEND) };
    if fd >= 0 {
        return fd;
    }
    // Safety: as above; the mode argument is required by O_CREAT.
    unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_RDWR | libc::O_CREAT,
            REPORT_FILE_MODE as libc::c_uint,
        )
    }
}

/// Writes the whole buffer, looping over partial writes and EINTR.
fn blocking_write(fd: RawFd, mut bytes: &[u8]) -> Result<(), Errno> {
    while !bytes.is_empty() {
        // Safety: fd is a destination descriptor and the buffer is valid
        // for its length.
        let written =
            unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if written < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        if written == 0 {
            return Err(Errno::EIO);
        }
        bytes = &bytes[written as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::fs;
    use std::io::Read;
    use std::os::unix::io::IntoRawFd;

    #[test]
    fn test_oversized_line_rejected_with_no_partial_write() {
        let mut captured: Vec<u8> = Vec::new();
        let mut sinks = OutputSinks {
            path_fd: -1,
            stream: Some(&mut captured),
            raw_fd: -1,
        };
        let oversized = "x".repeat(MAX_LINE_LEN + 1);
        let err = sinks
            .emit_fmt(format_args!("{oversized}"))
            .unwrap_err();
        assert!(err.overflow);
        assert!(!err.stream);
        drop(sinks);
        assert!(captured.is_empty(), "no partial bytes may reach a sink");
    }

    #[test]
    fn test_line_exactly_at_capacity_is_accepted() {
        let mut captured: Vec<u8> = Vec::new();
        let mut sinks = OutputSinks {
            path_fd: -1,
            stream: Some(&mut captured),
            raw_fd: -1,
        };
        let full = "y".repeat(MAX_LINE_LEN);
        assert_eq!(sinks.emit_fmt(format_args!("{full}")), Ok(MAX_LINE_LEN));
        drop(sinks);
        assert_eq!(captured.len(), MAX_LINE_LEN);
    }

    #[test]
    fn test_all_destinations_receive_the_same_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let path_cstr = CString::new(path.to_str().unwrap()).unwrap();
        let path_fd = open_append_or_create(&path_cstr);
        assert!(path_fd >= 0);

        let fd_file = tempfile::NamedTempFile::new().unwrap();
        let fd_path = fd_file.path().to_owned();
        let raw_fd = fd_file.reopen().unwrap().into_raw_fd();

        let mut captured: Vec<u8> = Vec::new();
        let mut sinks = OutputSinks {
            path_fd,
            stream: Some(&mut captured),
            raw_fd,
        };
        sinks
            .emit_fmt(format_args!("*  Got a crash! signo={}\n", 11))
            .unwrap();
        sinks.finish();

        let expected = "*  Got a crash! signo=11\n";
        assert_eq!(fs::read_to_string(&path).unwrap(), expected);
        assert_eq!(String::from_utf8(captured).unwrap(), expected);
        let mut via_fd = String::new();
        fs::File::open(&fd_path)
            .unwrap()
            .read_to_string(&mut via_fd)
            .unwrap();
        assert_eq!(via_fd, expected);
    }

    #[test]
    fn test_destination_failures_are_isolated() {
        // A read-only descriptor fails to write; the stream must still get
        // the line, and the failure must be attributed to the fd class.
        let fd_file = tempfile::NamedTempFile::new().unwrap();
        let read_only = fs::File::open(fd_file.path()).unwrap().into_raw_fd();

        let mut captured: Vec<u8> = Vec::new();
        let mut sinks = OutputSinks {
            path_fd: -1,
            stream: Some(&mut captured),
            raw_fd: read_only,
        };
        let err = sinks.emit_fmt(format_args!("hello\n")).unwrap_err();
        assert!(err.fd.is_some());
        assert!(!err.stream);
        assert!(!err.overflow);
        drop(sinks);
        assert_eq!(String::from_utf8(captured).unwrap(), "hello\n");
        let _ = unsafe { libc::close(read_only) };
    }

    #[test]
    fn test_open_append_or_create_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.txt");
        let cstr = CString::new(path.to_str().unwrap()).unwrap();
        let fd = open_append_or_create(&cstr);
        assert!(fd >= 0);
        blocking_write(fd, b"first\n").unwrap();
        let _ = unsafe { libc::close(fd) };

        // Reopening appends rather than truncating.
        let fd = open_append_or_create(&cstr);
        assert!(fd >= 0);
        blocking_write(fd, b"second\n").unwrap();
        let _ = unsafe { libc::close(fd) };
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
