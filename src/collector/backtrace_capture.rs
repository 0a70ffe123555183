// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The global backtrace snapshot.
//!
//! A single buffer of raw return addresses (plus optional fixed-capacity
//! name slots) shared by every capture in the process. It is allocated once
//! at initialization and overwritten on each capture, whether the capture
//! runs on the crashing thread or on a thread answering a backtrace
//! request. Only one capture is ever active at a time: the crash handler
//! serializes cross-thread requests and polls each to completion before
//! issuing the next, so the buffer has exactly one writer at any moment
//! without a lock.

use crate::shared::constants::MAX_FRAME_NAME_LEN;
use std::fmt::{self, Write};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;

static SNAPSHOT: AtomicPtr<BacktraceSnapshot> = AtomicPtr::new(ptr::null_mut());

/// Fixed-capacity UTF-8 buffer for one eagerly-resolved frame name.
/// Writes that do not fit are truncated at a character boundary rather
/// than rejected; a partial symbol name still beats a raw address.
#[derive(Clone, Copy)]
pub(crate) struct FrameName {
    bytes: [u8; MAX_FRAME_NAME_LEN],
    len: usize,
}

impl FrameName {
    fn new() -> Self {
        Self {
            bytes: [0; MAX_FRAME_NAME_LEN],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        if self.len == 0 {
            return None;
        }
        std::str::from_utf8(&self.bytes[..self.len]).ok()
    }
}

impl Write for FrameName {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = MAX_FRAME_NAME_LEN - self.len;
        let mut take = s.len().min(remaining);
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// The shared snapshot: raw frame addresses, a count of valid entries, and
/// (when the fallback symbolizer is enabled) one name slot per frame.
pub(crate) struct BacktraceSnapshot {
    frames: Box<[usize]>,
    names: Option<Box<[FrameName]>>,
    len: usize,
}

impl BacktraceSnapshot {
    pub(crate) fn new(capacity: usize, with_names: bool) -> Self {
        Self {
            frames: vec![0usize; capacity].into_boxed_slice(),
            names: with_names.then(|| vec![FrameName::new(); capacity].into_boxed_slice()),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn frame(&self, index: usize) -> usize {
        self.frames[index]
    }

    pub(crate) fn name(&self, index: usize) -> Option<&str> {
        self.names
            .as_ref()
            .and_then(|names| names.get(index))
            .and_then(FrameName::as_str)
    }

    /// Walks the current thread's stack into this snapshot, overwriting the
    /// previous capture.
    ///
    /// With `resolve_names` set, each frame is additionally resolved to a
    /// symbolic name through the platform symbolizer. Resolution performs
    /// dynamic allocation and is NOT async-signal safe; it is only reached
    /// when the deployment opted into the fallback symbolizer.
    ///
    /// SAFETY:
    ///     The caller must guarantee exclusive access to the snapshot for
    ///     the duration of the call (the coordinator's serialized
    ///     request/poll protocol provides this during crash handling).
    pub(crate) unsafe fn capture_local(&mut self, resolve_names: bool) {
        let capacity = self.frames.len();
        let mut count = 0usize;
        backtrace::trace_unsynchronized(|frame| {
            if count >= capacity {
                return false;
            }
            self.frames[count] = frame.ip() as usize;
            count += 1;
            true
        });
        self.len = count;

        if let Some(names) = self.names.as_mut() {
            for slot in names.iter_mut().take(count) {
                slot.clear();
            }
            if resolve_names {
                for index in 0..count {
                    let address = self.frames[index];
                    let mut resolved = false;
                    backtrace::resolve_unsynchronized(
                        address as *mut libc::c_void,
                        |symbol| {
                            // The callback fires once per inlined frame;
                            // keep the first name only.
                            if resolved {
                                return;
                            }
                            if let Some(name) = symbol.name() {
                                let _ = write!(&mut names[index], "{name}");
                                resolved = true;
                            }
                        },
                    );
                }
            }
        }
    }
}

/// Publishes the process-wide snapshot buffer. Called once by `init`; a
/// leftover buffer from a previous init/shutdown cycle is dropped here, in
/// normal (non-signal) context.
pub(crate) fn install_snapshot(snapshot: BacktraceSnapshot) {
    let old = SNAPSHOT.swap(Box::into_raw(Box::new(snapshot)), SeqCst);
    if !old.is_null() {
        // Safety: the only non-null values stored here come from
        // Box::into_raw above.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Retires the snapshot at shutdown. If threads are still registered their
/// request handlers may yet dereference the buffer, so in that case it is
/// leaked instead of freed; the leak lasts until process exit.
pub(crate) fn clear_snapshot() {
    let old = SNAPSHOT.swap(ptr::null_mut(), SeqCst);
    if old.is_null() {
        return;
    }
    if super::thread_registry::is_empty() {
        // Safety: the only non-null values stored here come from
        // Box::into_raw in install_snapshot.
        unsafe { drop(Box::from_raw(old)) };
    }
}

/// Mutable access to the shared snapshot from a signal handler.
///
/// SAFETY:
///     The returned reference aliases a process-wide buffer. The caller
///     must be the sole writer, which the coordinator's serialized
///     request/poll protocol guarantees during crash handling.
pub(crate) unsafe fn snapshot_mut() -> Option<&'static mut BacktraceSnapshot> {
    let ptr = SNAPSHOT.load(SeqCst);
    if ptr.is_null() {
        None
    } else {
        Some(&mut *ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_fills_frames() {
        let mut snapshot = BacktraceSnapshot::new(32, false);
        unsafe { snapshot.capture_local(false) };
        assert!(snapshot.len() > 0);
        assert!(snapshot.len() <= 32);
        // The top frames are real code addresses.
        assert_ne!(snapshot.frame(0), 0);
        assert!(snapshot.name(0).is_none());
    }

    #[test]
    fn test_capture_respects_capacity() {
        let mut snapshot = BacktraceSnapshot::new(2, false);
        unsafe { snapshot.capture_local(false) };
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_capture_overwrites_previous() {
        let mut snapshot = BacktraceSnapshot::new(32, false);
        unsafe { snapshot.capture_local(false) };
        let first_len = snapshot.len();
        unsafe { snapshot.capture_local(false) };
        assert!(snapshot.len() > 0);
        // Same call site, so the walk depth is stable.
        assert_eq!(snapshot.len(), first_len);
    }

    #[test]
    fn test_frame_name_truncates_at_char_boundary() {
        let mut name = FrameName::new();
        let long = "é".repeat(MAX_FRAME_NAME_LEN); // 2 bytes per char
        let _ = write!(&mut name, "{long}");
        let s = name.as_str().expect("valid UTF-8 after truncation");
        assert!(s.len() <= MAX_FRAME_NAME_LEN);
        assert!(s.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_frame_name_empty_is_none() {
        let name = FrameName::new();
        assert!(name.as_str().is_none());
    }

    #[test]
    fn test_capture_with_fallback_names() {
        let mut snapshot = BacktraceSnapshot::new(16, true);
        unsafe { snapshot.capture_local(true) };
        assert!(snapshot.len() > 0);
        // Symbol availability depends on the build, so only require that
        // any resolved name is well-formed.
        for index in 0..snapshot.len() {
            if let Some(name) = snapshot.name(index) {
                assert!(!name.is_empty());
            }
        }
    }
}
