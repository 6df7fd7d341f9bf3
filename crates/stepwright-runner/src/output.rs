//! Bounded combined-output capture for a running step
//!
//! A step's children write stdout and stderr into one shared [`OutputBuffer`]
//! instead of the terminal, so the progress spinner is never interleaved with
//! command noise. The supervisor drains the buffer into the durable log once
//! the step has ended.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Ring {
    buffer: VecDeque<u8>,
    max_bytes: usize,
    total_bytes_written: usize,
}

/// Shared, fixed-capacity ring buffer of a step's combined output.
///
/// Cloning yields another handle to the same buffer. When more than
/// `max_bytes` have been written the oldest bytes are dropped.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Ring>>,
}

impl OutputBuffer {
    /// Create a buffer holding at most `max_bytes`
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Ring {
                buffer: VecDeque::with_capacity(max_bytes.min(8192)),
                max_bytes,
                total_bytes_written: 0,
            })),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append raw bytes, evicting from the front when full
    pub fn write(&self, data: &[u8]) {
        let mut ring = self.ring();
        ring.total_bytes_written += data.len();
        if ring.max_bytes == 0 {
            return;
        }
        // Only the tail of an oversized write can survive.
        let tail = &data[data.len().saturating_sub(ring.max_bytes)..];
        let overflow = (ring.buffer.len() + tail.len()).saturating_sub(ring.max_bytes);
        ring.buffer.drain(..overflow);
        ring.buffer.extend(tail);
    }

    /// Append one line, adding the trailing newline
    pub fn write_line(&self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(&bytes);
    }

    /// Current size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring().buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring().buffer.is_empty()
    }

    /// Total bytes ever written, including evicted ones
    #[must_use]
    pub fn total_bytes_written(&self) -> usize {
        self.ring().total_bytes_written
    }

    /// Whether anything was evicted since the last [`take`](Self::take)
    #[must_use]
    pub fn was_truncated(&self) -> bool {
        let ring = self.ring();
        ring.total_bytes_written > ring.buffer.len()
    }

    /// Drain the buffer into a string and reset the counters.
    ///
    /// If bytes were evicted, the partial first line is dropped and a marker
    /// line records how much was lost.
    pub fn take(&self) -> String {
        let mut ring = self.ring();
        let bytes: Vec<u8> = ring.buffer.drain(..).collect();
        let dropped = ring.total_bytes_written - bytes.len();
        ring.total_bytes_written = 0;
        drop(ring);

        let text = String::from_utf8_lossy(&bytes).into_owned();
        if dropped == 0 {
            return text;
        }
        let rest = match text.find('\n') {
            Some(idx) => &text[idx + 1..],
            None => "",
        };
        format!("[output truncated: {dropped} earlier bytes dropped]\n{rest}")
    }
}
