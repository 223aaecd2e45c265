//! Newline-delimited message framing
//!
//! Every message on the wire is one JSON document followed by a single `\n`.
//! Outbound frames are produced by [`encode_frame`]; inbound bytes are
//! accumulated in a [`LineBuffer`] that only yields complete lines.
//!
//! The buffer enforces two ceilings:
//! - a hard ceiling on buffered bytes; exceeding it discards the buffer and
//!   skips the rest of the offending line
//! - a smaller ceiling on a single message; longer lines are reported as
//!   [`Frame::Oversized`] and never parsed

use serde::Serialize;

// ============================================================================
// Constants
// ============================================================================

/// Size of the chunk read from the child's stdout per read call
pub const READ_CHUNK_SIZE: usize = 8192;

/// Default hard ceiling on buffered, not yet delimited bytes (16 MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default ceiling on a single message (4 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Message delimiter
pub const DELIMITER: u8 = b'\n';

// ============================================================================
// Limits
// ============================================================================

/// Size limits applied to the inbound stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_buffer_size: usize,
    pub max_message_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize a message and append the delimiter.
///
/// The returned buffer is written with a single `write_all` so a frame is
/// never interleaved with another writer's bytes.
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(DELIMITER);
    Ok(frame)
}

// ============================================================================
// Decoding
// ============================================================================

/// A complete inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One message, delimiter and trailing `\r` stripped
    Line(Vec<u8>),
    /// A line longer than the message ceiling; its bytes were dropped
    Oversized { len: usize },
}

/// Accumulates raw bytes and slices off complete lines.
///
/// Owned by exactly one reader; it has no interior locking.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    limits: FrameLimits,
    /// Bytes at the front of `buffer` already scanned for a delimiter
    scanned: usize,
    /// Set after an overflow until the rest of that line has been skipped
    discarding: bool,
}

impl LineBuffer {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            limits,
            scanned: 0,
            discarding: false,
        }
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete frame, if one has been fully buffered
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let offset = self.scanned;
            let Some(position) = self.buffer[offset..]
                .iter()
                .position(|byte| *byte == DELIMITER)
            else {
                if self.discarding {
                    self.buffer.clear();
                    self.scanned = 0;
                } else {
                    self.scanned = self.buffer.len();
                }
                return None;
            };

            let end = offset + position;
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.limits.max_message_size {
                return Some(Frame::Oversized { len: line.len() });
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(Frame::Line(line));
        }
    }

    /// Enforce the buffer ceiling.
    ///
    /// Call after draining frames. Returns the number of discarded bytes when
    /// the partial line exceeded the ceiling.
    pub fn enforce_limit(&mut self) -> Option<usize> {
        if self.buffer.len() <= self.limits.max_buffer_size {
            return None;
        }

        let discarded = self.buffer.len();
        self.buffer.clear();
        self.buffer.shrink_to(READ_CHUNK_SIZE);
        self.scanned = 0;
        self.discarding = true;
        Some(discarded)
    }

    /// Drop an undelimited tail, e.g. at end of stream. Returns its length.
    pub fn discard_partial(&mut self) -> usize {
        let len = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
        len
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(FrameLimits::default())
    }
}
