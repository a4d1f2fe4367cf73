//! Per-connection accumulator that turns arbitrary read chunks into records.
//!
//! Bytes arrive in whatever pieces the socket hands out: one read may carry
//! several records, or a record may take several reads. Complete records are
//! extracted in arrival order; a trailing partial record stays buffered until
//! the rest of it shows up.

use bytes::BytesMut;

use crate::error::{FcgiError, Result};
use crate::record::{try_extract_frame, Record};

/// Default cap on buffered, not yet extracted input.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    limit: usize,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERED_BYTES)
    }
}

impl FrameReassembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            limit,
        }
    }

    /// Append freshly read bytes.
    ///
    /// Fails with [`FcgiError::FrameTooLarge`] once the unprocessed backlog
    /// would exceed the cap; the connection must be dropped at that point.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        let buffered = self.buffer.len().saturating_add(data.len());
        if buffered > self.limit {
            return Err(FcgiError::FrameTooLarge {
                buffered,
                limit: self.limit,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Extract the next complete record, or `Ok(None)` if more bytes are needed.
    pub fn poll_frame(&mut self) -> Result<Option<Record>> {
        try_extract_frame(&mut self.buffer)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop everything buffered and release the allocation.
    pub fn clear(&mut self) {
        self.buffer = BytesMut::new();
    }
}
