//! Bounded receive buffer.
//!
//! Every socket owns exactly one receive buffer, allocated once at open time.
//! Occupancy never exceeds the configured capacity: segment ingestion is
//! rejected whole when the payload does not fit, and link reads are limited
//! to the free space.

use crate::error::SocketError;
use bytes::buf::Limit;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed-capacity FIFO byte buffer.
#[derive(Debug)]
pub struct RecvBuffer {
    data: BytesMut,
    capacity: usize,
}

impl RecvBuffer {
    /// Allocate a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Space left before the buffer is full.
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Append all of `bytes` or nothing.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), SocketError> {
        if bytes.len() > self.free() {
            return Err(SocketError::BufferFull {
                needed: bytes.len(),
                free: self.free(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Move up to `dst.len()` bytes out of the buffer. Returns bytes copied.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.data.len());
        self.data.copy_to_slice(&mut dst[..n]);
        n
    }

    /// Writable view limited to the free space, for filling from a link.
    pub(crate) fn writable(&mut self) -> Limit<&mut BytesMut> {
        let free = self.free();
        (&mut self.data).limit(free)
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}
