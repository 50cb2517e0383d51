//! Receive-side frame reassembly.
//!
//! A [`Reassembler`] owns one connection's receive buffer. Transport reads land in
//! the spare tail of the buffer (or are copied in with [`Reassembler::push`]); the
//! [`Frames`] iterator then walks the complete frames at the front and, when it is
//! dropped, shifts the trailing partial frame (if any) back to offset 0.
//!
//! Frame boundaries never depend on how the transport chunks the stream: N frames
//! delivered in one read or spread over M reads come out identical and in order.
//!
//! # Example
//!
//! ```
//! use framelink::core::packet::encode;
//! use framelink::core::reassembler::{FrameLimits, Reassembler};
//!
//! let mut reassembler = Reassembler::new(FrameLimits::default());
//! let bytes = encode(7, b"hello");
//!
//! reassembler.push(&bytes[..5]).unwrap();
//! assert_eq!(reassembler.frames().count(), 0);
//!
//! reassembler.push(&bytes[5..]).unwrap();
//! let frame = reassembler.frames().next().unwrap().unwrap();
//! assert_eq!(frame.type_id, 7);
//! assert_eq!(&frame.body[..], b"hello");
//! ```

use std::borrow::BorrowMut;
use std::iter::FusedIterator;

use bytes::Bytes;
use tracing::trace;

use super::packet::{decode_header, Frame, HEADER_SIZE};
use crate::config::{TransportConfig, INITIAL_BUFFER_SIZE, MAX_BUFFER_SIZE, MAX_FRAME_SIZE};
use crate::error::{ProtocolError, Result};

/// Size limits applied by a [`Reassembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Capacity of a freshly created receive buffer.
    pub initial_buffer_size: usize,
    /// Largest `TotalLength` accepted from the peer.
    pub max_frame_size: usize,
    /// Hard ceiling the receive buffer may grow to.
    pub max_buffer_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            initial_buffer_size: INITIAL_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
        }
    }
}

impl From<&TransportConfig> for FrameLimits {
    fn from(config: &TransportConfig) -> Self {
        Self {
            initial_buffer_size: config.initial_buffer_size,
            max_frame_size: config.max_frame_size,
            max_buffer_size: config.max_buffer_size,
        }
    }
}

/// Growable receive buffer plus the cursor separating buffered bytes from free space.
///
/// The storage is any `BorrowMut<Vec<u8>>`, so a plain `Vec<u8>` and a slab checked
/// out of the [`BufferArena`](crate::utils::buffer_pool::BufferArena) both work.
/// The vector's length is kept equal to the logical capacity; `data_len` marks how
/// much of it holds received, not yet consumed bytes.
#[derive(Debug)]
pub struct Reassembler<B = Vec<u8>> {
    buf: B,
    data_len: usize,
    limits: FrameLimits,
}

impl Reassembler<Vec<u8>> {
    /// Create a reassembler with a freshly allocated buffer of `initial_buffer_size`.
    pub fn new(limits: FrameLimits) -> Self {
        Self::with_buffer(Vec::with_capacity(limits.initial_buffer_size), limits)
    }
}

impl<B: BorrowMut<Vec<u8>>> Reassembler<B> {
    /// Wrap existing storage. Previous contents are discarded.
    pub fn with_buffer(mut buf: B, limits: FrameLimits) -> Self {
        let storage: &mut Vec<u8> = buf.borrow_mut();
        let capacity = storage
            .capacity()
            .max(limits.initial_buffer_size)
            .min(limits.max_buffer_size);
        storage.clear();
        storage.resize(capacity, 0);
        Self {
            buf,
            data_len: 0,
            limits,
        }
    }

    fn storage(&self) -> &Vec<u8> {
        self.buf.borrow()
    }

    fn storage_mut(&mut self) -> &mut Vec<u8> {
        self.buf.borrow_mut()
    }

    /// Current logical capacity of the receive buffer.
    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Number of buffered bytes not yet consumed as frames.
    pub fn len(&self) -> usize {
        self.data_len
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    /// Make room for `incoming` more bytes, doubling capacity as needed.
    ///
    /// Fails with [`ProtocolError::BufferOverflow`] when the buffered data plus
    /// `incoming` cannot fit within `max_buffer_size`.
    pub fn reserve(&mut self, incoming: usize) -> Result<()> {
        let required = self.data_len + incoming;
        let capacity = self.capacity();
        if required <= capacity {
            return Ok(());
        }
        let max = self.limits.max_buffer_size;
        if required > max {
            return Err(ProtocolError::BufferOverflow { required, max });
        }
        let grown = capacity.saturating_mul(2).max(required).max(HEADER_SIZE).min(max);
        trace!(from = capacity, to = grown, "Growing receive buffer");
        self.storage_mut().resize(grown, 0);
        Ok(())
    }

    /// Copy a received chunk into the buffer.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.reserve(chunk.len())?;
        let start = self.data_len;
        self.storage_mut()[start..start + chunk.len()].copy_from_slice(chunk);
        self.data_len += chunk.len();
        Ok(())
    }

    /// Free tail of the buffer for the next transport read.
    ///
    /// Grows the buffer first if it is completely full, so the returned slice is
    /// never empty on success.
    pub fn spare_mut(&mut self) -> Result<&mut [u8]> {
        if self.data_len == self.capacity() {
            self.reserve(1)?;
        }
        let start = self.data_len;
        Ok(&mut self.storage_mut()[start..])
    }

    /// Record that `n` bytes were written into [`spare_mut`](Self::spare_mut).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.data_len + n <= self.capacity());
        self.data_len = (self.data_len + n).min(self.capacity());
    }

    /// Lazily yield every complete frame currently buffered.
    ///
    /// The first framing error is yielded as `Some(Err(_))` and ends the
    /// iteration. Dropping the iterator compacts the buffer.
    pub fn frames(&mut self) -> Frames<'_, B> {
        Frames {
            inner: self,
            consumed: 0,
            failed: false,
        }
    }

    /// Push a chunk and collect the frames it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.push(chunk)?;
        self.frames().collect()
    }

    /// Drop all buffered bytes, keeping the current capacity.
    pub fn clear(&mut self) {
        self.data_len = 0;
    }

    /// Release the underlying storage.
    pub fn into_buffer(self) -> B {
        self.buf
    }
}

/// Iterator over complete frames; see [`Reassembler::frames`].
pub struct Frames<'a, B: BorrowMut<Vec<u8>>> {
    inner: &'a mut Reassembler<B>,
    consumed: usize,
    failed: bool,
}

impl<B: BorrowMut<Vec<u8>>> Frames<'_, B> {
    fn fail(&mut self, err: ProtocolError) -> Option<Result<Frame>> {
        self.failed = true;
        Some(Err(err))
    }
}

impl<B: BorrowMut<Vec<u8>>> Iterator for Frames<'_, B> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let available = self.inner.data_len - self.consumed;
        if available < HEADER_SIZE {
            return None;
        }

        let start = self.consumed;
        let header = decode_header(&self.inner.storage()[start..start + HEADER_SIZE]);
        let (total_len, type_id) = match header {
            Ok(header) => header,
            Err(e) => return self.fail(e),
        };
        if (total_len as usize) < HEADER_SIZE {
            return self.fail(ProtocolError::FrameTooShort(total_len));
        }
        if total_len as usize > self.inner.limits.max_frame_size {
            return self.fail(ProtocolError::FrameTooLarge {
                length: total_len,
                max: self.inner.limits.max_frame_size,
            });
        }

        let total_len = total_len as usize;
        if available < total_len {
            return None;
        }

        let body = Bytes::copy_from_slice(&self.inner.storage()[start + HEADER_SIZE..start + total_len]);
        self.consumed += total_len;
        Some(Ok(Frame { type_id, body }))
    }
}

impl<B: BorrowMut<Vec<u8>>> FusedIterator for Frames<'_, B> {}

impl<B: BorrowMut<Vec<u8>>> Drop for Frames<'_, B> {
    fn drop(&mut self) {
        if self.consumed == 0 {
            return;
        }
        let end = self.inner.data_len;
        let consumed = self.consumed;
        self.inner.storage_mut().copy_within(consumed..end, 0);
        self.inner.data_len = end - consumed;
    }
}
