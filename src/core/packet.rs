//! # Frame
//!
//! Wire representation of one protocol message.
//!
//! ```text
//! [TotalLength(4, u32 LE)] [TypeId(4, i32 LE)] [Body(TotalLength - 8)]
//! ```
//!
//! `TotalLength` counts the header itself, so the smallest valid frame is the
//! bare 8-byte header with an empty body. The body is opaque at this layer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// One complete frame: message type identifier plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_id: i32,
    pub body: Bytes,
}

impl Frame {
    pub fn new(type_id: i32, body: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            body: body.into(),
        }
    }

    /// Value of the `TotalLength` header field for this frame.
    #[inline]
    pub fn total_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Serialize to a contiguous byte vector (header + body).
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.type_id, &self.body)
    }

    /// Append the encoded frame to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.total_len());
        dst.put_u32_le(self.total_len() as u32);
        dst.put_i32_le(self.type_id);
        dst.extend_from_slice(&self.body);
    }

    /// Decode exactly one frame from `bytes`.
    ///
    /// Fails if the header is truncated, declares a length below the header size,
    /// or if fewer than `TotalLength` bytes are present.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (total_len, type_id) = decode_header(bytes)?;
        if (total_len as usize) < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort(total_len));
        }
        let total_len = total_len as usize;
        if bytes.len() < total_len {
            return Err(ProtocolError::FrameHeaderTooShort(bytes.len()));
        }
        Ok(Self {
            type_id,
            body: Bytes::copy_from_slice(&bytes[HEADER_SIZE..total_len]),
        })
    }
}

/// Encode `type_id` and `body` into a single frame.
pub fn encode(type_id: i32, body: &[u8]) -> Vec<u8> {
    let total = HEADER_SIZE + body.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&type_id.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Decode the `(total_len, type_id)` header from the first 8 bytes of `bytes`.
///
/// Only the header is inspected; validating `total_len` is up to the caller.
#[inline]
pub fn decode_header(bytes: &[u8]) -> Result<(u32, i32)> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::FrameHeaderTooShort(bytes.len()));
    }
    let total_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let type_id = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((total_len, type_id))
}
