use bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::core::packet::Frame;
use crate::error::{ProtocolError, Result};

/// Outbound framing for `FramedWrite`.
///
/// Inbound bytes go through [`Reassembler`](crate::core::reassembler::Reassembler)
/// instead, which owns the growable receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::config::MAX_FRAME_SIZE)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let total = item.total_len();
        if total > self.max_frame_size || total > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                length: total.min(u32::MAX as usize) as u32,
                max: self.max_frame_size,
            });
        }
        item.write_to(dst);
        Ok(())
    }
}
