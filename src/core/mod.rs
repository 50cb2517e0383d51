//! # Core Framing Components
//!
//! Frame encoding, header decoding and receive-side reassembly.
//!
//! ## Components
//! - **Packet**: `Frame` plus the pure `encode` / `decode_header` functions
//! - **Codec**: Tokio encoder used by every sender loop
//! - **Reassembler**: Growable receive buffer yielding complete frames
//!
//! ## Wire Format
//! ```text
//! [TotalLength(4, u32 LE)] [TypeId(4, i32 LE)] [Body(TotalLength - 8)]
//! ```
//!
//! ## Limits
//! - Minimum frame: 8 bytes (empty body); shorter lengths are fatal
//! - Maximum frame: `max_frame_size` (1 MiB by default)
//! - Receive buffer grows by doubling up to `max_buffer_size`

pub mod codec;
pub mod packet;
pub mod reassembler;
