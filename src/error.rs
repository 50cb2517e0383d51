//! # Error Types
//!
//! Error handling for the framing core, the dispatcher and both connection sides.
//!
//! ## Error Categories
//! - **Framing errors**: short headers, lengths below the header size, oversized
//!   frames and receive buffers that would outgrow their limit. These are fatal to
//!   the connection that produced them.
//! - **Dispatch errors**: unknown message types, bodies the registered decoder
//!   rejects and failing handlers. These are logged and the connection survives.
//! - **Transport errors**: I/O failures, peer close and connect failures. Fatal to
//!   the connection; the client connector answers them with a reconnect.
//!
//! ## Example Usage
//! ```rust
//! use framelink::error::{ProtocolError, Result};
//! use framelink::core::packet::decode_header;
//!
//! fn type_of(bytes: &[u8]) -> Result<i32> {
//!     let (_, type_id) = decode_header(bytes)?;
//!     Ok(type_id)
//! }
//!
//! assert!(matches!(type_of(&[1, 2, 3]), Err(ProtocolError::FrameHeaderTooShort(3))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";
    pub const ERR_SEND_QUEUE_CLOSED: &str = "Outbound queue closed";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame header too short: {0} bytes (need 8)")]
    FrameHeaderTooShort(usize),

    #[error("Frame length {0} is shorter than the 8-byte header")]
    FrameTooShort(u32),

    #[error("Frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: usize },

    #[error("Receive buffer overflow: {required} bytes required, maximum {max}")]
    BufferOverflow { required: usize, max: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    #[error("Message type {0} is already registered with a different decoder")]
    DuplicateRegistration(i32),

    #[error("Malformed body for message type {type_id}: {reason}")]
    MalformedBody { type_id: i32, reason: String },

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Shut down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Whether this error ends the connection it occurred on.
    ///
    /// Dispatch-level errors (unknown type, malformed body, handler failure) are
    /// recovered locally; everything on the framing or transport level is not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::UnknownMessageType(_)
                | ProtocolError::MalformedBody { .. }
                | ProtocolError::Handler(_)
                | ProtocolError::DuplicateRegistration(_)
                | ProtocolError::NotConnected
                | ProtocolError::Serialization(_)
                | ProtocolError::Config(_)
        )
    }

    /// Short, stable name of the error kind for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::FrameHeaderTooShort(_) => "FrameHeaderTooShort",
            ProtocolError::FrameTooShort(_) => "FrameTooShort",
            ProtocolError::FrameTooLarge { .. } => "FrameTooLarge",
            ProtocolError::BufferOverflow { .. } => "BufferOverflow",
            ProtocolError::UnknownMessageType(_) => "UnknownMessageType",
            ProtocolError::DuplicateRegistration(_) => "DuplicateRegistration",
            ProtocolError::MalformedBody { .. } => "MalformedBody",
            ProtocolError::Handler(_) => "HandlerException",
            ProtocolError::Transport(_) => "TransportError",
            ProtocolError::PeerClosed => "PeerClosed",
            ProtocolError::ConnectFailure { .. } => "ConnectFailure",
            ProtocolError::NotConnected => "NotConnected",
            ProtocolError::Shutdown => "Shutdown",
            ProtocolError::Serialization(_) => "Serialization",
            ProtocolError::Config(_) => "Config",
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
