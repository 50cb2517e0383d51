//! # Transport Layer
//!
//! TCP connection management for both sides of the protocol.
//!
//! ## Components
//! - **Connection**: `Session` handle, outbound sender loop, read helper
//! - **Server**: accept loop with a pooled receive buffer per connection
//! - **Client**: single reconnecting connection with an outbound queue
//! - **Backpressure**: suspends client reads while handlers fall behind
//!
//! ## Concurrency
//! Each connection has one reader and one sender; frames of a connection are
//! dispatched in order and its outbound frames are written in queue order.
//! Nothing is ordered across connections.

pub mod backpressure;
pub mod client;
pub mod connection;
pub mod server;
