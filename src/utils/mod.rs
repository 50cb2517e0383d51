//! # Utility Modules
//!
//! Supporting pieces used by the transport layer.
//!
//! ## Components
//! - **Buffer Arena**: Pooled receive slabs shared by server connections
//! - **Metrics**: Thread-safe observability counters
//! - **Logging**: Structured logging configuration
//! - **Panic**: Formatting of panic payloads caught from handlers

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod panic;

pub use buffer_pool::{ArenaBuffer, BufferArena};
pub use metrics::{Metrics, MetricsSnapshot};
