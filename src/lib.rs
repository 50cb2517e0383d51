//! # framelink
//!
//! Length-prefixed binary messaging over TCP: frame codec, reassembly, typed
//! dispatch, a listening server and a reconnecting client with inbound
//! backpressure.
//!
//! ## Wire Format
//! ```text
//! [TotalLength(4, u32 LE)] [TypeId(4, i32 LE)] [Body(TotalLength - 8)]
//! ```
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use framelink::{Dispatcher, MessageRegistry, NetworkConfig, Server};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Ping { seq: u32 }
//!
//! #[derive(Debug)]
//! enum Msg { Ping(Ping) }
//!
//! # async fn run() -> framelink::Result<()> {
//! let mut registry = MessageRegistry::new();
//! registry.register_bincode(1, "Ping", Msg::Ping)?;
//!
//! let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry)));
//! dispatcher.register_handler(1, |session, msg| async move {
//!     let Msg::Ping(ping) = &*msg;
//!     session.send_message(1, &Ping { seq: ping.seq + 1 })
//! })?;
//!
//! let server = Server::bind(&NetworkConfig::default(), dispatcher).await?;
//! server.run().await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::packet::Frame;
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::{DispatchOutcome, Dispatcher, HandlerId};
pub use protocol::registry::MessageRegistry;
pub use transport::client::{ConnectionState, Connector};
pub use transport::connection::{CloseReason, ConnectionId, Session};
pub use transport::server::Server;
