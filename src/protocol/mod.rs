//! # Protocol Layer
//!
//! Turns complete frames into typed messages and routes them to collaborator
//! callbacks.
//!
//! ## Components
//! - **Registry**: type id to decoder (and name) mapping, filled at startup
//! - **Dispatcher**: ordered async callbacks per type id with failure isolation
//!
//! ## Error Policy
//! Unknown type ids, malformed bodies and failing callbacks are logged and the
//! frame is dropped; the connection keeps running.

pub mod dispatcher;
pub mod registry;

#[cfg(test)]
mod tests;
