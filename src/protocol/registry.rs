//! Message type registry.
//!
//! Maps a numeric type id to the closure that turns a frame body into the
//! collaborator's message type `M`, usually an enum with one variant per type id.
//! The registry is filled once at startup through `&mut self` and then shared
//! read-only behind an `Arc`, so lookups on the receive path take no lock.
//!
//! ```
//! use framelink::protocol::registry::MessageRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Login { user: String }
//!
//! #[derive(Debug)]
//! enum Msg { Login(Login) }
//!
//! let mut registry = MessageRegistry::<Msg>::new();
//! registry.register_bincode(10001, "Login", Msg::Login).unwrap();
//! assert_eq!(registry.type_id_of("Login"), Some(10001));
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ProtocolError, Result};

/// Decoder from a frame body to a message; the error string becomes the
/// `MalformedBody` reason.
pub type Decoder<M> = Arc<dyn Fn(&[u8]) -> std::result::Result<M, String> + Send + Sync>;

struct Entry<M> {
    decoder: Decoder<M>,
    name: Option<String>,
    body_type: Option<TypeId>,
}

impl<M> Entry<M> {
    fn same_decoder(&self, decoder: &Decoder<M>, body_type: Option<TypeId>) -> bool {
        Arc::ptr_eq(&self.decoder, decoder) || (body_type.is_some() && self.body_type == body_type)
    }
}

/// Registry of known message types.
pub struct MessageRegistry<M> {
    entries: HashMap<i32, Entry<M>>,
    names: HashMap<String, i32>,
}

impl<M> Default for MessageRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for MessageRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("MessageRegistry").field("type_ids", &ids).finish()
    }
}

impl<M> MessageRegistry<M> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            names: HashMap::new(),
        }
    }

    /// Bind `type_id` to `decoder`.
    ///
    /// Registering the same `Arc` again is a no-op; a different decoder for an
    /// already bound id fails with [`ProtocolError::DuplicateRegistration`].
    pub fn register(&mut self, type_id: i32, decoder: Decoder<M>) -> Result<()> {
        self.insert(type_id, decoder, None, None)
    }

    /// Register a plain closure as the decoder for `type_id`.
    pub fn register_fn<F>(&mut self, type_id: i32, decoder: F) -> Result<()>
    where
        F: Fn(&[u8]) -> std::result::Result<M, String> + Send + Sync + 'static,
    {
        self.register(type_id, Arc::new(decoder))
    }

    /// Register a `bincode` body type under `type_id` and `name`.
    ///
    /// `wrap` lifts the decoded body into `M`, typically an enum variant
    /// constructor. Registering the same body type twice under one id is
    /// idempotent.
    pub fn register_bincode<T>(&mut self, type_id: i32, name: &str, wrap: fn(T) -> M) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        M: 'static,
    {
        let decoder: Decoder<M> = Arc::new(move |body: &[u8]| {
            bincode::deserialize::<T>(body)
                .map(wrap)
                .map_err(|e| e.to_string())
        });
        self.insert(type_id, decoder, Some(name), Some(TypeId::of::<T>()))
    }

    fn insert(
        &mut self,
        type_id: i32,
        decoder: Decoder<M>,
        name: Option<&str>,
        body_type: Option<TypeId>,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(&type_id) {
            if existing.same_decoder(&decoder, body_type) {
                return Ok(());
            }
            return Err(ProtocolError::DuplicateRegistration(type_id));
        }
        if let Some(name) = name {
            if let Some(&other) = self.names.get(name) {
                return Err(ProtocolError::Config(format!(
                    "Message name '{}' already bound to type id {}",
                    name, other
                )));
            }
            self.names.insert(name.to_string(), type_id);
        }
        debug!(type_id, name = name.unwrap_or(""), "Registered message type");
        self.entries.insert(
            type_id,
            Entry {
                decoder,
                name: name.map(str::to_string),
                body_type,
            },
        );
        Ok(())
    }

    /// Look up the decoder for `type_id`.
    pub fn resolve(&self, type_id: i32) -> Result<&Decoder<M>> {
        self.entries
            .get(&type_id)
            .map(|entry| &entry.decoder)
            .ok_or(ProtocolError::UnknownMessageType(type_id))
    }

    /// Resolve and run the decoder for one frame body.
    pub fn decode(&self, type_id: i32, body: &[u8]) -> Result<M> {
        let decoder = self.resolve(type_id)?;
        decoder(body).map_err(|reason| ProtocolError::MalformedBody { type_id, reason })
    }

    pub fn contains(&self, type_id: i32) -> bool {
        self.entries.contains_key(&type_id)
    }

    pub fn name_of(&self, type_id: i32) -> Option<&str> {
        self.entries.get(&type_id)?.name.as_deref()
    }

    pub fn type_id_of(&self, name: &str) -> Option<i32> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    #[derive(Debug, PartialEq)]
    enum Msg {
        Ping(Ping),
        Chat(Chat),
        Raw(Vec<u8>),
    }

    #[test]
    fn test_bincode_decode() {
        let mut registry = MessageRegistry::<Msg>::new();
        registry.register_bincode(1, "Ping", Msg::Ping).unwrap();

        let body = bincode::serialize(&Ping { seq: 42 }).unwrap();
        assert_eq!(registry.decode(1, &body).unwrap(), Msg::Ping(Ping { seq: 42 }));
        assert_eq!(registry.name_of(1), Some("Ping"));
        assert_eq!(registry.type_id_of("Ping"), Some(1));
    }

    #[test]
    fn test_unknown_type() {
        let registry = MessageRegistry::<Msg>::new();
        assert!(matches!(
            registry.resolve(99),
            Err(ProtocolError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn test_malformed_body() {
        let mut registry = MessageRegistry::<Msg>::new();
        registry.register_bincode(2, "Chat", Msg::Chat).unwrap();
        let err = registry.decode(2, &[0xFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedBody { type_id: 2, .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_same_decoder_is_idempotent() {
        let mut registry = MessageRegistry::<Msg>::new();
        let decoder: Decoder<Msg> = Arc::new(|body: &[u8]| Ok(Msg::Raw(body.to_vec())));
        registry.register(3, decoder.clone()).unwrap();
        registry.register(3, decoder).unwrap();
        registry.register_bincode(1, "Ping", Msg::Ping).unwrap();
        registry.register_bincode(1, "Ping", Msg::Ping).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_different_decoder_is_rejected() {
        let mut registry = MessageRegistry::<Msg>::new();
        registry.register_fn(3, |body: &[u8]| Ok(Msg::Raw(body.to_vec()))).unwrap();
        let err = registry
            .register_fn(3, |_: &[u8]| Err("never".to_string()))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateRegistration(3)));

        let err = registry.register_bincode(3, "Chat", Msg::Chat).unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateRegistration(3)));
    }
}
