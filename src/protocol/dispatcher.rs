use crate::core::packet::Frame;
use crate::error::constants::{ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK};
use crate::error::{ProtocolError, Result};
use crate::protocol::registry::MessageRegistry;
use crate::transport::connection::Session;
use crate::utils::panic::format_panic;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

type HandlerFn<M> = dyn Fn(Session, Arc<M>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static;

/// Token returned by [`Dispatcher::register_handler`], used to remove the
/// callback again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What happened to one dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Decoded and passed to `invoked` callbacks, `failed` of which returned an
    /// error or panicked.
    Delivered { invoked: usize, failed: usize },
    /// Unknown type id or undecodable body; the frame was logged and dropped.
    Dropped,
}

/// Routes decoded frames to the callbacks registered for their type id.
///
/// Callbacks for one type id run one after another in registration order. A
/// callback that fails or panics is logged and the remaining ones still run, so
/// one faulty handler never stalls a connection.
pub struct Dispatcher<M> {
    registry: Arc<MessageRegistry<M>>,
    handlers: RwLock<HashMap<i32, Vec<(HandlerId, Arc<HandlerFn<M>>)>>>,
    next_id: AtomicU64,
}

impl<M> std::fmt::Debug for Dispatcher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<M: Send + Sync + 'static> Dispatcher<M> {
    pub fn new(registry: Arc<MessageRegistry<M>>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<MessageRegistry<M>> {
        &self.registry
    }

    /// Append `handler` to the callbacks for `type_id`.
    pub fn register_handler<F, Fut>(&self, type_id: i32, handler: F) -> Result<HandlerId>
    where
        F: Fn(Session, Arc<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: Arc<HandlerFn<M>> = Arc::new(move |session, message| handler(session, message).boxed());

        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Config(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        handlers.entry(type_id).or_default().push((id, boxed));
        debug!(type_id, handler_id = id.0, "Registered handler");
        Ok(id)
    }

    /// Remove one callback. Returns whether it was registered.
    pub fn unregister_handler(&self, type_id: i32, id: HandlerId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Config(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        let Some(list) = handlers.get_mut(&type_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&type_id);
        }
        Ok(removed)
    }

    /// Remove every callback for `type_id`, returning how many were dropped.
    pub fn unregister_all(&self, type_id: i32) -> Result<usize> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Config(ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        Ok(handlers.remove(&type_id).map_or(0, |list| list.len()))
    }

    pub fn handler_count(&self, type_id: i32) -> usize {
        self.handlers
            .read()
            .map(|handlers| handlers.get(&type_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Decode `frame` and run its callbacks.
    ///
    /// Unknown types and malformed bodies are logged and reported as
    /// [`DispatchOutcome::Dropped`]; they never fail the connection. The only
    /// error returned is a poisoned handler table.
    pub async fn dispatch(&self, session: &Session, frame: Frame) -> Result<DispatchOutcome> {
        let conn_id = session.id();
        let type_id = frame.type_id;

        let message = match self.registry.decode(type_id, &frame.body) {
            Ok(message) => Arc::new(message),
            Err(e) => {
                warn!(%conn_id, type_id, kind = e.kind(), error = %e, "Dropping frame");
                return Ok(DispatchOutcome::Dropped);
            }
        };

        // Snapshot so no lock is held across handler awaits.
        let callbacks: Vec<(HandlerId, Arc<HandlerFn<M>>)> = {
            let handlers = self
                .handlers
                .read()
                .map_err(|_| ProtocolError::Config(ERR_DISPATCHER_READ_LOCK.to_string()))?;
            handlers.get(&type_id).cloned().unwrap_or_default()
        };

        if callbacks.is_empty() {
            debug!(%conn_id, type_id, "No handler registered for message type");
        }

        let mut failed = 0;
        for (handler_id, callback) in &callbacks {
            let call = AssertUnwindSafe(async { callback(session.clone(), message.clone()).await })
                .catch_unwind()
                .await;
            match call {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    error!(%conn_id, type_id, handler_id = handler_id.0, kind = "HandlerException", error = %e, "Handler failed");
                }
                Err(panic) => {
                    failed += 1;
                    let panic = format_panic(panic);
                    error!(%conn_id, type_id, handler_id = handler_id.0, kind = "HandlerException", panic = %panic, "Handler panicked");
                }
            }
        }

        Ok(DispatchOutcome::Delivered {
            invoked: callbacks.len(),
            failed,
        })
    }
}
