//! # Client Connector
//!
//! Keeps exactly one outbound connection alive, reconnecting forever after a
//! fixed delay until [`Connector::shutdown`] is called.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!                     |                                          ^
//!                     +---- connect failed -> Reconnecting ------+
//!
//! shutdown() from any state -> Closed (terminal)
//! ```
//!
//! While connected, three tasks cooperate on one socket:
//! - the **reader** fills the reassembler and hands complete frames to the
//!   dispatch worker, pausing while the [`BackpressureController`] is suspended;
//! - the **dispatch worker** runs callbacks for one frame at a time, in arrival
//!   order, and reports each finished frame back to the controller;
//! - the **sender** drains the outbound queue through the frame codec.
//!
//! Any failure on any of them ends the connection and schedules a reconnect.
//! Frames still queued in either direction belong to the dead connection and
//! are discarded.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::config::{strict, ClientConfig, NetworkConfig};
use crate::core::packet::Frame;
use crate::core::reassembler::{FrameLimits, Reassembler};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::transport::backpressure::{BackpressureController, BackpressureSnapshot, Transition};
use crate::transport::connection::{
    read_chunk, record_dispatch, run_sender, wire_len, ConnectionId, SenderOptions, Session,
};
use crate::utils::metrics::Metrics;
use crate::utils::panic::catch_hook;

/// Lifecycle of a [`Connector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, `start` not called yet.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// A live connection is reading, dispatching and sending.
    Connected,
    /// Waiting out the reconnect delay after a failure.
    Reconnecting,
    /// Shut down; no further transitions.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

type StateHook = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type SessionHook = Arc<dyn Fn(Session) + Send + Sync>;

struct ConnectorInner<M> {
    config: ClientConfig,
    limits: FrameLimits,
    sender: SenderOptions,
    dispatcher: Arc<Dispatcher<M>>,
    metrics: Arc<Metrics>,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    backpressure: Mutex<Arc<BackpressureController>>,
    on_state_change: Option<StateHook>,
    on_connect: Option<SessionHook>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

/// Reconnecting client for one remote endpoint.
pub struct Connector<M> {
    inner: Arc<ConnectorInner<M>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<M> fmt::Debug for Connector<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("address", &self.inner.config.address)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<M: Send + Sync + 'static> Connector<M> {
    /// Validate the client and transport sections. Nothing is connected until
    /// [`start`](Self::start).
    pub fn new(config: &NetworkConfig, dispatcher: Arc<Dispatcher<M>>) -> Result<Self> {
        let mut errors = config.client.validate();
        errors.extend(config.transport.validate());
        strict(errors)?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let threshold = config.client.backpressure_high_threshold;
        Ok(Self {
            inner: Arc::new(ConnectorInner {
                config: config.client.clone(),
                limits: FrameLimits::from(&config.transport),
                sender: SenderOptions {
                    max_frame_size: config.transport.max_frame_size,
                    yield_depth: config.client.send_queue_yield_depth,
                },
                dispatcher,
                metrics: Arc::new(Metrics::new()),
                state,
                session: Mutex::new(None),
                backpressure: Mutex::new(Arc::new(BackpressureController::new(threshold))),
                on_state_change: None,
                on_connect: None,
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
            task: Mutex::new(None),
        })
    }

    /// Observe every state transition, in order. Must be set before `start`.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.on_state_change = Some(Arc::new(hook)),
            None => warn!(address = %self.inner.config.address, "on_state_change ignored, connector already started"),
        }
        self
    }

    /// Called with the new [`Session`] each time a connection is established.
    /// Must be set before `start`.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.on_connect = Some(Arc::new(hook)),
            None => warn!(address = %self.inner.config.address, "on_connect ignored, connector already started"),
        }
        self
    }

    /// Spawn the connect/reconnect loop. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ProtocolError::Shutdown);
        }
        let mut task = lock(&self.task);
        if task.is_some() {
            debug!(address = %self.inner.config.address, "Connector already started");
            return Ok(());
        }
        *task = Some(tokio::spawn(self.inner.clone().run().in_current_span()));
        Ok(())
    }

    /// Queue a frame on the current connection.
    ///
    /// Rejected with [`ProtocolError::NotConnected`] (and a warning) while no
    /// connection is up; nothing is buffered for later.
    pub fn send(&self, type_id: i32, body: impl Into<Bytes>) -> Result<()> {
        match self.session() {
            Some(session) => session.send(type_id, body),
            None => {
                warn!(address = %self.inner.config.address, type_id, state = %self.state(), "Send rejected, not connected");
                Err(ProtocolError::NotConnected)
            }
        }
    }

    /// Serialize `message` with `bincode` and queue it under `type_id`.
    pub fn send_message<T: Serialize>(&self, type_id: i32, message: &T) -> Result<()> {
        let body = bincode::serialize(message)?;
        self.send(type_id, body)
    }

    /// Handle to the live connection, if any.
    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session).clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn backpressure(&self) -> BackpressureSnapshot {
        lock(&self.inner.backpressure).snapshot()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Stop reconnecting, abandon the live connection and enter `Closed`.
    ///
    /// In-flight reads and writes are not waited on. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Connector task failed");
            }
        }
        self.inner.set_state(ConnectionState::Closed);
    }
}

impl<M> Drop for Connector<M> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<M: Send + Sync + 'static> ConnectorInner<M> {
    /// Move to `next`, never leaving `Closed`. Returns whether the state changed.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            debug!(address = %self.config.address, from = %previous, to = %next, "Connector state changed");
            if let Some(hook) = &self.on_state_change {
                if let Err(panic) = catch_hook(|| hook(next)) {
                    error!(address = %self.config.address, state = %next, panic = %panic, "State observer panicked");
                }
            }
        }
        changed
    }

    #[instrument(name = "connector", skip_all, fields(address = %self.config.address))]
    async fn run(self: Arc<Self>) {
        let delay = self.config.reconnect_delay;
        let mut attempts: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            if attempts > 0 {
                self.metrics.reconnect_attempt();
            }
            attempts += 1;

            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                connected = self.connect() => connected,
            };

            match connected {
                Ok(stream) => {
                    attempts = 1;
                    let error = self.drive(stream).await;
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    if matches!(error, ProtocolError::PeerClosed) {
                        info!(kind = error.kind(), "Connection closed by peer, reconnecting");
                    } else {
                        self.metrics.connection_error();
                        warn!(kind = error.kind(), error = %error, "Connection lost, reconnecting");
                    }
                }
                Err(e) => {
                    warn!(kind = e.kind(), error = %e, attempt = attempts, delay_ms = delay.as_millis() as u64, "Connect failed, retrying");
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Closed);
        info!("Connector closed");
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = &self.config.address;
        let attempt = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProtocolError::ConnectFailure {
                    addr: addr.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProtocolError::ConnectFailure {
                    addr: addr.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(stream)
    }

    /// Run one connection to completion and return the error that ended it.
    async fn drive(self: &Arc<Self>, stream: TcpStream) -> ProtocolError {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => return ProtocolError::Transport(e),
        };
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = self.shutdown.child_token();
        let (mut reader, writer) = stream.into_split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Session::new(id, peer, out_tx, cancel.clone(), self.limits.max_frame_size);

        let sender = tokio::spawn({
            let metrics = self.metrics.clone();
            let options = self.sender;
            let cancel = cancel.clone();
            async move {
                let result = run_sender(id, writer, out_rx, options, metrics, cancel.clone()).await;
                cancel.cancel();
                result
            }
            .in_current_span()
        });

        let backpressure = Arc::new(BackpressureController::new(self.config.backpressure_high_threshold));
        *lock(&self.backpressure) = backpressure.clone();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(dispatch_worker(
            self.dispatcher.clone(),
            session.clone(),
            frame_rx,
            backpressure.clone(),
            self.metrics.clone(),
            cancel.clone(),
        )
        .in_current_span());

        *lock(&self.session) = Some(session.clone());
        self.metrics.connection_established();
        self.set_state(ConnectionState::Connected);
        info!(conn_id = %id, %peer, "Connected");
        if let Some(hook) = &self.on_connect {
            if let Err(panic) = catch_hook(|| hook(session.clone())) {
                error!(conn_id = %id, %peer, panic = %panic, "Connect observer panicked");
            }
        }

        let mut reassembler = Reassembler::new(self.limits);
        let read_result = self
            .receive_loop(id, &mut reader, &mut reassembler, &frame_tx, &backpressure, &cancel)
            .await;

        lock(&self.session).take();
        cancel.cancel();
        drop(frame_tx);
        drop(reassembler);

        let send_result = match sender.await {
            Ok(result) => result,
            Err(join) => Err(ProtocolError::Handler(format!("sender task failed: {join}"))),
        };
        // Handlers still running are abandoned, not awaited.
        drop(worker);
        backpressure.reset();
        self.metrics.connection_closed();

        match (read_result, send_result) {
            (Err(ProtocolError::Shutdown), Err(write_err)) => write_err,
            (Err(read_err), _) => read_err,
            (Ok(()), Err(write_err)) => write_err,
            (Ok(()), Ok(())) => ProtocolError::Shutdown,
        }
    }

    async fn receive_loop<R>(
        &self,
        id: ConnectionId,
        reader: &mut R,
        reassembler: &mut Reassembler,
        frames: &mpsc::UnboundedSender<Frame>,
        backpressure: &BackpressureController,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        loop {
            if backpressure.is_suspended() {
                trace!(conn_id = %id, backlog = backpressure.backlog(), "Reads suspended");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProtocolError::Shutdown),
                    _ = backpressure.wait_resumed() => {}
                }
            }

            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProtocolError::Shutdown),
                read = read_chunk(reader, reassembler) => read?,
            };
            trace!(conn_id = %id, bytes = n, buffered = reassembler.len(), "Read chunk");

            for frame in reassembler.frames() {
                let frame = frame?;
                self.metrics.frame_received(wire_len(frame.body.len()));
                if backpressure.on_enqueued() == Transition::Suspended {
                    debug!(conn_id = %id, backlog = backpressure.backlog(), "Backlog above threshold, pausing reads");
                }
                frames.send(frame).map_err(|_| ProtocolError::Shutdown)?;
            }
        }
    }
}

/// Dispatch frames of one connection sequentially, in arrival order.
async fn dispatch_worker<M: Send + Sync + 'static>(
    dispatcher: Arc<Dispatcher<M>>,
    session: Session,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    backpressure: Arc<BackpressureController>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    let id = session.id();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = frames.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };
        let outcome = dispatcher.dispatch(&session, frame).await;
        record_dispatch(id, &metrics, outcome);
        if backpressure.on_completed() == Transition::Resumed {
            debug!(conn_id = %id, backlog = backpressure.backlog(), "Backlog drained, resuming reads");
        }
    }

    frames.close();
    let discarded = std::iter::from_fn(|| frames.try_recv().ok()).count();
    if discarded > 0 {
        warn!(conn_id = %id, discarded, "Dropping undispatched frames of closed connection");
    }
}
