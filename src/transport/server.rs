//! # Server Listener
//!
//! Accepts TCP connections and runs one task per connection:
//!
//! ```text
//! accept -> on_connect -> [read -> reassemble -> dispatch]* -> close -> on_disconnect
//! ```
//!
//! Each connection draws its initial receive buffer from the shared
//! [`BufferArena`] and returns it when the connection ends. Frames are
//! dispatched inline on the connection task before the next read is issued, so a
//! slow handler throttles only its own connection; there is no separate inbound
//! backlog counter on this side.
//!
//! The server never reconnects: a peer close, I/O error or framing error ends
//! that one connection and leaves every other connection and the accept loop
//! running.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::config::{strict, NetworkConfig, ServerConfig};
use crate::core::reassembler::{FrameLimits, Reassembler};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::transport::connection::{
    read_chunk, record_dispatch, run_sender, wire_len, CloseReason, ConnectionId, SenderOptions,
    Session,
};
use crate::utils::buffer_pool::{ArenaBuffer, BufferArena};
use crate::utils::metrics::Metrics;
use crate::utils::panic::catch_hook;

/// Observer called once a connection is accepted.
pub type ConnectHook = Arc<dyn Fn(Session) + Send + Sync>;
/// Observer called once a connection has closed.
pub type DisconnectHook = Arc<dyn Fn(ConnectionId, CloseReason) + Send + Sync>;

/// Interval at which a graceful shutdown polls for drained connections.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection task needs, shared across all connections.
struct ConnectionContext<M> {
    dispatcher: Arc<Dispatcher<M>>,
    arena: BufferArena,
    metrics: Arc<Metrics>,
    limits: FrameLimits,
    sender: SenderOptions,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
    active: AtomicUsize,
}

/// TCP listener dispatching frames from every accepted connection.
pub struct Server<M> {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    dispatcher: Arc<Dispatcher<M>>,
    arena: BufferArena,
    metrics: Arc<Metrics>,
    limits: FrameLimits,
    sender: SenderOptions,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
    shutdown: CancellationToken,
}

impl<M: Send + Sync + 'static> Server<M> {
    /// Validate the server and transport sections and bind the listen socket.
    #[instrument(skip(config, dispatcher), fields(address = %config.server.address))]
    pub async fn bind(config: &NetworkConfig, dispatcher: Arc<Dispatcher<M>>) -> Result<Self> {
        let mut errors = config.server.validate();
        errors.extend(config.transport.validate());
        strict(errors)?;

        let listener = TcpListener::bind(&config.server.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening");

        Ok(Self {
            listener,
            local_addr,
            config: config.server.clone(),
            dispatcher,
            arena: BufferArena::new(config.server.arena_slabs, config.transport.initial_buffer_size),
            metrics: Arc::new(Metrics::new()),
            limits: FrameLimits::from(&config.transport),
            sender: SenderOptions {
                max_frame_size: config.transport.max_frame_size,
                yield_depth: config.client.send_queue_yield_depth,
            },
            on_connect: None,
            on_disconnect: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the connection-accepted observer.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Register the connection-closed observer.
    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionId, CloseReason) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    /// Token that stops the accept loop and closes every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until Ctrl-C, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received CTRL+C signal, shutting down"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for CTRL+C, running until cancelled");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Accept connections until `signal` resolves or the shutdown token fires,
    /// then close all connections and wait up to `shutdown_timeout` for them to
    /// finish.
    #[instrument(skip(self, signal), fields(address = %self.local_addr))]
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            config,
            dispatcher,
            arena,
            metrics,
            limits,
            sender,
            on_connect,
            on_disconnect,
            shutdown,
            ..
        } = self;

        let context = Arc::new(ConnectionContext {
            dispatcher,
            arena,
            metrics,
            limits,
            sender,
            on_connect,
            on_disconnect,
            active: AtomicUsize::new(0),
        });
        let limiter = Arc::new(Semaphore::new(config.max_connections));
        let mut next_id: u64 = 1;

        tokio::pin!(signal);
        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut signal => break,
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;
                _ = &mut signal => break,
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = ConnectionId::new(next_id);
                        next_id += 1;
                        let context = context.clone();
                        let cancel = shutdown.child_token();
                        context.active.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(
                            async move {
                                serve_connection(context.clone(), stream, id, peer, cancel).await;
                                context.active.fetch_sub(1, Ordering::SeqCst);
                                drop(permit);
                            }
                            .in_current_span(),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        shutdown.cancel();
        info!("Shutting down server. Waiting for connections to close...");

        let deadline = tokio::time::sleep(config.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            let connections = context.active.load(Ordering::SeqCst);
            if connections == 0 {
                info!("All connections closed, shutting down");
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    warn!(connections, "Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    debug!(connections, "Waiting for connections to close");
                }
            }
        }

        context.metrics.log_metrics();
        Ok(())
    }
}

/// Drive one accepted connection until it closes, then notify observers.
#[instrument(name = "connection", skip_all, fields(conn_id = %id, peer = %peer))]
async fn serve_connection<M: Send + Sync + 'static>(
    context: Arc<ConnectionContext<M>>,
    stream: TcpStream,
    id: ConnectionId,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id = %id, error = %e, "Failed to set TCP_NODELAY");
    }
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(id, peer, tx, cancel.clone(), context.limits.max_frame_size);

    // A failed write cancels the connection so the reader stops too.
    let sender = tokio::spawn({
        let metrics = context.metrics.clone();
        let options = context.sender;
        let cancel = cancel.clone();
        async move {
            let result = run_sender(id, writer, rx, options, metrics, cancel.clone()).await;
            cancel.cancel();
            result
        }
        .in_current_span()
    });

    context.metrics.connection_established();
    info!(conn_id = %id, %peer, "Connection accepted");
    if let Some(hook) = &context.on_connect {
        notify(id, || hook(session.clone()));
    }

    let mut reassembler = Reassembler::with_buffer(context.arena.acquire(), context.limits);
    let result = receive_loop(&context, &session, &mut reader, &mut reassembler, &cancel).await;
    drop(reassembler);

    cancel.cancel();
    let sender_result = match sender.await {
        Ok(result) => result,
        Err(join) => Err(ProtocolError::Handler(format!("sender task failed: {join}"))),
    };

    // A failed write is the real cause when the reader only saw the cancellation.
    let error = match (result, sender_result) {
        (Err(ProtocolError::Shutdown), Err(write_err)) => write_err,
        (Err(read_err), _) => read_err,
        (Ok(()), Err(write_err)) => write_err,
        (Ok(()), Ok(())) => ProtocolError::Shutdown,
    };
    let reason = CloseReason::from_error(&error);
    match &reason {
        CloseReason::PeerClosed | CloseReason::Local => {
            info!(conn_id = %id, %peer, reason = %reason, "Connection closed");
        }
        CloseReason::Error { kind, .. } => {
            context.metrics.connection_error();
            warn!(conn_id = %id, %peer, kind = *kind, error = %error, "Connection closed on error");
        }
    }

    context.metrics.connection_closed();
    if let Some(hook) = &context.on_disconnect {
        notify(id, || hook(id, reason));
    }
}

/// Read, reassemble and dispatch until the connection fails or is cancelled.
///
/// Always returns an error: the one that ended the connection.
async fn receive_loop<M: Send + Sync + 'static, R>(
    context: &ConnectionContext<M>,
    session: &Session,
    reader: &mut R,
    reassembler: &mut Reassembler<ArenaBuffer>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let id = session.id();
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProtocolError::Shutdown),
            read = read_chunk(reader, reassembler) => read?,
        };
        trace!(conn_id = %id, bytes = n, buffered = reassembler.len(), "Read chunk");

        for frame in reassembler.frames() {
            let frame = frame?;
            context.metrics.frame_received(wire_len(frame.body.len()));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProtocolError::Shutdown),
                outcome = context.dispatcher.dispatch(session, frame) => outcome,
            };
            record_dispatch(id, &context.metrics, outcome);
        }
    }
}

/// Run a lifecycle observer, logging instead of unwinding if it panics.
fn notify(id: ConnectionId, hook: impl FnOnce()) {
    if let Err(panic) = catch_hook(hook) {
        error!(conn_id = %id, panic = %panic, "Lifecycle observer panicked");
    }
}
